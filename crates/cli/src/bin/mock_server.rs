use std::net::SocketAddr;

use clap::Parser;
use snafu::{ResultExt, Snafu};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kerbside-mock-server", about = "Local Socket.IO chat backend for kerbside")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:4000")]
    bind: SocketAddr,
}

#[derive(Debug, Snafu)]
enum MockServerError {
    #[snafu(display("failed to bind {address} on `{stage}`: {source}"))]
    Bind {
        stage: &'static str,
        address: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("mock backend stopped on `{stage}`: {source}"))]
    Serve {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[tokio::main]
async fn main() -> Result<(), MockServerError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let listener = TcpListener::bind(cli.bind).await.context(BindSnafu {
        stage: "mock-bind",
        address: cli.bind,
    })?;
    tracing::info!(address = %cli.bind, "mock chat backend listening");

    axum::serve(listener, kerbside::mock_backend::router())
        .await
        .context(ServeSnafu {
            stage: "mock-serve",
        })
}
