use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SocketError {
    #[snafu(display("invalid chat endpoint '{endpoint}': {source}"))]
    InvalidEndpoint {
        stage: &'static str,
        endpoint: String,
        source: url::ParseError,
    },
    #[snafu(display("chat endpoint scheme '{scheme}' is not supported"))]
    UnsupportedScheme {
        stage: &'static str,
        scheme: String,
    },
    #[snafu(display("websocket connect failed on `{stage}`: {source}"))]
    Connect {
        stage: &'static str,
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[snafu(display("websocket connect timed out after {timeout_ms}ms"))]
    ConnectTimeout { stage: &'static str, timeout_ms: u64 },
    #[snafu(display("socket.io handshake failed on `{stage}`: {details}"))]
    Handshake {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("malformed socket.io packet on `{stage}`: {details}"))]
    Codec {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("socket.io payload is not valid JSON on `{stage}`: {source}"))]
    Json {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("websocket closed on `{stage}`: {reason}"))]
    Closed {
        stage: &'static str,
        reason: String,
    },
}

pub type SocketResult<T> = Result<T, SocketError>;
