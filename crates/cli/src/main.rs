use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use kerbside::console::ConsoleRenderer;
use kerbside::interrupt::{SendOutcome, send_or_interrupt};
use kerbside::settings::{ChatSettings, SettingsError, SettingsStore};
use kerbside_session::{
    ChatSession, ConversationId, SessionError, SessionParts, SessionSnapshot,
};
use kerbside_transport::{HttpHistorySource, SocketError, SocketIoTransport};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kerbside", version, about = "Chat with the other side of a pickup")]
struct Cli {
    /// Settings file to read instead of the per-user default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a conversation and chat over stdin/stdout.
    Chat(ChatArgs),
    /// Print the effective settings.
    Settings {
        /// Write the effective settings back to the settings file.
        #[arg(long)]
        save: bool,
    },
}

#[derive(Args, Debug)]
struct ChatArgs {
    /// Conversation (pickup request) to open.
    #[arg(long)]
    conversation: String,
    #[arg(long)]
    participant: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    endpoint: Option<String>,
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("settings error on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("invalid chat endpoint on `{stage}`: {source}"))]
    Endpoint {
        stage: &'static str,
        source: SocketError,
    },
    #[snafu(display("chat session error on `{stage}`: {source}"))]
    Session {
        stage: &'static str,
        source: SessionError,
    },
    #[snafu(display("no participant configured, pass --participant or set KERBSIDE_PARTICIPANT_ID"))]
    MissingParticipant { stage: &'static str },
    #[snafu(display("failed to read stdin on `{stage}`: {source}"))]
    Stdin {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to render settings on `{stage}`: {source}"))]
    Render {
        stage: &'static str,
        source: serde_json::Error,
    },
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = match cli.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };

    let result = match cli.command {
        Command::Chat(args) => run_chat(&store, args).await,
        Command::Settings { save } => run_settings(&store, save),
    };

    let code = match result {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("error: {error}");
            1
        }
    };
    // A pending stdin read would otherwise hold the runtime open until the next newline.
    std::process::exit(code);
}

fn apply_overrides(mut settings: ChatSettings, args: &ChatArgs) -> ChatSettings {
    if let Some(endpoint) = &args.endpoint {
        settings.endpoint = endpoint.clone();
    }
    if let Some(participant) = &args.participant {
        settings.participant_id = participant.clone();
    }
    if let Some(name) = &args.name {
        settings.display_name = name.clone();
    }
    settings.normalized()
}

async fn run_chat(store: &SettingsStore, args: ChatArgs) -> Result<(), CliError> {
    let settings = apply_overrides((*store.settings()).clone(), &args);
    let identity = settings.identity().context(MissingParticipantSnafu {
        stage: "chat-identity",
    })?;
    if !identity.can_join() {
        tracing::warn!("no display name configured; history is shown but the chat stays offline");
    }
    let conversation_id = ConversationId::parse(&args.conversation).context(SessionSnafu {
        stage: "chat-conversation-id",
    })?;
    let transport_config = settings.to_transport_config().context(EndpointSnafu {
        stage: "chat-endpoint",
    })?;

    let SessionParts { handle, worker } = ChatSession::start(
        settings.to_session_config(),
        Arc::new(SocketIoTransport::new(transport_config.clone())),
        Arc::new(HttpHistorySource::new(transport_config)),
    );
    let worker = tokio::spawn(worker);

    let local_id = identity.id.clone();
    handle
        .set_participant(Some(identity))
        .context(SessionSnafu {
            stage: "chat-set-participant",
        })?;
    handle
        .open_conversation(Some(conversation_id))
        .context(SessionSnafu {
            stage: "chat-open-conversation",
        })?;

    let printer = tokio::spawn(print_snapshots(
        handle.subscribe(),
        ConsoleRenderer::new(Some(local_id)),
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context(StdinSnafu { stage: "chat-read-line" })? else {
                    handle.close().await;
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let ctrl_c = async {
                    let _ = tokio::signal::ctrl_c().await;
                };
                match send_or_interrupt(&handle, line, ctrl_c).await {
                    SendOutcome::Finished(Ok(())) => {}
                    SendOutcome::Finished(Err(SessionError::SessionClosed { .. })) => break,
                    SendOutcome::Finished(Err(error)) => eprintln!("{error}"),
                    SendOutcome::Interrupted => {
                        handle.close_for_exit().await;
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                handle.close_for_exit().await;
                break;
            }
        }
    }

    drop(handle);
    let _ = worker.await;
    let _ = printer.await;
    Ok(())
}

async fn print_snapshots(
    mut snapshots: watch::Receiver<SessionSnapshot>,
    mut renderer: ConsoleRenderer,
) {
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        for line in renderer.render(&snapshot) {
            println!("{line}");
        }
        if snapshot.closed || snapshots.changed().await.is_err() {
            break;
        }
    }
}

fn run_settings(store: &SettingsStore, save: bool) -> Result<(), CliError> {
    let settings = store.settings();
    let rendered = serde_json::to_string_pretty(settings.as_ref()).context(RenderSnafu {
        stage: "settings-render",
    })?;
    println!("{rendered}");

    if save {
        store
            .update((*settings).clone())
            .context(SettingsSnafu {
                stage: "settings-save",
            })?;
        println!("saved to {}", store.config_path().display());
    }
    Ok(())
}
