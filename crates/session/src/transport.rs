use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::error::{CommandChannelClosedSnafu, TransportResult};
use super::events::{InboundEvent, OutboundEvent};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TransportWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Lifecycle and delivery notifications produced by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// First successful connection, or one made after an explicit connect request.
    Connected,
    Disconnected {
        reason: String,
        will_reconnect: bool,
    },
    ConnectError {
        message: String,
    },
    ReconnectAttempt {
        attempt: u32,
    },
    Reconnected {
        attempts: u32,
    },
    /// The transport has given up retrying; only an explicit connect request revives it.
    ReconnectFailed,
    Inbound(InboundEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Connect,
    Emit(OutboundEvent),
    Close,
}

/// Sending half used to drive a transport worker.
#[derive(Debug, Clone)]
pub struct TransportCommands {
    tx: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportCommands {
    pub fn new(tx: mpsc::UnboundedSender<TransportCommand>) -> Self {
        Self { tx }
    }

    pub fn connect(&self) -> TransportResult<()> {
        self.send(TransportCommand::Connect, "transport-connect")
    }

    pub fn emit(&self, event: OutboundEvent) -> TransportResult<()> {
        self.send(TransportCommand::Emit(event), "transport-emit")
    }

    pub fn close(&self) -> TransportResult<()> {
        self.send(TransportCommand::Close, "transport-close")
    }

    fn send(&self, command: TransportCommand, stage: &'static str) -> TransportResult<()> {
        self.tx
            .send(command)
            .map_err(|_| CommandChannelClosedSnafu { stage }.build())
    }
}

/// Reference-counted claim on an open channel. Only the last holder may close it.
#[derive(Debug, Clone, Default)]
pub struct ChannelLease {
    holders: Arc<()>,
}

impl ChannelLease {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_sole_holder(&self) -> bool {
        Arc::strong_count(&self.holders) == 1
    }
}

/// Everything a caller needs to run and talk to one channel.
///
/// `worker` must be spawned by the caller; it owns the connection and exits after `Close`.
pub struct TransportHandle {
    pub commands: TransportCommands,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub lease: ChannelLease,
    pub worker: TransportWorker,
}

pub trait Transport: Send + Sync {
    /// Opens a channel. Implementations connect automatically once the worker starts.
    fn open(&self) -> TransportResult<TransportHandle>;
}

pub fn make_transport_channels() -> (
    TransportCommands,
    mpsc::UnboundedReceiver<TransportCommand>,
    mpsc::UnboundedSender<TransportEvent>,
    mpsc::UnboundedReceiver<TransportEvent>,
) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (TransportCommands::new(command_tx), command_rx, event_tx, event_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_tracks_other_holders() {
        let lease = ChannelLease::new();
        assert!(lease.is_sole_holder());

        let shared = lease.clone();
        assert!(!lease.is_sole_holder());

        drop(shared);
        assert!(lease.is_sole_holder());
    }

    #[test]
    fn commands_fail_once_worker_is_gone() {
        let (commands, command_rx, _event_tx, _event_rx) = make_transport_channels();
        assert!(commands.connect().is_ok());

        drop(command_rx);
        assert!(matches!(
            commands.close(),
            Err(crate::error::TransportError::CommandChannelClosed {
                stage: "transport-close"
            })
        ));
    }
}
