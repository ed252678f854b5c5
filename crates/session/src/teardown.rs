use std::fmt;

use super::channel::ChannelController;
use super::error::{SessionError, TeardownFailedSnafu, TransportResult};
use super::events::OutboundEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    ViewClosed,
    ConversationChanged,
    /// Same participant, new display name: the channel is rejoined under the new name.
    IdentityChanged,
    ProcessExit,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ViewClosed => "view-closed",
            Self::ConversationChanged => "conversation-changed",
            Self::IdentityChanged => "identity-changed",
            Self::ProcessExit => "process-exit",
        };
        formatter.write_str(label)
    }
}

/// The parts of an open channel that teardown needs to touch.
pub trait ChannelPort {
    fn emit(&mut self, event: OutboundEvent) -> TransportResult<()>;

    /// Drops every event subscription registered for the controller and returns how many
    /// were still active.
    fn unsubscribe_all(&mut self) -> usize;

    /// Closes the channel if no other view holds it. Returns whether it was closed.
    fn release(&mut self) -> TransportResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub reason: TeardownReason,
    pub leave_emitted: bool,
    pub handlers_released: usize,
    pub channel_closed: bool,
    /// Set when an earlier teardown already ran; nothing was touched.
    pub skipped: bool,
}

impl TeardownReport {
    fn skipped(reason: TeardownReason) -> Self {
        Self {
            reason,
            leave_emitted: false,
            handlers_released: 0,
            channel_closed: false,
            skipped: true,
        }
    }
}

/// Runs the leave/unsubscribe/release sequence at most once per channel.
#[derive(Debug, Default)]
pub struct TeardownCoordinator {
    completed: Option<TeardownReason>,
}

impl TeardownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never fails: problems are logged and the remaining steps still run.
    pub fn run(
        &mut self,
        reason: TeardownReason,
        controller: &mut ChannelController,
        port: &mut dyn ChannelPort,
    ) -> TeardownReport {
        if let Some(first) = self.completed {
            tracing::debug!(
                conversation_id = %controller.conversation_id(),
                reason = %reason,
                first = %first,
                "chat channel already torn down"
            );
            return TeardownReport::skipped(reason);
        }
        self.completed = Some(reason);

        let mut failures = Vec::new();

        let leave_emitted = match controller.take_leave_signal() {
            Some(leave) => match port.emit(leave) {
                Ok(()) => true,
                Err(error) => {
                    failures.push(format!("leave: {error}"));
                    false
                }
            },
            None => false,
        };

        let handlers_released = port.unsubscribe_all();

        let channel_closed = match port.release() {
            Ok(closed) => closed,
            Err(error) => {
                failures.push(format!("release: {error}"));
                false
            }
        };

        controller.teardown();

        if !failures.is_empty() {
            let error: SessionError = TeardownFailedSnafu {
                stage: "teardown-run",
                conversation_id: controller.conversation_id().to_string(),
                details: failures.join("; "),
            }
            .build();
            tracing::warn!(error = %error, reason = %reason, "chat channel teardown incomplete");
        }

        tracing::info!(
            conversation_id = %controller.conversation_id(),
            participant_id = %controller.participant_id(),
            reason = %reason,
            leave_emitted,
            handlers_released,
            channel_closed,
            "chat channel torn down"
        );

        TeardownReport {
            reason,
            leave_emitted,
            handlers_released,
            channel_closed,
            skipped: false,
        }
    }
}
