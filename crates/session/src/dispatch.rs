use std::collections::VecDeque;
use std::time::Duration;

use snafu::ensure;
use tokio::time::Instant;

use super::channel::ChannelController;
use super::error::{ChannelNotReadySnafu, EmptyMessageSnafu, SessionError, SessionResult};
use super::events::{OutboundEvent, SendMessage};

/// Single bounded wait between a failed send and its one retry.
pub const DEFAULT_SEND_RETRY_DELAY: Duration = Duration::from_millis(500);

/// What the owner must do with a freshly submitted message.
#[derive(Debug)]
pub enum Submission<R> {
    /// Channel is connected: write the event now and answer `reply` with success.
    SendNow { event: OutboundEvent, reply: R },
    /// Parked until the retry deadline. When `request_connect` is set the owner must ask
    /// the transport for a connection attempt.
    Deferred { request_connect: bool },
}

/// Result of a retry that came due.
#[derive(Debug)]
pub struct RetryResult<R> {
    pub reply: R,
    pub result: SessionResult<OutboundEvent>,
}

#[derive(Debug)]
struct PendingSend<R> {
    event: OutboundEvent,
    due_at: Instant,
    reply: R,
}

/// Sends locally composed messages, retrying once after a bounded delay when the
/// channel is not connected.
///
/// `R` is whatever the owner uses to answer the caller (a oneshot sender in the session).
#[derive(Debug)]
pub struct OutboundDispatcher<R> {
    retry_delay: Duration,
    pending: VecDeque<PendingSend<R>>,
}

impl<R> OutboundDispatcher<R> {
    pub fn new(retry_delay: Duration) -> Self {
        Self {
            retry_delay,
            pending: VecDeque::new(),
        }
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn submit(
        &mut self,
        text: &str,
        controller: &mut ChannelController,
        now: Instant,
        reply: R,
    ) -> Result<Submission<R>, (SessionError, R)> {
        let event = match compose(text, controller) {
            Ok(event) => event,
            Err(error) => return Err((error, reply)),
        };

        if controller.state().is_connected() {
            return Ok(Submission::SendNow { event, reply });
        }

        let request_connect = controller.request_connect();
        tracing::warn!(
            conversation_id = %controller.conversation_id(),
            state = %controller.state(),
            request_connect,
            retry_in_ms = self.retry_delay.as_millis() as u64,
            "chat channel not connected; deferring send"
        );
        self.pending.push_back(PendingSend {
            event,
            due_at: now + self.retry_delay,
            reply,
        });
        Ok(Submission::Deferred { request_connect })
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.pending.iter().map(|pending| pending.due_at).min()
    }

    /// Resolves every retry whose deadline has passed. Each message is retried exactly once.
    pub fn take_due(&mut self, now: Instant, controller: &ChannelController) -> Vec<RetryResult<R>> {
        let mut due = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.pending.len());

        for pending in self.pending.drain(..) {
            if pending.due_at <= now {
                due.push(pending);
            } else {
                waiting.push_back(pending);
            }
        }
        self.pending = waiting;

        due.into_iter()
            .map(|pending| {
                let result = if controller.state().is_connected() {
                    Ok(pending.event)
                } else {
                    tracing::error!(
                        conversation_id = %controller.conversation_id(),
                        state = %controller.state(),
                        "chat channel still not connected; message not sent"
                    );
                    ChannelNotReadySnafu {
                        stage: "dispatch-retry",
                        conversation_id: controller.conversation_id().to_string(),
                    }
                    .fail()
                };
                RetryResult {
                    reply: pending.reply,
                    result,
                }
            })
            .collect()
    }

    /// Fails every parked send, e.g. because the channel is being torn down.
    pub fn fail_all(&mut self, conversation_id: &str) -> Vec<RetryResult<R>> {
        self.pending
            .drain(..)
            .map(|pending| RetryResult {
                reply: pending.reply,
                result: ChannelNotReadySnafu {
                    stage: "dispatch-teardown",
                    conversation_id: conversation_id.to_string(),
                }
                .fail(),
            })
            .collect()
    }
}

/// Builds the `sendMessage` command. Blank text is refused; non-blank text is sent as typed.
pub fn compose(text: &str, controller: &ChannelController) -> SessionResult<OutboundEvent> {
    ensure!(
        !text.trim().is_empty(),
        EmptyMessageSnafu {
            stage: "dispatch-compose"
        }
    );

    Ok(OutboundEvent::SendMessage(SendMessage {
        display_name: controller.identity().display_name.clone(),
        participant_id: controller.participant_id().clone(),
        conversation_id: controller.conversation_id().clone(),
        text: text.to_string(),
    }))
}
