use std::fmt;

use chrono::{DateTime, Utc};

use super::events::{InboundEvent, JoinChat, LeaveChat, MessageReceived, OutboundEvent};
use super::ids::{ConversationId, ParticipantId};
use super::message::{MessageOrigin, MessageRecord, ParticipantIdentity};
use super::transport::TransportEvent;

/// Connection state of the channel for one conversation view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        formatter.write_str(label)
    }
}

/// State transition input for the channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelTransition {
    RequestConnect,
    TransportConnected,
    TransportDropped { will_reconnect: bool },
    TransportReconnected,
    ReconnectExhausted,
    Teardown,
}

/// Rejection reason for illegal channel transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelTransitionRejection {
    /// A connect acknowledgment arrived while nothing was being connected.
    NotConnecting { state: ChannelState },
    /// A drop or exhaustion notice arrived for a channel that is already down.
    NoActiveConnection,
}

pub type ChannelTransitionResult = Result<ChannelState, ChannelTransitionRejection>;

impl ChannelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Applies one transition deterministically.
    ///
    /// `RequestConnect` and `Teardown` are idempotent. Transport notices must match a state
    /// in which they make sense; stale notices are rejected rather than applied.
    pub fn apply(&self, transition: ChannelTransition) -> ChannelTransitionResult {
        match transition {
            ChannelTransition::RequestConnect => Ok(self.apply_request_connect()),
            ChannelTransition::TransportConnected | ChannelTransition::TransportReconnected => {
                self.apply_connected()
            }
            ChannelTransition::TransportDropped { will_reconnect } => {
                self.apply_dropped(will_reconnect)
            }
            ChannelTransition::ReconnectExhausted => self.apply_exhausted(),
            ChannelTransition::Teardown => Ok(Self::Disconnected),
        }
    }

    fn apply_request_connect(&self) -> ChannelState {
        match self {
            Self::Disconnected => Self::Connecting,
            Self::Connecting | Self::Connected | Self::Reconnecting => *self,
        }
    }

    fn apply_connected(&self) -> ChannelTransitionResult {
        match self {
            Self::Connecting | Self::Reconnecting => Ok(Self::Connected),
            Self::Connected | Self::Disconnected => {
                Err(ChannelTransitionRejection::NotConnecting { state: *self })
            }
        }
    }

    fn apply_dropped(&self, will_reconnect: bool) -> ChannelTransitionResult {
        match (self, will_reconnect) {
            (Self::Disconnected, _) => Err(ChannelTransitionRejection::NoActiveConnection),
            (Self::Connected | Self::Reconnecting, true) => Ok(Self::Reconnecting),
            // The transport keeps retrying the initial connect; that is still `Connecting`.
            (Self::Connecting, true) => Ok(Self::Connecting),
            (_, false) => Ok(Self::Disconnected),
        }
    }

    fn apply_exhausted(&self) -> ChannelTransitionResult {
        match self {
            Self::Disconnected => Err(ChannelTransitionRejection::NoActiveConnection),
            Self::Connecting | Self::Connected | Self::Reconnecting => Ok(Self::Disconnected),
        }
    }
}

/// Side effects the controller asks its owner to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerOutput {
    Emit(OutboundEvent),
    Candidate(MessageRecord),
    Unavailable { reason: String },
}

/// Owns the channel state machine for one `(participant, conversation)` membership.
#[derive(Debug, Clone)]
pub struct ChannelController {
    identity: ParticipantIdentity,
    conversation_id: ConversationId,
    state: ChannelState,
    joins_emitted: u64,
    left_this_lifetime: bool,
}

impl ChannelController {
    pub fn new(identity: ParticipantIdentity, conversation_id: ConversationId) -> Self {
        Self {
            identity,
            conversation_id,
            state: ChannelState::Disconnected,
            joins_emitted: 0,
            left_this_lifetime: false,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.identity.id
    }

    pub fn identity(&self) -> &ParticipantIdentity {
        &self.identity
    }

    #[cfg(test)]
    pub fn joins_emitted(&self) -> u64 {
        self.joins_emitted
    }

    /// Marks a connection as requested. Returns true when this moved the channel out of
    /// `Disconnected`, i.e. when the caller should actually ask the transport to connect.
    pub fn request_connect(&mut self) -> bool {
        let before = self.state;
        self.transition(ChannelTransition::RequestConnect);
        before == ChannelState::Disconnected && self.state == ChannelState::Connecting
    }

    pub fn on_transport_event(
        &mut self,
        event: TransportEvent,
        received_at: DateTime<Utc>,
    ) -> Vec<ControllerOutput> {
        match event {
            TransportEvent::Connected => self.on_connected("connect"),
            TransportEvent::Reconnected { attempts } => {
                tracing::info!(
                    conversation_id = %self.conversation_id,
                    attempts,
                    "chat channel reconnected"
                );
                self.on_connected("reconnect")
            }
            TransportEvent::Disconnected {
                reason,
                will_reconnect,
            } => {
                tracing::info!(
                    conversation_id = %self.conversation_id,
                    reason = %reason,
                    will_reconnect,
                    "chat channel disconnected"
                );
                self.transition(ChannelTransition::TransportDropped { will_reconnect });
                Vec::new()
            }
            TransportEvent::ConnectError { message } => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    state = %self.state,
                    error = %message,
                    "chat channel connection error"
                );
                Vec::new()
            }
            TransportEvent::ReconnectAttempt { attempt } => {
                tracing::debug!(
                    conversation_id = %self.conversation_id,
                    attempt,
                    "attempting chat channel reconnect"
                );
                if self.state.is_connected() {
                    self.transition(ChannelTransition::TransportDropped {
                        will_reconnect: true,
                    });
                }
                Vec::new()
            }
            TransportEvent::ReconnectFailed => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    "chat channel failed to reconnect after all attempts"
                );
                self.transition(ChannelTransition::ReconnectExhausted);
                vec![ControllerOutput::Unavailable {
                    reason: "failed to reconnect after all attempts".to_string(),
                }]
            }
            TransportEvent::Inbound(inbound) => self.on_inbound(inbound, received_at),
        }
    }

    /// The transport's event stream ended without a teardown.
    pub fn on_transport_closed(&mut self) -> Vec<ControllerOutput> {
        if self.state == ChannelState::Disconnected {
            return Vec::new();
        }

        tracing::warn!(
            conversation_id = %self.conversation_id,
            state = %self.state,
            "chat transport stopped unexpectedly"
        );
        self.state = ChannelState::Disconnected;
        vec![ControllerOutput::Unavailable {
            reason: "transport stopped unexpectedly".to_string(),
        }]
    }

    /// Produces the leave signal if one is owed for the current connection lifetime.
    pub fn take_leave_signal(&mut self) -> Option<OutboundEvent> {
        if !self.state.is_connected() || self.left_this_lifetime {
            return None;
        }

        self.left_this_lifetime = true;
        Some(OutboundEvent::LeaveChat(LeaveChat {
            participant_id: self.identity.id.clone(),
            conversation_id: self.conversation_id.clone(),
        }))
    }

    pub fn teardown(&mut self) {
        self.transition(ChannelTransition::Teardown);
    }

    fn join_signal(&self) -> OutboundEvent {
        OutboundEvent::JoinChat(JoinChat {
            display_name: self.identity.display_name.clone(),
            participant_id: self.identity.id.clone(),
            conversation_id: self.conversation_id.clone(),
        })
    }

    fn on_connected(&mut self, cause: &'static str) -> Vec<ControllerOutput> {
        if !self.transition(ChannelTransition::TransportConnected) {
            return Vec::new();
        }

        // Membership is not assumed to survive a reconnect, so every connect re-joins.
        self.left_this_lifetime = false;
        self.joins_emitted += 1;
        tracing::info!(
            conversation_id = %self.conversation_id,
            participant_id = %self.identity.id,
            cause,
            join = self.joins_emitted,
            "joining chat channel"
        );
        vec![ControllerOutput::Emit(self.join_signal())]
    }

    fn on_inbound(
        &mut self,
        inbound: InboundEvent,
        received_at: DateTime<Utc>,
    ) -> Vec<ControllerOutput> {
        match inbound {
            InboundEvent::MessageReceived(message) => self
                .candidate_from(message, received_at)
                .map(ControllerOutput::Candidate)
                .into_iter()
                .collect(),
            InboundEvent::UserJoined(joined) => {
                tracing::debug!(
                    conversation_id = %self.conversation_id,
                    participant_id = %joined.participant_id,
                    display_name = %joined.display_name,
                    "participant joined the chat"
                );
                Vec::new()
            }
            InboundEvent::UserLeft(left) => {
                tracing::debug!(
                    conversation_id = %self.conversation_id,
                    participant_id = %left.participant_id,
                    reason = left.reason.as_deref().unwrap_or("unknown"),
                    "participant left the chat"
                );
                Vec::new()
            }
        }
    }

    fn candidate_from(
        &self,
        message: MessageReceived,
        received_at: DateTime<Utc>,
    ) -> Option<MessageRecord> {
        let sender_id = match ParticipantId::parse(&message.sender_id) {
            Ok(sender_id) => sender_id,
            Err(error) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    error = %error,
                    "dropping live message without a sender id"
                );
                return None;
            }
        };

        Some(MessageRecord::new(
            sender_id,
            message.display_name,
            message.text,
            message.timestamp.unwrap_or(received_at),
            MessageOrigin::Live,
        ))
    }

    /// Applies a transition, logging and ignoring rejections. Returns whether it applied.
    fn transition(&mut self, transition: ChannelTransition) -> bool {
        match self.state.apply(transition) {
            Ok(next) => {
                if next != self.state {
                    tracing::debug!(
                        conversation_id = %self.conversation_id,
                        from = %self.state,
                        to = %next,
                        "chat channel state changed"
                    );
                }
                self.state = next;
                true
            }
            Err(rejection) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    state = %self.state,
                    transition = ?transition,
                    rejection = ?rejection,
                    "ignoring illegal chat channel transition"
                );
                false
            }
        }
    }
}
