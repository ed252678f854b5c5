//! Real-time chat session core: history hydration, channel lifecycle, merge/dedup,
//! outbound dispatch and teardown for one two-party conversation.

pub mod channel;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod history;
pub mod ids;
pub mod merge;
pub mod message;
pub mod session;
pub mod teardown;
pub mod transport;

pub use channel::{ChannelController, ChannelState, ChannelTransition, ControllerOutput};
pub use error::{
    BoxError, HistoryError, HistoryResult, SessionError, SessionResult, TransportError,
    TransportResult,
};
pub use events::{InboundEvent, OutboundEvent};
pub use history::{HistoryEntry, HistorySource};
pub use ids::{ConversationId, ParticipantId};
pub use merge::{ConversationState, MergeOutcome};
pub use message::{MessageOrigin, MessageRecord, ParticipantIdentity};
pub use session::{
    ChatSession, ChatSessionHandle, HistoryStatus, SessionConfig, SessionParts, SessionSnapshot,
};
pub use teardown::TeardownReason;
pub use transport::{
    BoxFuture, ChannelLease, Transport, TransportCommand, TransportCommands, TransportEvent,
    TransportHandle,
};
