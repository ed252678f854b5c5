//! Socket.IO WebSocket transport and HTTP history source for the chat session core.

pub mod backoff;
pub mod codec;
pub mod config;
pub mod error;
pub mod history;
pub mod socket;

pub use backoff::ReconnectPolicy;
pub use config::TransportConfig;
pub use error::{SocketError, SocketResult};
pub use history::HttpHistorySource;
pub use socket::SocketIoTransport;
