//! Sends that give way to an interrupt.

use std::future::Future;

use kerbside_session::{ChatSessionHandle, SessionResult};

#[derive(Debug)]
pub enum SendOutcome {
    Finished(SessionResult<()>),
    /// The interrupt fired first; the pending send was dropped.
    Interrupted,
}

/// Submits `text` but returns as soon as `interrupt` completes, even while the send is
/// still deferred waiting for the channel.
pub async fn send_or_interrupt(
    handle: &ChatSessionHandle,
    text: String,
    interrupt: impl Future<Output = ()>,
) -> SendOutcome {
    tokio::select! {
        sent = handle.send(text) => SendOutcome::Finished(sent),
        () = interrupt => {
            tracing::debug!("send interrupted");
            SendOutcome::Interrupted
        }
    }
}
