use snafu::Snafu;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("{id_type} must not be blank"))]
    BlankId {
        stage: &'static str,
        id_type: &'static str,
    },
    #[snafu(display("history for conversation '{conversation_id}' is unavailable: {source}"))]
    HistoryUnavailable {
        stage: &'static str,
        conversation_id: String,
        source: HistoryError,
    },
    #[snafu(display("chat channel is unavailable: {reason}"))]
    ChannelUnavailable {
        stage: &'static str,
        reason: String,
    },
    #[snafu(display("message not sent, please retry: channel for '{conversation_id}' is not ready"))]
    ChannelNotReady {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("teardown of conversation '{conversation_id}' failed: {details}"))]
    TeardownFailed {
        stage: &'static str,
        conversation_id: String,
        details: String,
    },
    #[snafu(display("refusing to send an empty message"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("no active conversation with a known participant"))]
    NoActiveConversation { stage: &'static str },
    #[snafu(display("chat session has already shut down"))]
    SessionClosed { stage: &'static str },
    #[snafu(display("failed to open chat transport on `{stage}`: {source}"))]
    TransportOpen {
        stage: &'static str,
        source: TransportError,
    },
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HistoryError {
    #[snafu(display("history request failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        source: BoxError,
    },
    #[snafu(display("history endpoint returned status {status}: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("history payload could not be decoded on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        source: serde_json::Error,
    },
}

pub type HistoryResult<T> = Result<T, HistoryError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("transport could not be opened on `{stage}`: {details}"))]
    Open {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("transport command channel closed on `{stage}`"))]
    CommandChannelClosed { stage: &'static str },
}

pub type TransportResult<T> = Result<T, TransportError>;
