use std::time::Duration;

use kerbside_session::ConversationId;
use snafu::{ResultExt, ensure};
use url::Url;

use super::backoff::ReconnectPolicy;
use super::error::{InvalidEndpointSnafu, SocketResult, UnsupportedSchemeSnafu};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const SOCKET_IO_PATH: &str = "socket.io";

/// Where the chat backend lives and how hard to try reaching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    endpoint: Url,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
}

impl TransportConfig {
    /// Accepts `http`, `https`, `ws` or `wss` base URLs.
    pub fn new(endpoint: &str) -> SocketResult<Self> {
        let endpoint = Url::parse(endpoint.trim()).context(InvalidEndpointSnafu {
            stage: "transport-config-parse",
            endpoint: endpoint.to_string(),
        })?;
        ensure!(
            matches!(endpoint.scheme(), "http" | "https" | "ws" | "wss"),
            UnsupportedSchemeSnafu {
                stage: "transport-config-scheme",
                scheme: endpoint.scheme().to_string(),
            }
        );

        Ok(Self {
            endpoint,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// `ws(s)://host/socket.io/?EIO=4&transport=websocket`
    pub fn socket_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        // Switching between special schemes cannot fail.
        let _ = url.set_scheme(scheme);
        url.set_path(&format!("/{SOCKET_IO_PATH}/"));
        url.set_query(Some("EIO=4&transport=websocket"));
        url.set_fragment(None);
        url
    }

    /// `http(s)://host[/base]/messages/{conversation}`
    pub fn history_url(&self, conversation_id: &ConversationId) -> Url {
        let mut url = self.endpoint.clone();
        let scheme = match url.scheme() {
            "wss" | "https" => "https",
            _ => "http",
        };
        let _ = url.set_scheme(scheme);
        url.set_query(None);
        url.set_fragment(None);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("messages")
                .push(conversation_id.as_str());
        }
        url
    }
}
