use kerbside_session::error::{DecodeSnafu, RequestSnafu, StatusSnafu};
use kerbside_session::{
    BoxError, BoxFuture, ConversationId, HistoryEntry, HistoryResult, HistorySource,
};
use serde::Deserialize;
use serde_json::Value;
use snafu::{ResultExt, ensure};

use super::config::TransportConfig;

#[derive(Debug, Deserialize)]
struct HistoryEnvelope {
    #[serde(default)]
    data: Option<Vec<Value>>,
}

impl HistoryEnvelope {
    /// Rows are decoded one at a time so a single bad row does not cost the whole history.
    fn into_entries(self) -> Vec<HistoryEntry> {
        self.data
            .unwrap_or_default()
            .into_iter()
            .filter_map(|row| match serde_json::from_value::<HistoryEntry>(row) {
                Ok(entry) => Some(entry),
                Err(error) => {
                    tracing::warn!(error = %error, "skipping undecodable history row");
                    None
                }
            })
            .collect()
    }
}

/// Fetches persisted conversation history over HTTP.
#[derive(Debug, Clone)]
pub struct HttpHistorySource {
    client: reqwest::Client,
    config: TransportConfig,
}

impl HttpHistorySource {
    pub fn new(config: TransportConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: TransportConfig) -> Self {
        Self { client, config }
    }

    async fn fetch_entries(&self, conversation_id: &ConversationId) -> HistoryResult<Vec<HistoryEntry>> {
        let url = self.config.history_url(conversation_id);
        tracing::debug!(url = %url, "fetching conversation history");

        let response = self
            .client
            .get(url)
            .timeout(self.config.connect_timeout)
            .send()
            .await
            .map_err(|error| Box::new(error) as BoxError)
            .context(RequestSnafu {
                stage: "history-send",
            })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|error| Box::new(error) as BoxError)
            .context(RequestSnafu {
                stage: "history-read-body",
            })?;

        ensure!(
            status.is_success(),
            StatusSnafu {
                stage: "history-status",
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            }
        );

        let envelope: HistoryEnvelope = serde_json::from_slice(&body).context(DecodeSnafu {
            stage: "history-decode",
        })?;
        Ok(envelope.into_entries())
    }
}

impl HistorySource for HttpHistorySource {
    fn fetch<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, HistoryResult<Vec<HistoryEntry>>> {
        Box::pin(self.fetch_entries(conversation_id))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn envelope_without_data_is_empty_history() {
        let envelope: HistoryEnvelope = serde_json::from_value(json!({"success": true})).unwrap();
        assert!(envelope.into_entries().is_empty());

        let envelope: HistoryEnvelope = serde_json::from_value(json!({"data": null})).unwrap();
        assert!(envelope.into_entries().is_empty());
    }

    #[test]
    fn envelope_decodes_numeric_sender_ids() {
        let envelope: HistoryEnvelope = serde_json::from_value(json!({
            "data": [
                {"senderId": 42, "firstName": "Ben", "text": "yo", "createdAt": "2024-03-01T10:00:00Z"}
            ]
        }))
        .unwrap();

        let entries = envelope.into_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sender_id, "42");
    }

    #[test]
    fn bad_rows_do_not_fail_the_envelope() {
        let envelope: HistoryEnvelope = serde_json::from_value(json!({
            "data": [
                {"senderId": "u-1", "firstName": "Asha", "text": "kept", "createdAt": "2024-03-01T10:00:00Z"},
                {"senderId": "u-1", "firstName": "Asha", "text": "no timestamp"},
                {"senderId": "u-2", "text": ["not", "a", "string"], "createdAt": "2024-03-01T10:01:00Z"},
                "not even an object"
            ]
        }))
        .unwrap();

        let entries = envelope.into_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "kept");
        assert!(entries[1].created_at.is_none());
    }
}
