use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::HistoryResult;
use super::events::{deserialize_loose_id, deserialize_loose_timestamp};
use super::ids::{ConversationId, ParticipantId};
use super::message::{MessageOrigin, MessageRecord};
use super::transport::BoxFuture;

/// One persisted message as the history endpoint returns it.
///
/// Every field is optional on the wire; rows without a sender or a readable timestamp
/// decode fine and are dropped by [`normalize_entries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "senderId", default, deserialize_with = "deserialize_loose_id")]
    pub sender_id: String,
    #[serde(rename = "firstName", default)]
    pub sender_display_name: String,
    #[serde(default)]
    pub text: String,
    #[serde(
        rename = "createdAt",
        default,
        deserialize_with = "deserialize_loose_timestamp"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

pub trait HistorySource: Send + Sync {
    fn fetch<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, HistoryResult<Vec<HistoryEntry>>>;
}

/// Identifies one load so results for a superseded conversation can be discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTicket {
    pub conversation_id: ConversationId,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOutcome {
    Loaded(Vec<MessageRecord>),
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryDelivery {
    pub ticket: HistoryTicket,
    pub outcome: HistoryOutcome,
}

/// Issues at most one fetch per `(conversation, participant)` pair and tracks which
/// load is current.
pub struct HistoryLoader {
    source: Arc<dyn HistorySource>,
    deliveries: mpsc::UnboundedSender<HistoryDelivery>,
    generation: u64,
    current: Option<HistoryTicket>,
    requested_for: Option<(ConversationId, ParticipantId)>,
    in_flight: Option<JoinHandle<()>>,
}

impl HistoryLoader {
    pub fn new(
        source: Arc<dyn HistorySource>,
        deliveries: mpsc::UnboundedSender<HistoryDelivery>,
    ) -> Self {
        Self {
            source,
            deliveries,
            generation: 0,
            current: None,
            requested_for: None,
            in_flight: None,
        }
    }

    /// Starts a load. No-op when either id is missing or this pair was already requested.
    pub fn load(
        &mut self,
        conversation_id: Option<&ConversationId>,
        participant_id: Option<&ParticipantId>,
    ) -> Option<HistoryTicket> {
        let (Some(conversation_id), Some(participant_id)) = (conversation_id, participant_id)
        else {
            return None;
        };

        let pair = (conversation_id.clone(), participant_id.clone());
        if self.requested_for.as_ref() == Some(&pair) {
            return None;
        }

        self.cancel();
        self.generation += 1;
        let ticket = HistoryTicket {
            conversation_id: conversation_id.clone(),
            generation: self.generation,
        };
        self.requested_for = Some(pair);
        self.current = Some(ticket.clone());

        let source = Arc::clone(&self.source);
        let deliveries = self.deliveries.clone();
        let task_ticket = ticket.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let outcome = fetch_outcome(source.as_ref(), &task_ticket.conversation_id).await;
            let _ = deliveries.send(HistoryDelivery {
                ticket: task_ticket,
                outcome,
            });
        }));

        tracing::debug!(
            conversation_id = %ticket.conversation_id,
            generation = ticket.generation,
            "requested conversation history"
        );
        Some(ticket)
    }

    /// Abandons the in-flight load, if any. Its result will no longer be accepted.
    pub fn cancel(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.abort();
        }
        self.current = None;
    }

    /// Forgets the requested pair so the next view of a conversation fetches again.
    pub fn reset(&mut self) {
        self.cancel();
        self.requested_for = None;
    }

    /// Accepts a delivery only if it belongs to the current load; each load is accepted once.
    pub fn accept(&mut self, delivery: &HistoryDelivery) -> bool {
        if self.current.as_ref() != Some(&delivery.ticket) {
            tracing::debug!(
                conversation_id = %delivery.ticket.conversation_id,
                generation = delivery.ticket.generation,
                "discarding stale history result"
            );
            return false;
        }

        self.current = None;
        self.in_flight = None;
        true
    }

    #[cfg(test)]
    fn is_loading(&self) -> bool {
        self.current.is_some()
    }
}

impl Drop for HistoryLoader {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn fetch_outcome(source: &dyn HistorySource, conversation_id: &ConversationId) -> HistoryOutcome {
    match source.fetch(conversation_id).await {
        Ok(entries) => HistoryOutcome::Loaded(normalize_entries(entries)),
        Err(error) => {
            tracing::warn!(
                conversation_id = %conversation_id,
                error = %error,
                "conversation history unavailable; continuing with live messages only"
            );
            HistoryOutcome::Unavailable {
                reason: error.to_string(),
            }
        }
    }
}

/// Converts persisted entries into records ordered by `created_at`, preserving the
/// endpoint's order for equal timestamps. Rows without a sender or a timestamp are skipped.
pub fn normalize_entries(entries: Vec<HistoryEntry>) -> Vec<MessageRecord> {
    let mut records = entries
        .into_iter()
        .filter_map(|entry| {
            let (Ok(sender_id), Some(created_at)) =
                (ParticipantId::parse(&entry.sender_id), entry.created_at)
            else {
                tracing::debug!(
                    sender_id = %entry.sender_id,
                    "skipping history row without sender or timestamp"
                );
                return None;
            };
            Some(MessageRecord::new(
                sender_id,
                entry.sender_display_name,
                entry.text,
                created_at,
                MessageOrigin::History,
            ))
        })
        .collect::<Vec<_>>();
    records.sort_by_key(|record| record.occurred_at);
    records
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::error::HistoryError;

    struct CountingSource {
        calls: AtomicUsize,
        entries: Vec<HistoryEntry>,
    }

    impl HistorySource for CountingSource {
        fn fetch<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
        ) -> BoxFuture<'a, HistoryResult<Vec<HistoryEntry>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let entries = self.entries.clone();
            Box::pin(async move { Ok(entries) })
        }
    }

    struct FailingSource;

    impl HistorySource for FailingSource {
        fn fetch<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
        ) -> BoxFuture<'a, HistoryResult<Vec<HistoryEntry>>> {
            Box::pin(async move {
                Err(HistoryError::Status {
                    stage: "test-fetch",
                    status: 503,
                    body: "maintenance".to_string(),
                })
            })
        }
    }

    fn entry(sender: &str, text: &str, seconds: i64) -> HistoryEntry {
        HistoryEntry {
            sender_id: sender.to_string(),
            sender_display_name: sender.to_uppercase(),
            text: text.to_string(),
            created_at: Utc.timestamp_opt(seconds, 0).single(),
        }
    }

    fn ids(conversation: &str) -> (ConversationId, ParticipantId) {
        (
            ConversationId::parse(conversation).unwrap(),
            ParticipantId::parse("u-1").unwrap(),
        )
    }

    #[test]
    fn entries_decode_from_backend_shape() {
        let entry: HistoryEntry = serde_json::from_value(json!({
            "senderId": "65f0",
            "firstName": "Asha",
            "text": "hi",
            "createdAt": "2024-03-01T10:00:00.000Z",
            "_id": "ignored",
        }))
        .unwrap();

        assert_eq!(entry.sender_id, "65f0");
        assert_eq!(entry.sender_display_name, "Asha");
        assert_eq!(entry.created_at.unwrap().timestamp(), 1_709_287_200);
    }

    #[test]
    fn malformed_rows_decode_and_are_skipped() {
        let entries: Vec<HistoryEntry> = serde_json::from_value(json!([
            {"senderId": "65f0", "firstName": "Asha", "text": "kept", "createdAt": "2024-03-01T10:00:00Z"},
            {"senderId": "65f0", "firstName": "Asha", "text": "no time"},
            {"firstName": "Ben", "text": "no sender", "createdAt": "2024-03-01T10:01:00Z"},
            {"senderId": 7, "text": "bad time", "createdAt": "yesterday"},
        ]))
        .unwrap();
        assert_eq!(entries.len(), 4);
        assert!(entries[1].created_at.is_none());
        assert_eq!(entries[2].sender_id, "");

        let records = normalize_entries(entries);
        let texts = records
            .iter()
            .map(|record| record.text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["kept"]);
    }

    #[test]
    fn normalize_orders_by_time_and_tags_history_origin() {
        let records = normalize_entries(vec![
            entry("b", "second", 200),
            entry("a", "first", 100),
            entry("", "no sender", 150),
        ]);

        let texts = records
            .iter()
            .map(|record| record.text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["first", "second"]);
        assert!(records.iter().all(|record| record.origin == MessageOrigin::History));
    }

    #[tokio::test]
    async fn load_is_a_noop_without_both_ids() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            entries: Vec::new(),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut loader = HistoryLoader::new(source.clone(), tx);
        let (conversation, participant) = ids("c-1");

        assert!(loader.load(None, Some(&participant)).is_none());
        assert!(loader.load(Some(&conversation), None).is_none());
        tokio::task::yield_now().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn one_fetch_per_pair() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            entries: vec![entry("a", "hi", 100)],
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut loader = HistoryLoader::new(source.clone(), tx);
        let (conversation, participant) = ids("c-1");

        let ticket = loader.load(Some(&conversation), Some(&participant)).unwrap();
        assert!(loader.load(Some(&conversation), Some(&participant)).is_none());

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.ticket, ticket);
        assert!(loader.accept(&delivery));
        assert!(!loader.accept(&delivery));
        assert!(matches!(&delivery.outcome, HistoryOutcome::Loaded(records) if records.len() == 1));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn superseded_ticket_is_rejected() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            entries: vec![entry("a", "hi", 100)],
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut loader = HistoryLoader::new(source, tx);
        let (old, participant) = ids("c-old");
        let (new, _) = ids("c-new");

        let stale = loader.load(Some(&old), Some(&participant)).unwrap();
        let current = loader.load(Some(&new), Some(&participant)).unwrap();
        assert_ne!(stale, current);

        let stale_delivery = HistoryDelivery {
            ticket: stale,
            outcome: HistoryOutcome::Loaded(Vec::new()),
        };
        assert!(!loader.accept(&stale_delivery));
        assert!(loader.is_loading());
    }

    #[tokio::test]
    async fn failure_degrades_to_unavailable() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut loader = HistoryLoader::new(Arc::new(FailingSource), tx);
        let (conversation, participant) = ids("c-1");
        loader.load(Some(&conversation), Some(&participant));

        let delivery = rx.recv().await.unwrap();
        let HistoryOutcome::Unavailable { reason } = &delivery.outcome else {
            panic!("expected unavailable history");
        };
        assert!(reason.contains("503"));
    }
}
