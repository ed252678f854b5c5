use std::time::Duration;

use super::message::MessageRecord;

/// Two records closer together than this are the same logical message when everything else matches.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted { index: usize },
    Duplicate { existing: usize },
}

impl MergeOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted { .. })
    }
}

/// Ordered, duplicate-free message sequence for one conversation.
///
/// Records are only ever added. Ordering is by `occurred_at`, with equal timestamps kept
/// in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationState {
    records: Vec<MessageRecord>,
    dedup_window: Duration,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl ConversationState {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            records: Vec::new(),
            dedup_window,
        }
    }

    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dedup_window(&self) -> Duration {
        self.dedup_window
    }

    pub fn merge(&mut self, candidate: MessageRecord) -> MergeOutcome {
        if let Some(existing) = self
            .records
            .iter()
            .position(|record| is_duplicate(record, &candidate, self.dedup_window))
        {
            return MergeOutcome::Duplicate { existing };
        }

        // Insert after every record at or before the candidate's instant so ties keep arrival order.
        let index = self
            .records
            .partition_point(|record| record.occurred_at <= candidate.occurred_at);
        self.records.insert(index, candidate);
        MergeOutcome::Inserted { index }
    }

    /// Merges a batch in order and returns how many candidates were accepted.
    pub fn merge_all(&mut self, candidates: impl IntoIterator<Item = MessageRecord>) -> usize {
        candidates
            .into_iter()
            .map(|candidate| self.merge(candidate))
            .filter(MergeOutcome::is_inserted)
            .count()
    }
}

/// Dedup rule: same sender, same display name, identical text, and timestamps strictly
/// closer than `window`.
pub fn is_duplicate(existing: &MessageRecord, candidate: &MessageRecord, window: Duration) -> bool {
    if existing.sender_id != candidate.sender_id
        || existing.text != candidate.text
        || existing.sender_display_name != candidate.sender_display_name
    {
        return false;
    }

    let delta = (candidate.occurred_at - existing.occurred_at).abs();
    match delta.to_std() {
        Ok(delta) => delta < window,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::ids::ParticipantId;
    use crate::message::MessageOrigin;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn record(sender: &str, name: &str, text: &str, seconds: i64) -> MessageRecord {
        MessageRecord::new(
            ParticipantId::parse(sender).unwrap(),
            name,
            text,
            at(seconds),
            MessageOrigin::Live,
        )
    }

    fn assert_sorted_and_unique(state: &ConversationState) {
        let records = state.records();
        assert!(
            records
                .windows(2)
                .all(|pair| pair[0].occurred_at <= pair[1].occurred_at)
        );
        for (left, first) in records.iter().enumerate() {
            for second in &records[left + 1..] {
                assert!(!is_duplicate(first, second, state.dedup_window()));
            }
        }
    }

    #[test]
    fn live_echo_within_window_collapses_into_history_record() {
        let mut state = ConversationState::default();
        let mut from_history = record("a", "Asha", "hi", 100);
        from_history.origin = MessageOrigin::History;

        assert!(state.merge(from_history).is_inserted());
        assert_eq!(
            state.merge(record("a", "Asha", "hi", 102)),
            MergeOutcome::Duplicate { existing: 0 }
        );
        assert_eq!(state.len(), 1);
        assert_eq!(state.records()[0].origin, MessageOrigin::History);
    }

    #[test]
    fn window_boundary_is_exclusive() {
        let mut state = ConversationState::default();
        state.merge(record("a", "Asha", "hi", 100));

        assert!(state.merge(record("a", "Asha", "hi", 105)).is_inserted());
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn any_differing_field_defeats_dedup() {
        let mut state = ConversationState::default();
        state.merge(record("a", "Asha", "hi", 100));

        assert!(state.merge(record("b", "Asha", "hi", 100)).is_inserted());
        assert!(state.merge(record("a", "Ash", "hi", 100)).is_inserted());
        assert!(state.merge(record("a", "Asha", "hi!", 100)).is_inserted());
        assert_eq!(state.len(), 4);
    }

    #[test]
    fn late_candidates_are_inserted_in_time_order() {
        let mut state = ConversationState::default();
        state.merge(record("b", "Ben", "yo", 200));
        let outcome = state.merge(record("a", "Asha", "hi", 100));

        assert_eq!(outcome, MergeOutcome::Inserted { index: 0 });
        let times = state
            .records()
            .iter()
            .map(|record| record.occurred_at.timestamp())
            .collect::<Vec<_>>();
        assert_eq!(times, vec![100, 200]);
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let mut state = ConversationState::default();
        state.merge(record("a", "Asha", "first", 100));
        state.merge(record("b", "Ben", "second", 100));
        state.merge(record("a", "Asha", "third", 100));

        let texts = state
            .records()
            .iter()
            .map(|record| record.text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn interleaved_history_and_live_input_stays_sorted_and_unique() {
        let mut state = ConversationState::default();
        let mut accepted = 0;

        // Deterministic pseudo-random mix of senders, texts and timestamps, many near-collisions.
        let mut seed: u64 = 0x5eed;
        for step in 0..400 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let sender = if (seed >> 60) & 1 == 0 { "a" } else { "b" };
            let text = ["hi", "yo", "ok"][(seed >> 40) as usize % 3];
            let seconds = 1_000 + (seed >> 20) as i64 % 60;
            let mut candidate = record(sender, sender, text, seconds);
            if step % 3 == 0 {
                candidate.origin = MessageOrigin::History;
            }

            let before = state.len();
            if state.merge(candidate).is_inserted() {
                accepted += 1;
            }
            assert!(state.len() >= before);
            assert_sorted_and_unique(&state);
        }

        assert_eq!(state.len(), accepted);
    }

    #[test]
    fn merge_all_counts_accepted_candidates() {
        let mut state = ConversationState::new(Duration::from_secs(5));
        let accepted = state.merge_all(vec![
            record("a", "Asha", "hi", 100),
            record("a", "Asha", "hi", 101),
            record("b", "Ben", "yo", 200),
        ]);

        assert_eq!(accepted, 2);
        assert_eq!(state.len(), 2);
    }
}
