//! Line-oriented rendering of session snapshots for the terminal client.

use chrono::Local;
use kerbside_session::{
    ChannelState, HistoryStatus, MessageRecord, ParticipantId, SessionSnapshot,
};

/// Turns successive snapshots into the lines that still need printing.
///
/// New records at the tail are printed as they arrive. When late history lands in front of
/// records already on screen the whole conversation is printed again under a divider.
#[derive(Debug, Default)]
pub struct ConsoleRenderer {
    local_participant: Option<ParticipantId>,
    printed: Vec<MessageRecord>,
    channel: Option<ChannelState>,
    history: Option<HistoryStatus>,
    unavailable: Option<String>,
    closed: bool,
}

impl ConsoleRenderer {
    pub fn new(local_participant: Option<ParticipantId>) -> Self {
        Self {
            local_participant,
            ..Self::default()
        }
    }

    pub fn render(&mut self, snapshot: &SessionSnapshot) -> Vec<String> {
        let mut lines = Vec::new();

        if self.channel != Some(snapshot.channel) {
            // The initial disconnected state is noise.
            if self.channel.is_some() || snapshot.channel != ChannelState::Disconnected {
                lines.push(format!("* channel {}", snapshot.channel));
            }
            self.channel = Some(snapshot.channel);
        }

        if self.history.as_ref() != Some(&snapshot.history) {
            if let Some(line) = history_line(&snapshot.history) {
                lines.push(line);
            }
            self.history = Some(snapshot.history.clone());
        }

        if self.unavailable != snapshot.channel_unavailable {
            if let Some(reason) = &snapshot.channel_unavailable {
                lines.push(format!("* chat unavailable: {reason}"));
            }
            self.unavailable = snapshot.channel_unavailable.clone();
        }

        if snapshot.messages.starts_with(&self.printed) {
            for record in &snapshot.messages[self.printed.len()..] {
                lines.push(self.message_line(record));
            }
        } else {
            lines.push("--- conversation ---".to_string());
            for record in &snapshot.messages {
                lines.push(self.message_line(record));
            }
        }
        self.printed.clone_from(&snapshot.messages);

        if snapshot.closed && !self.closed {
            self.closed = true;
            lines.push("* chat closed".to_string());
        }
        lines
    }

    fn message_line(&self, record: &MessageRecord) -> String {
        let time = record.occurred_at.with_timezone(&Local).format("%H:%M");
        let is_local = self.local_participant.as_ref() == Some(&record.sender_id);
        let name = match (is_local, record.sender_display_name.is_empty()) {
            (true, _) => "you",
            (false, true) => record.sender_id.as_str(),
            (false, false) => record.sender_display_name.as_str(),
        };
        format!("[{time}] {name}: {}", record.text)
    }
}

fn history_line(status: &HistoryStatus) -> Option<String> {
    match status {
        HistoryStatus::Idle => None,
        HistoryStatus::Loading => Some("* loading history".to_string()),
        HistoryStatus::Loaded { count } => Some(format!("* history loaded ({count} messages)")),
        HistoryStatus::Unavailable { reason } => Some(format!("* history unavailable: {reason}")),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use kerbside_session::MessageOrigin;

    use super::*;

    fn record(sender: &str, name: &str, text: &str, second: u32) -> MessageRecord {
        MessageRecord::new(
            ParticipantId::parse(sender).unwrap(),
            name,
            text,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, second).unwrap(),
            MessageOrigin::Live,
        )
    }

    fn snapshot(messages: Vec<MessageRecord>) -> SessionSnapshot {
        SessionSnapshot {
            messages,
            channel: ChannelState::Connected,
            ..SessionSnapshot::default()
        }
    }

    #[test]
    fn prints_only_new_tail_records() {
        let mut renderer = ConsoleRenderer::new(ParticipantId::parse("u-1").ok());
        let first = record("u-2", "Ben", "truck is here", 1);
        let second = record("u-1", "Asha", "coming down", 2);

        let lines = renderer.render(&snapshot(vec![first.clone()]));
        assert_eq!(lines[0], "* channel connected");
        assert!(lines[1].ends_with("Ben: truck is here"));

        let lines = renderer.render(&snapshot(vec![first, second]));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("you: coming down"));
    }

    #[test]
    fn late_history_reprints_the_conversation() {
        let mut renderer = ConsoleRenderer::new(None);
        let live = record("u-2", "Ben", "live", 5);
        let older = record("u-2", "", "from history", 1);

        renderer.render(&snapshot(vec![live.clone()]));
        let lines = renderer.render(&snapshot(vec![older, live]));

        assert_eq!(lines[0], "--- conversation ---");
        assert!(lines[1].ends_with("u-2: from history"));
        assert!(lines[2].ends_with("Ben: live"));
    }

    #[test]
    fn status_changes_are_reported_once() {
        let mut renderer = ConsoleRenderer::new(None);
        let mut state = SessionSnapshot {
            history: HistoryStatus::Unavailable {
                reason: "status 500".to_string(),
            },
            channel_unavailable: Some("reconnect attempts exhausted".to_string()),
            ..SessionSnapshot::default()
        };

        let lines = renderer.render(&state);
        assert_eq!(
            lines,
            vec![
                "* history unavailable: status 500".to_string(),
                "* chat unavailable: reconnect attempts exhausted".to_string(),
            ]
        );
        assert!(renderer.render(&state).is_empty());

        state.closed = true;
        assert_eq!(renderer.render(&state), vec!["* chat closed".to_string()]);
    }
}
