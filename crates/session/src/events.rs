use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::ids::{ConversationId, ParticipantId};

pub const JOIN_CHAT_EVENT: &str = "joinChat";
pub const LEAVE_CHAT_EVENT: &str = "leaveChat";
pub const SEND_MESSAGE_EVENT: &str = "sendMessage";
pub const MESSAGE_RECEIVED_EVENT: &str = "messageReceived";
pub const USER_JOINED_EVENT: &str = "userJoined";
pub const USER_LEFT_EVENT: &str = "userLeft";

/// Membership announcement sent once the channel is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinChat {
    #[serde(rename = "firstName")]
    pub display_name: String,
    #[serde(rename = "userId")]
    pub participant_id: ParticipantId,
    #[serde(rename = "connectionId")]
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveChat {
    #[serde(rename = "userId")]
    pub participant_id: ParticipantId,
    #[serde(rename = "connectionId")]
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    #[serde(rename = "firstName")]
    pub display_name: String,
    #[serde(rename = "userId")]
    pub participant_id: ParticipantId,
    #[serde(rename = "connectionId")]
    pub conversation_id: ConversationId,
    pub text: String,
}

/// Commands this client writes onto the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    JoinChat(JoinChat),
    LeaveChat(LeaveChat),
    SendMessage(SendMessage),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinChat(_) => JOIN_CHAT_EVENT,
            Self::LeaveChat(_) => LEAVE_CHAT_EVENT,
            Self::SendMessage(_) => SEND_MESSAGE_EVENT,
        }
    }

    pub fn payload(&self) -> serde_json::Result<Value> {
        match self {
            Self::JoinChat(payload) => serde_json::to_value(payload),
            Self::LeaveChat(payload) => serde_json::to_value(payload),
            Self::SendMessage(payload) => serde_json::to_value(payload),
        }
    }

    pub fn is_leave(&self) -> bool {
        matches!(self, Self::LeaveChat(_))
    }
}

/// A live chat line delivered to every member of the conversation, the sender included.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageReceived {
    #[serde(rename = "firstName", default)]
    pub display_name: String,
    #[serde(default)]
    pub text: String,
    #[serde(rename = "userId", deserialize_with = "deserialize_loose_id")]
    pub sender_id: String,
    #[serde(default, deserialize_with = "deserialize_loose_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserJoined {
    #[serde(rename = "userId", deserialize_with = "deserialize_loose_id")]
    pub participant_id: String,
    #[serde(rename = "firstName", default)]
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserLeft {
    #[serde(rename = "userId", deserialize_with = "deserialize_loose_id")]
    pub participant_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Events the channel delivers to this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    MessageReceived(MessageReceived),
    UserJoined(UserJoined),
    UserLeft(UserLeft),
}

impl InboundEvent {
    /// Decodes a named event payload. Event names this client does not listen for yield `None`.
    pub fn decode(name: &str, payload: Value) -> serde_json::Result<Option<Self>> {
        let event = match name {
            MESSAGE_RECEIVED_EVENT => Self::MessageReceived(serde_json::from_value(payload)?),
            USER_JOINED_EVENT => Self::UserJoined(serde_json::from_value(payload)?),
            USER_LEFT_EVENT => Self::UserLeft(serde_json::from_value(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Accepts ids sent either as strings or as bare numbers.
pub fn deserialize_loose_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(raw) => raw,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Accepts RFC 3339 strings or epoch milliseconds; anything unreadable becomes `None`
/// so the receiver falls back to receipt time instead of dropping the message.
pub fn deserialize_loose_timestamp<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|value| parse_timestamp_value(&value)))
}

pub fn parse_timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        Value::Number(number) => number
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_payloads_use_backend_field_names() {
        let event = OutboundEvent::SendMessage(SendMessage {
            display_name: "Asha".to_string(),
            participant_id: ParticipantId::parse("u-1").unwrap(),
            conversation_id: ConversationId::parse("c-9").unwrap(),
            text: "pickup at 9?".to_string(),
        });

        assert_eq!(event.name(), "sendMessage");
        assert_eq!(
            event.payload().unwrap(),
            json!({
                "firstName": "Asha",
                "userId": "u-1",
                "connectionId": "c-9",
                "text": "pickup at 9?",
            })
        );
    }

    #[test]
    fn message_received_accepts_numeric_ids_and_millis() {
        let event = InboundEvent::decode(
            MESSAGE_RECEIVED_EVENT,
            json!({"firstName": "Ben", "userId": 42, "text": "yo", "timestamp": 200_000}),
        )
        .unwrap();

        let Some(InboundEvent::MessageReceived(message)) = event else {
            panic!("expected messageReceived, got {event:?}");
        };
        assert_eq!(message.sender_id, "42");
        assert_eq!(message.timestamp.unwrap().timestamp_millis(), 200_000);
    }

    #[test]
    fn unreadable_timestamp_is_dropped_not_fatal() {
        let event = InboundEvent::decode(
            MESSAGE_RECEIVED_EVENT,
            json!({"firstName": "Ben", "userId": "u-2", "text": "yo", "timestamp": "yesterday"}),
        )
        .unwrap();

        let Some(InboundEvent::MessageReceived(message)) = event else {
            panic!("expected messageReceived");
        };
        assert!(message.timestamp.is_none());
    }

    #[test]
    fn unknown_events_are_ignored() {
        assert_eq!(InboundEvent::decode("typing", json!({})).unwrap(), None);
    }

    #[test]
    fn user_left_reason_is_optional() {
        let event = InboundEvent::decode(USER_LEFT_EVENT, json!({"userId": "u-3"})).unwrap();
        assert_eq!(
            event,
            Some(InboundEvent::UserLeft(UserLeft {
                participant_id: "u-3".to_string(),
                reason: None,
            }))
        );
    }
}
