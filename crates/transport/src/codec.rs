//! Engine.IO v4 / Socket.IO v4 text framing for the default namespace.
//!
//! Every WebSocket text frame is one engine packet: a type digit followed by its data.
//! Engine `message` packets (`4`) carry one socket packet: another type digit, an optional
//! `/namespace,` prefix, an optional ack id and a JSON body.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, ensure};

use super::error::{CodecSnafu, JsonSnafu, SocketResult};

/// Handshake sent by the server in the engine `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Milliseconds between server pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong.
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, payload: Value },
    ConnectError(Value),
    /// Acks and binary packets; this client never requests or sends them.
    Unsupported { kind: char },
}

impl SocketPacket {
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Self::Event {
            name: name.into(),
            payload,
        }
    }
}

pub fn encode(packet: &EnginePacket) -> SocketResult<String> {
    let frame = match packet {
        EnginePacket::Open(handshake) => {
            let body = serde_json::to_string(handshake).context(JsonSnafu {
                stage: "codec-encode-open",
            })?;
            format!("0{body}")
        }
        EnginePacket::Close => "1".to_string(),
        EnginePacket::Ping(data) => format!("2{data}"),
        EnginePacket::Pong(data) => format!("3{data}"),
        EnginePacket::Message(socket) => format!("4{}", encode_socket(socket)?),
        EnginePacket::Upgrade => "5".to_string(),
        EnginePacket::Noop => "6".to_string(),
    };
    Ok(frame)
}

fn encode_socket(packet: &SocketPacket) -> SocketResult<String> {
    let frame = match packet {
        SocketPacket::Connect(None) => "0".to_string(),
        SocketPacket::Connect(Some(auth)) => format!("0{auth}"),
        SocketPacket::Disconnect => "1".to_string(),
        SocketPacket::Event { name, payload } => {
            let body = if payload.is_null() {
                Value::Array(vec![Value::String(name.clone())])
            } else {
                Value::Array(vec![Value::String(name.clone()), payload.clone()])
            };
            format!("2{body}")
        }
        SocketPacket::ConnectError(data) => format!("4{data}"),
        SocketPacket::Unsupported { kind } => {
            return CodecSnafu {
                stage: "codec-encode-socket",
                details: format!("cannot encode socket packet type '{kind}'"),
            }
            .fail();
        }
    };
    Ok(frame)
}

pub fn decode(frame: &str) -> SocketResult<EnginePacket> {
    let mut chars = frame.chars();
    let kind = chars.next().context(CodecSnafu {
        stage: "codec-decode-engine",
        details: "empty frame",
    })?;
    let data = chars.as_str();

    let packet = match kind {
        '0' => EnginePacket::Open(serde_json::from_str(data).context(JsonSnafu {
            stage: "codec-decode-open",
        })?),
        '1' => EnginePacket::Close,
        '2' => EnginePacket::Ping(data.to_string()),
        '3' => EnginePacket::Pong(data.to_string()),
        '4' => EnginePacket::Message(decode_socket(data)?),
        '5' => EnginePacket::Upgrade,
        '6' => EnginePacket::Noop,
        other => {
            return CodecSnafu {
                stage: "codec-decode-engine",
                details: format!("unknown engine packet type '{other}'"),
            }
            .fail();
        }
    };
    Ok(packet)
}

fn decode_socket(data: &str) -> SocketResult<SocketPacket> {
    let mut chars = data.chars();
    let kind = chars.next().context(CodecSnafu {
        stage: "codec-decode-socket",
        details: "empty socket packet",
    })?;
    let body = strip_ack_id(strip_namespace(chars.as_str()));

    let packet = match kind {
        '0' if body.is_empty() => SocketPacket::Connect(None),
        '0' => SocketPacket::Connect(Some(parse_json(body, "codec-decode-connect")?)),
        '1' => SocketPacket::Disconnect,
        '2' => decode_event(body)?,
        '4' => SocketPacket::ConnectError(if body.is_empty() {
            Value::Null
        } else {
            parse_json(body, "codec-decode-connect-error")?
        }),
        '3' | '5' | '6' => SocketPacket::Unsupported { kind },
        other => {
            return CodecSnafu {
                stage: "codec-decode-socket",
                details: format!("unknown socket packet type '{other}'"),
            }
            .fail();
        }
    };
    Ok(packet)
}

fn decode_event(body: &str) -> SocketResult<SocketPacket> {
    let value = parse_json(body, "codec-decode-event")?;
    let Value::Array(mut items) = value else {
        return CodecSnafu {
            stage: "codec-decode-event",
            details: "event body is not an array",
        }
        .fail();
    };
    ensure!(
        !items.is_empty(),
        CodecSnafu {
            stage: "codec-decode-event",
            details: "event array is empty",
        }
    );

    let payload = if items.len() > 1 {
        items.swap_remove(1)
    } else {
        Value::Null
    };
    let Value::String(name) = items.swap_remove(0) else {
        return CodecSnafu {
            stage: "codec-decode-event",
            details: "event name is not a string",
        }
        .fail();
    };

    Ok(SocketPacket::Event { name, payload })
}

fn strip_namespace(body: &str) -> &str {
    if !body.starts_with('/') {
        return body;
    }
    match body.find(',') {
        Some(comma) => &body[comma + 1..],
        None => "",
    }
}

fn strip_ack_id(body: &str) -> &str {
    body.trim_start_matches(|character: char| character.is_ascii_digit())
}

fn parse_json(body: &str, stage: &'static str) -> SocketResult<Value> {
    serde_json::from_str(body).context(JsonSnafu { stage })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::SocketError;

    #[test]
    fn decodes_open_handshake() {
        let packet = decode(
            r#"0{"sid":"lv_VI97HAXpY6yYWAAAC","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .unwrap();

        let EnginePacket::Open(handshake) = packet else {
            panic!("expected open packet");
        };
        assert_eq!(handshake.ping_interval, 25_000);
        assert_eq!(handshake.ping_timeout, 20_000);
    }

    #[test]
    fn decodes_connect_ack_and_errors() {
        assert_eq!(
            decode(r#"40{"sid":"abc"}"#).unwrap(),
            EnginePacket::Message(SocketPacket::Connect(Some(json!({"sid": "abc"}))))
        );
        assert_eq!(
            decode("40").unwrap(),
            EnginePacket::Message(SocketPacket::Connect(None))
        );
        assert_eq!(
            decode(r#"44{"message":"Not authorized"}"#).unwrap(),
            EnginePacket::Message(SocketPacket::ConnectError(json!({"message": "Not authorized"})))
        );
    }

    #[test]
    fn decodes_events_with_namespace_and_ack_id() {
        let expected = EnginePacket::Message(SocketPacket::event(
            "messageReceived",
            json!({"text": "hi"}),
        ));

        assert_eq!(decode(r#"42["messageReceived",{"text":"hi"}]"#).unwrap(), expected);
        assert_eq!(
            decode(r#"42/chat,17["messageReceived",{"text":"hi"}]"#).unwrap(),
            expected
        );
        assert_eq!(
            decode(r#"42["userLeft"]"#).unwrap(),
            EnginePacket::Message(SocketPacket::event("userLeft", Value::Null))
        );
    }

    #[test]
    fn encodes_client_frames() {
        let join = EnginePacket::Message(SocketPacket::event(
            "joinChat",
            json!({"userId": "u-1", "connectionId": "c-1", "firstName": "Asha"}),
        ));

        let frame = encode(&join).unwrap();
        assert!(frame.starts_with(r#"42["joinChat",{"#));
        assert_eq!(decode(&frame).unwrap(), join);
        assert_eq!(encode(&EnginePacket::Pong(String::new())).unwrap(), "3");
        assert_eq!(
            encode(&EnginePacket::Message(SocketPacket::Connect(None))).unwrap(),
            "40"
        );
        assert_eq!(
            encode(&EnginePacket::Message(SocketPacket::Disconnect)).unwrap(),
            "41"
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(decode(""), Err(SocketError::Codec { .. })));
        assert!(matches!(decode("9"), Err(SocketError::Codec { .. })));
        assert!(matches!(decode("42{}"), Err(SocketError::Codec { .. })));
        assert!(matches!(decode("42[1]"), Err(SocketError::Codec { .. })));
        assert!(matches!(decode("42[oops"), Err(SocketError::Json { .. })));
    }

    #[test]
    fn binary_packets_are_surfaced_as_unsupported() {
        assert_eq!(
            decode(r#"451-["upload",{"_placeholder":true,"num":0}]"#).unwrap(),
            EnginePacket::Message(SocketPacket::Unsupported { kind: '5' })
        );
    }
}
