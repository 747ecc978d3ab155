//! Wire codec for the veadotube `stateEvents` control channel.
//!
//! Every frame is the `nodes:` prefix followed by one JSON object. Inbound
//! frames sometimes arrive with trailing whitespace, commas or NUL padding,
//! so decoding scans for the first balanced object instead of parsing the
//! whole frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const FRAME_PREFIX: &str = "nodes:";
const ENVELOPE_EVENT: &str = "payload";
const MESSAGE_TYPE: &str = "stateEvents";
const NODE_ID: &str = "mini";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no balanced JSON object in frame")]
    NoObject,
    #[error("malformed JSON: {0}")]
    Json(String),
    #[error("malformed list payload: {0}")]
    ListPayload(String),
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("operation {0} is missing its state id")]
    MissingState(String),
}

/// Outbound state operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    List,
    Set(String),
    Push(String),
    Pop(String),
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Set(_) => "set",
            Self::Push(_) => "push",
            Self::Pop(_) => "pop",
        }
    }

    pub fn state_id(&self) -> Option<&str> {
        match self {
            Self::List => None,
            Self::Set(id) | Self::Push(id) | Self::Pop(id) => Some(id),
        }
    }

    /// `set` and `push` change what the avatar shows; `list` and `pop` are
    /// bookkeeping.
    pub fn is_state_change(&self) -> bool {
        matches!(self, Self::Set(_) | Self::Push(_))
    }

    pub fn encode(&self) -> String {
        let envelope = Envelope {
            event: ENVELOPE_EVENT.to_string(),
            message_type: MESSAGE_TYPE.to_string(),
            id: NODE_ID.to_string(),
            payload: RequestPayload {
                event: self.op().to_string(),
                state: self.state_id().map(str::to_string),
            },
        };
        // Only strings are serialized here, which cannot fail.
        let body = serde_json::to_string(&envelope).unwrap_or_default();
        format!("{FRAME_PREFIX}{body}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub name: String,
    pub id: String,
}

/// Classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    List(Vec<StateEntry>),
    Peek,
    Unknown(Value),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    event: String,
    #[serde(rename = "type")]
    message_type: String,
    id: String,
    payload: T,
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestPayload {
    event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListPayload {
    states: Vec<StateEntry>,
}

pub fn decode(raw: &str) -> Result<WireMessage, ParseError> {
    let mut value = parse_object(raw)?;

    let is_state_event = value.get("type").and_then(Value::as_str) == Some(MESSAGE_TYPE);
    let event = value
        .get("payload")
        .and_then(|p| p.get("event"))
        .and_then(Value::as_str)
        .map(str::to_string);

    match (is_state_event, event.as_deref()) {
        (true, Some("list")) => {
            let payload = value
                .get_mut("payload")
                .map(Value::take)
                .unwrap_or_default();
            let list: ListPayload = serde_json::from_value(payload)
                .map_err(|err| ParseError::ListPayload(err.to_string()))?;
            Ok(WireMessage::List(list.states))
        }
        (true, Some("peek")) => Ok(WireMessage::Peek),
        _ => Ok(WireMessage::Unknown(value)),
    }
}

/// Parses an outbound frame back into the request it encodes.
pub fn parse_request(raw: &str) -> Result<Request, ParseError> {
    let json = extract_json_object(raw).ok_or(ParseError::NoObject)?;
    let envelope: Envelope<RequestPayload> =
        serde_json::from_str(json).map_err(|err| ParseError::Json(err.to_string()))?;
    let RequestPayload { event, state } = envelope.payload;
    let with_state = |state: Option<String>| state.ok_or_else(|| ParseError::MissingState(event.clone()));

    match event.as_str() {
        "list" => Ok(Request::List),
        "set" => Ok(Request::Set(with_state(state)?)),
        "push" => Ok(Request::Push(with_state(state)?)),
        "pop" => Ok(Request::Pop(with_state(state)?)),
        other => Err(ParseError::UnknownOperation(other.to_string())),
    }
}

fn parse_object(raw: &str) -> Result<Value, ParseError> {
    let json = extract_json_object(raw).ok_or(ParseError::NoObject)?;
    serde_json::from_str(json).map_err(|err| ParseError::Json(err.to_string()))
}

/// Returns the first `{...}` in `raw` whose braces balance, ignoring braces
/// inside string literals.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&raw[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_request_has_no_state_field() {
        assert_eq!(
            Request::List.encode(),
            r#"nodes:{"event":"payload","type":"stateEvents","id":"mini","payload":{"event":"list"}}"#
        );
    }

    #[test]
    fn set_request_carries_state_id() {
        assert_eq!(
            Request::Set("5A".to_string()).encode(),
            r#"nodes:{"event":"payload","type":"stateEvents","id":"mini","payload":{"event":"set","state":"5A"}}"#
        );
    }

    #[test]
    fn encoded_requests_parse_back() {
        for req in [
            Request::List,
            Request::Set("5A".to_string()),
            Request::Push("9B".to_string()),
            Request::Pop("state-with-dash".to_string()),
        ] {
            assert_eq!(parse_request(&req.encode()).unwrap(), req);
        }
    }

    #[test]
    fn parse_request_rejects_stateless_set() {
        let raw = r#"nodes:{"event":"payload","type":"stateEvents","id":"mini","payload":{"event":"set"}}"#;
        assert_eq!(
            parse_request(raw),
            Err(ParseError::MissingState("set".to_string()))
        );
    }

    #[test]
    fn decodes_padded_list_response() {
        let raw = "nodes:{\"event\":\"payload\",\"type\":\"stateEvents\",\"id\":\"mini\",\
                   \"payload\":{\"event\":\"list\",\"states\":[{\"name\":\"Confused\",\"id\":\"5A\"},\
                   {\"name\":\"Sad\",\"id\":\"9B\"}]}}  \n,\0\0\0";
        let msg = decode(raw).unwrap();
        assert_eq!(
            msg,
            WireMessage::List(vec![
                StateEntry {
                    name: "Confused".to_string(),
                    id: "5A".to_string()
                },
                StateEntry {
                    name: "Sad".to_string(),
                    id: "9B".to_string()
                },
            ])
        );
    }

    #[test]
    fn decodes_peek_as_ack() {
        let raw = r#"nodes:{"event":"payload","type":"stateEvents","id":"mini","payload":{"event":"peek","state":"5A"}}"#;
        assert_eq!(decode(raw).unwrap(), WireMessage::Peek);
    }

    #[test]
    fn unrecognized_tags_are_unknown_not_errors() {
        let other_type = r#"nodes:{"event":"payload","type":"avatar","payload":{"event":"list"}}"#;
        assert!(matches!(decode(other_type).unwrap(), WireMessage::Unknown(_)));

        let other_event = r#"nodes:{"type":"stateEvents","payload":{"event":"thumb"}}"#;
        match decode(other_event).unwrap() {
            WireMessage::Unknown(raw) => assert_eq!(raw["payload"]["event"], "thumb"),
            other => panic!("expected unknown, got {other:?}"),
        }

        let no_type = r#"nodes:{"hello":1}"#;
        assert!(matches!(decode(no_type).unwrap(), WireMessage::Unknown(_)));
    }

    #[test]
    fn list_without_states_is_a_parse_error() {
        let raw = r#"nodes:{"type":"stateEvents","payload":{"event":"list"}}"#;
        assert!(matches!(decode(raw), Err(ParseError::ListPayload(_))));
    }

    #[test]
    fn frames_without_balanced_object_fail() {
        assert_eq!(decode("nodes:"), Err(ParseError::NoObject));
        assert_eq!(decode("nodes:{\"a\":{\"b\":1}"), Err(ParseError::NoObject));
        assert!(matches!(decode("nodes:{oops}"), Err(ParseError::Json(_))));
    }

    #[test]
    fn scan_ignores_braces_inside_strings() {
        let raw = r#"nodes:{"name":"a}b{\"c"} trailing {"x":1}"#;
        assert_eq!(extract_json_object(raw), Some(r#"{"name":"a}b{\"c"}"#));
    }
}
