//! The WebSocket message grammar.
//!
//! Every frame is a UTF-8 JSON object with exactly one top-level key naming
//! the client verb or the server event. Server-originated events lead with a
//! colon (`:subscribed`, `:memberJoined`, ...); errors use `__error`.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::status::Status;

/// Client-to-broker verbs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientFrame {
    Auth {
        token: String,
    },
    Subscribe {
        channel: String,
        #[serde(default)]
        hidden: bool,
        #[serde(default)]
        data: Map<String, Value>,
    },
    Unsubscribe {
        channel: String,
    },
    Broadcast {
        channel: String,
        event: String,
        #[serde(default)]
        data: Map<String, Value>,
    },
    Trigger {
        event: String,
        #[serde(default)]
        data: Map<String, Value>,
    },
    Close {},
}

pub fn subscribed(channel: &str, subscribers: Option<Vec<Value>>) -> Value {
    let mut body = Map::new();
    body.insert("channel".into(), Value::String(channel.to_string()));
    if let Some(subscribers) = subscribers {
        body.insert("subscribers".into(), Value::Array(subscribers));
    }
    json!({ ":subscribed": body })
}

pub fn unsubscribed(channel: &str) -> Value {
    json!({ ":unsubscribed": { "channel": channel } })
}

pub fn member_joined(data: Map<String, Value>) -> Value {
    json!({ ":memberJoined": data })
}

pub fn member_left(data: Map<String, Value>) -> Value {
    json!({ ":memberLeft": data })
}

pub fn error_frame(status: &Status) -> Value {
    json!({ "__error": { "code": status.code(), "message": status.message() } })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_verbs() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"subscribe": {"channel": "room", "hidden": true}}"#).unwrap();
        match frame {
            ClientFrame::Subscribe { channel, hidden, data } => {
                assert_eq!(channel, "room");
                assert!(hidden);
                assert!(data.is_empty());
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let frame: ClientFrame =
            serde_json::from_str(r#"{"broadcast": {"channel": "room", "event": "ping", "data": {"x": 1}}}"#)
                .unwrap();
        assert!(matches!(frame, ClientFrame::Broadcast { .. }));

        let frame: ClientFrame = serde_json::from_str(r#"{"auth": {"token": "t"}}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Auth { .. }));

        let frame: ClientFrame = serde_json::from_str(r#"{"close": {}}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Close {}));
    }

    #[test]
    fn rejects_frames_without_a_known_verb() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"bogus": {}}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"[1, 2]"#).is_err());
    }

    #[test]
    fn server_events_use_a_single_top_level_key() {
        for event in [
            subscribed("room", None),
            unsubscribed("room"),
            member_joined(Map::new()),
            member_left(Map::new()),
            error_frame(&Status::bad_request()),
        ] {
            assert_eq!(event.as_object().unwrap().len(), 1);
        }
    }

    #[test]
    fn error_frames_carry_code_and_message() {
        let frame = error_frame(&Status::channel_not_found());
        assert_eq!(frame["__error"]["code"], 454);
        assert_eq!(frame["__error"]["message"], "Channel not found");
    }
}
