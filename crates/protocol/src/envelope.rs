//! Server → Client envelopes

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generic wrapper around every inbound real-time event.
///
/// Handlers receive the full envelope; nothing is pre-filtered by event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub broadcast: Broadcast,
    #[serde(default)]
    pub seq: u64,
}

/// Targeting metadata the server attached when broadcasting the event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omit_users: Option<std::collections::HashMap<String, bool>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub team_id: String,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value, seq: u64) -> Self {
        Self {
            event: event.into(),
            data,
            broadcast: Broadcast::default(),
            seq,
        }
    }

    /// Parse a text frame. Frames without an `event` field (e.g. `{status, seq_reply}`
    /// replies to client actions) are not envelopes and yield `None`.
    pub fn from_frame(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        if !value.get("event").is_some_and(Value::is_string) {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    pub fn is(&self, event: &str) -> bool {
        self.event == event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use serde_json::json;

    #[test]
    fn parses_full_envelope() {
        let frame = r#"{
            "event": "posted",
            "data": {"channel_id": "c1"},
            "broadcast": {"omit_users": null, "user_id": "", "channel_id": "c1", "team_id": ""},
            "seq": 4
        }"#;
        let env = Envelope::from_frame(frame).unwrap();
        assert!(env.is(events::POSTED));
        assert_eq!(env.seq, 4);
        assert_eq!(env.broadcast.channel_id, "c1");
        assert_eq!(env.data["channel_id"], json!("c1"));
    }

    #[test]
    fn missing_optional_fields_default() {
        let env = Envelope::from_frame(r#"{"event":"hello"}"#).unwrap();
        assert_eq!(env.seq, 0);
        assert_eq!(env.data, Value::Null);
        assert_eq!(env.broadcast, Broadcast::default());
    }

    #[test]
    fn action_replies_are_not_envelopes() {
        assert!(Envelope::from_frame(r#"{"status":"OK","seq_reply":1}"#).is_none());
        assert!(Envelope::from_frame("not json").is_none());
    }
}
