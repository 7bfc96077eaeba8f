//! Client → Server messages

use serde::{Deserialize, Serialize};

/// Control messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Scope subscriptions
    Subscribe { scopes: Vec<String> },
    Unsubscribe { scopes: Vec<String> },
}

impl ClientMessage {
    /// Wire name of the message (the `type` field).
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::Unsubscribe { .. } => "unsubscribe",
        }
    }

    pub fn scopes(&self) -> &[String] {
        match self {
            ClientMessage::Subscribe { scopes } | ClientMessage::Unsubscribe { scopes } => scopes,
        }
    }
}
