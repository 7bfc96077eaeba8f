//! Huddle Protocol
//!
//! Wire types exchanged with the chat server over the real-time websocket.
//! Everything here is serialized as JSON text frames.

use uuid::Uuid;

pub mod client;
pub mod envelope;
pub mod events;

pub use client::ClientMessage;
pub use envelope::{Broadcast, Envelope};

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
