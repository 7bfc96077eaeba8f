//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use huddle_protocol::ClientMessage;

use crate::manager::{ManagerOptions, WebsocketManager};
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Initialize,
    Close,
    Send(ClientMessage),
}

/// Transport that records every call instead of touching the network.
///
/// Each `initialize` opens a fresh connection id; `close` forgets it.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<Call>>,
    live: Mutex<Option<String>>,
    opened: AtomicU64,
}

impl RecordingTransport {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }
}

impl Transport for RecordingTransport {
    fn initialize(&self) {
        self.calls.lock().unwrap().push(Call::Initialize);
        let n = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        *self.live.lock().unwrap() = Some(format!("conn-{n}"));
    }

    fn close(&self) {
        self.calls.lock().unwrap().push(Call::Close);
        *self.live.lock().unwrap() = None;
    }

    fn send_message(&self, message: ClientMessage) {
        self.calls.lock().unwrap().push(Call::Send(message));
    }

    fn connection_id(&self) -> Option<String> {
        self.live.lock().unwrap().clone()
    }
}

pub fn manager_with(options: ManagerOptions) -> (Arc<WebsocketManager>, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let manager = Arc::new(WebsocketManager::with_options(transport.clone(), options));
    (manager, transport)
}

pub fn manager() -> (Arc<WebsocketManager>, Arc<RecordingTransport>) {
    manager_with(ManagerOptions::default())
}
