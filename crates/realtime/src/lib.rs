//! Huddle Realtime
//!
//! Client-side plumbing for the chat server's real-time websocket:
//! a manager that owns the transport and fans events out to handlers,
//! scoped handler registrations, and a runner for named background sagas.

pub mod binding;
pub mod config;
pub mod error;
pub mod manager;
pub mod saga;
pub mod sync;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Mutex, MutexGuard};

pub use binding::HandlerGuard;
pub use config::{ConnectionConfig, TransportOptions};
pub use error::{SagaError, TransportError};
pub use manager::{
    ConnectionStatus, EventHandler, IdentityTransition, ManagerOptions, ReconnectHandler,
    WebsocketManager, MAX_WEBSOCKET_FAILS,
};
pub use saga::{SagaCancel, SagaRunner, TaskHandle};
pub use sync::{start_periodic_sync, stop_periodic_sync, PERIODIC_SYNC_SAGA, SYNC_INTERVAL};
pub use transport::{ConnectionEvent, Transport, TransportEvent, WsTransport};

/// Lock a table, recovering the data if a handler panicked while it was held.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
