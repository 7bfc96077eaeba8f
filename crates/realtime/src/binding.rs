//! Scoped handler registrations.
//!
//! `HandlerGuard` keeps one handler registered with a `WebsocketManager` for
//! exactly as long as the guard lives. Swapping in a different handler
//! unregisters the old one first; dropping the guard unregisters whatever is
//! current.

use std::sync::Arc;

use crate::manager::{EventHandler, WebsocketManager};

/// Registration that is released on drop.
#[must_use = "the handler is unregistered as soon as the guard is dropped"]
pub struct HandlerGuard {
    manager: Arc<WebsocketManager>,
    handler: EventHandler,
}

impl HandlerGuard {
    pub fn new(manager: Arc<WebsocketManager>, handler: EventHandler) -> Self {
        manager.register_event_handler(Arc::clone(&handler));
        Self { manager, handler }
    }

    /// Replace the registered handler.
    ///
    /// Identity is by reference: passing the same `Arc` again is a no-op, while
    /// a freshly built closure always re-registers.
    pub fn set_handler(&mut self, handler: EventHandler) {
        if Arc::ptr_eq(&self.handler, &handler) {
            return;
        }
        self.manager.unregister_event_handler(&self.handler);
        self.manager.register_event_handler(Arc::clone(&handler));
        self.handler = handler;
    }

    pub fn handler(&self) -> &EventHandler {
        &self.handler
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.manager.unregister_event_handler(&self.handler);
    }
}

impl WebsocketManager {
    /// Register `handler` for the lifetime of the returned guard.
    pub fn use_websocket(self: &Arc<Self>, handler: EventHandler) -> HandlerGuard {
        HandlerGuard::new(Arc::clone(self), handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::manager;
    use huddle_protocol::Envelope;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> EventHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &Envelope| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn guard_registers_until_dropped() {
        let (manager, _transport) = manager();
        let count = Arc::new(AtomicUsize::new(0));

        let guard = manager.use_websocket(counting(&count));
        manager.dispatch(&Envelope::new("posted", json!({}), 0));
        assert_eq!(manager.handler_count(), 1);

        drop(guard);
        manager.dispatch(&Envelope::new("posted", json!({}), 1));
        assert_eq!(manager.handler_count(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn swapping_handler_moves_the_registration() {
        let (manager, _transport) = manager();
        let old_count = Arc::new(AtomicUsize::new(0));
        let new_count = Arc::new(AtomicUsize::new(0));

        let mut guard = manager.use_websocket(counting(&old_count));
        guard.set_handler(counting(&new_count));
        manager.dispatch(&Envelope::new("typing", json!({}), 0));

        assert_eq!(old_count.load(Ordering::SeqCst), 0);
        assert_eq!(new_count.load(Ordering::SeqCst), 1);
        assert_eq!(manager.handler_count(), 1);
    }

    #[test]
    fn same_handler_reference_does_not_churn() {
        let (manager, _transport) = manager();
        let count = Arc::new(AtomicUsize::new(0));
        let stable = counting(&count);
        let other = counting(&count);

        // A registration made elsewhere must survive the guard's no-op swap.
        manager.register_event_handler(Arc::clone(&other));

        let mut guard = manager.use_websocket(Arc::clone(&stable));
        guard.set_handler(Arc::clone(&stable));
        assert!(Arc::ptr_eq(guard.handler(), &stable));
        assert_eq!(manager.handler_count(), 2);

        drop(guard);
        assert_eq!(manager.handler_count(), 1);
        assert!(manager.unregister_event_handler(&other));
    }

    #[test]
    fn two_guards_are_independent() {
        let (manager, _transport) = manager();
        let count = Arc::new(AtomicUsize::new(0));

        let first = manager.use_websocket(counting(&count));
        let second = manager.use_websocket(counting(&count));
        drop(first);

        manager.dispatch(&Envelope::new("posted", json!({}), 0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        drop(second);
        assert_eq!(manager.handler_count(), 0);
    }
}
