//! Websocket manager
//!
//! Single owner of the real-time transport. Follows the logged-in user id
//! (connect on login, reconnect on account switch, disconnect on logout),
//! fans inbound envelopes out to registered handlers, and frames scope
//! subscriptions as wire messages.
//!
//! Every table is behind its own short-lived `Mutex`; handlers are always
//! invoked after the lock is released so they may (un)register themselves.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use huddle_protocol::{ClientMessage, Envelope};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::lock;
use crate::transport::{ConnectionEvent, Transport, TransportEvent};

/// Callback interested in inbound envelopes
pub type EventHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Callback run after the connection comes back or events were missed
pub type ReconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Consecutive failures after which the connection is reported as a port problem.
pub const MAX_WEBSOCKET_FAILS: u32 = 7;

/// Outcome of `set_current_user_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityTransition {
    /// Logged out → logged in: transport initialized
    Connected,
    /// One user → another: transport closed then initialized
    Switched,
    /// Logged in → logged out: transport closed
    Disconnected,
    /// Same id as before: nothing happened
    Unchanged,
}

/// Connection health as last reported by the transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub failure_count: u32,
    /// Too many consecutive failures; most likely the websocket port is blocked
    pub port_error: bool,
    pub last_connected_at: Option<SystemTime>,
    pub last_disconnected_at: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Re-send every tracked scope after the transport reconnects
    pub resubscribe_on_reconnect: bool,
    pub max_failures: u32,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            resubscribe_on_reconnect: false,
            max_failures: MAX_WEBSOCKET_FAILS,
        }
    }
}

pub struct WebsocketManager {
    transport: Arc<dyn Transport>,
    options: ManagerOptions,
    current_user_id: Mutex<String>,
    handlers: Mutex<Vec<EventHandler>>,
    /// plugin id → event name → handler
    plugin_handlers: Mutex<BTreeMap<String, BTreeMap<String, EventHandler>>>,
    /// plugin id → handler
    reconnect_handlers: Mutex<BTreeMap<String, ReconnectHandler>>,
    scopes: Mutex<BTreeSet<String>>,
    status: ArcSwap<ConnectionStatus>,
}

impl WebsocketManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_options(transport, ManagerOptions::default())
    }

    pub fn with_options(transport: Arc<dyn Transport>, options: ManagerOptions) -> Self {
        Self {
            transport,
            options,
            current_user_id: Mutex::new(String::new()),
            handlers: Mutex::new(Vec::new()),
            plugin_handlers: Mutex::new(BTreeMap::new()),
            reconnect_handlers: Mutex::new(BTreeMap::new()),
            scopes: Mutex::new(BTreeSet::new()),
            status: ArcSwap::from_pointee(ConnectionStatus::default()),
        }
    }

    // -- Identity --

    /// Follow a login/logout transition. An empty id means logged out.
    ///
    /// The comparison happens before the stored id is overwritten, and the
    /// identity lock is held across the transport calls so concurrent callers
    /// are applied in call order.
    pub fn set_current_user_id(&self, user_id: &str) -> IdentityTransition {
        let mut current = lock(&self.current_user_id);

        let transition = if *current == user_id {
            IdentityTransition::Unchanged
        } else if current.is_empty() {
            IdentityTransition::Connected
        } else if user_id.is_empty() {
            IdentityTransition::Disconnected
        } else {
            IdentityTransition::Switched
        };

        match transition {
            IdentityTransition::Connected => self.transport.initialize(),
            IdentityTransition::Switched => {
                self.transport.close();
                self.forget_connection();
                self.transport.initialize();
            }
            IdentityTransition::Disconnected => {
                self.transport.close();
                self.forget_connection();
            }
            IdentityTransition::Unchanged => {}
        }

        if transition != IdentityTransition::Unchanged {
            info!(
                component = "websocket_manager",
                event = "identity.changed",
                transition = ?transition,
                logged_in = !user_id.is_empty(),
                "Current user changed"
            );
        }

        *current = user_id.to_string();
        transition
    }

    pub fn current_user_id(&self) -> String {
        lock(&self.current_user_id).clone()
    }

    pub fn is_logged_in(&self) -> bool {
        !lock(&self.current_user_id).is_empty()
    }

    /// Scopes and connection status belong to the previous identity.
    fn forget_connection(&self) {
        lock(&self.scopes).clear();
        self.update_status(|status| {
            if status.connected {
                status.last_disconnected_at = Some(SystemTime::now());
            }
            status.connected = false;
        });
    }

    // -- Event handlers --

    /// Register `handler`. Returns false if this exact handler is already registered.
    pub fn register_event_handler(&self, handler: EventHandler) -> bool {
        let mut handlers = lock(&self.handlers);
        if handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return false;
        }
        handlers.push(handler);
        true
    }

    /// Unregister `handler`. Returns false (and does nothing) if it was not registered.
    pub fn unregister_event_handler(&self, handler: &EventHandler) -> bool {
        let mut handlers = lock(&self.handlers);
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.handlers).len()
    }

    // -- Plugin handlers --

    /// Register a plugin's handler for one event name, replacing any previous one.
    pub fn register_plugin_event_handler(
        &self,
        plugin_id: &str,
        event: &str,
        handler: EventHandler,
    ) {
        lock(&self.plugin_handlers)
            .entry(plugin_id.to_string())
            .or_default()
            .insert(event.to_string(), handler);
    }

    pub fn unregister_plugin_event_handler(&self, plugin_id: &str, event: &str) {
        let mut plugins = lock(&self.plugin_handlers);
        if let Some(events) = plugins.get_mut(plugin_id) {
            events.remove(event);
        }
    }

    pub fn unregister_all_plugin_event_handlers(&self, plugin_id: &str) {
        lock(&self.plugin_handlers).remove(plugin_id);
    }

    pub fn register_reconnect_handler(&self, plugin_id: &str, handler: ReconnectHandler) {
        lock(&self.reconnect_handlers).insert(plugin_id.to_string(), handler);
    }

    pub fn unregister_reconnect_handler(&self, plugin_id: &str) {
        lock(&self.reconnect_handlers).remove(plugin_id);
    }

    /// Run every reconnect handler. A panicking handler is logged and skipped.
    pub fn run_reconnect_handlers(&self) {
        let handlers: Vec<(String, ReconnectHandler)> = lock(&self.reconnect_handlers)
            .iter()
            .map(|(id, h)| (id.clone(), Arc::clone(h)))
            .collect();

        for (plugin_id, handler) in handlers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler())) {
                error!(
                    component = "websocket_manager",
                    event = "reconnect_handler.panicked",
                    plugin_id = %plugin_id,
                    panic = %panic_message(&*payload),
                    "Reconnect handler panicked"
                );
            }
        }
    }

    // -- Dispatch --

    /// Deliver `envelope` to every handler in registration order, then to the
    /// plugin handlers registered for its event name.
    pub fn dispatch(&self, envelope: &Envelope) {
        let handlers = lock(&self.handlers).clone();
        for (index, handler) in handlers.iter().enumerate() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                error!(
                    component = "websocket_manager",
                    event = "handler.panicked",
                    ws_event = %envelope.event,
                    seq = envelope.seq,
                    handler_index = index,
                    panic = %panic_message(&*payload),
                    "Event handler panicked"
                );
            }
        }

        let plugin_handlers: Vec<(String, EventHandler)> = lock(&self.plugin_handlers)
            .iter()
            .filter_map(|(plugin_id, events)| {
                events
                    .get(&envelope.event)
                    .map(|h| (plugin_id.clone(), Arc::clone(h)))
            })
            .collect();

        for (plugin_id, handler) in plugin_handlers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                error!(
                    component = "websocket_manager",
                    event = "plugin_handler.panicked",
                    plugin_id = %plugin_id,
                    ws_event = %envelope.event,
                    panic = %panic_message(&*payload),
                    "Plugin event handler panicked"
                );
            }
        }
    }

    // -- Scopes --

    /// Ask the server for the given scopes. One `subscribe` message; no ack is awaited.
    pub fn subscribe_to_scopes<I, S>(&self, scopes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let scopes: Vec<String> = scopes.into_iter().map(Into::into).collect();
        if scopes.is_empty() {
            return;
        }
        lock(&self.scopes).extend(scopes.iter().cloned());
        debug!(
            component = "websocket_manager",
            event = "scopes.subscribe",
            scopes = ?scopes,
            "Subscribing to scopes"
        );
        self.transport
            .send_message(ClientMessage::Subscribe { scopes });
    }

    /// Stop receiving the given scopes. One `unsubscribe` message; no ack is awaited.
    pub fn unsubscribe_from_scopes<I, S>(&self, scopes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let scopes: Vec<String> = scopes.into_iter().map(Into::into).collect();
        if scopes.is_empty() {
            return;
        }
        {
            let mut tracked = lock(&self.scopes);
            for scope in &scopes {
                tracked.remove(scope);
            }
        }
        debug!(
            component = "websocket_manager",
            event = "scopes.unsubscribe",
            scopes = ?scopes,
            "Unsubscribing from scopes"
        );
        self.transport
            .send_message(ClientMessage::Unsubscribe { scopes });
    }

    pub fn subscribed_scopes(&self) -> Vec<String> {
        lock(&self.scopes).iter().cloned().collect()
    }

    // -- Transport events --

    /// Lock-free snapshot of the connection status.
    pub fn status(&self) -> Arc<ConnectionStatus> {
        self.status.load_full()
    }

    fn update_status(&self, apply: impl Fn(&mut ConnectionStatus)) {
        self.status.rcu(|current| {
            let mut next = (**current).clone();
            apply(&mut next);
            next
        });
    }

    pub fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message(envelope) => self.dispatch(&envelope),
            TransportEvent::Connected { reconnect } => {
                self.update_status(|status| {
                    status.connected = true;
                    status.failure_count = 0;
                    status.port_error = false;
                    status.last_connected_at = Some(SystemTime::now());
                });

                if reconnect {
                    info!(
                        component = "websocket_manager",
                        event = "connection.reconnected",
                        "Websocket reconnected"
                    );
                    if self.options.resubscribe_on_reconnect {
                        let scopes = self.subscribed_scopes();
                        if !scopes.is_empty() {
                            self.transport
                                .send_message(ClientMessage::Subscribe { scopes });
                        }
                    }
                    self.run_reconnect_handlers();
                }
            }
            TransportEvent::MissedEvents { expected, received } => {
                warn!(
                    component = "websocket_manager",
                    event = "connection.missed_events",
                    expected,
                    received,
                    "Missed events, resyncing"
                );
                self.run_reconnect_handlers();
            }
            TransportEvent::Closed { failure_count } => {
                let max_failures = self.options.max_failures;
                self.update_status(|status| {
                    if status.connected {
                        status.last_disconnected_at = Some(SystemTime::now());
                    }
                    status.connected = false;
                    status.failure_count = failure_count;
                    status.port_error = failure_count > max_failures;
                });

                if failure_count > max_failures {
                    error!(
                        component = "websocket_manager",
                        event = "connection.port_error",
                        failure_count,
                        "Websocket keeps failing, check the websocket port"
                    );
                }
            }
        }
    }

    /// Apply an event unless its connection was closed or replaced since.
    ///
    /// Events already queued by the previous user's connection are dropped
    /// here, so they never reach the handlers or the status of the next one.
    pub fn handle_connection_event(&self, tagged: ConnectionEvent) {
        let live = self.transport.connection_id();
        if live.as_deref() != Some(tagged.connection_id.as_str()) {
            debug!(
                component = "websocket_manager",
                event = "connection.stale_event",
                connection_id = %tagged.connection_id,
                live_connection_id = ?live,
                "Dropping event from a closed connection"
            );
            return;
        }
        self.handle_transport_event(tagged.event);
    }

    /// Pump `events` into this manager until the transport goes away.
    ///
    /// The task only holds a weak reference, so dropping the manager ends it.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(tagged) = events.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_connection_event(tagged);
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
