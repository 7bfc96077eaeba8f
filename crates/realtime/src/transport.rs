//! Socket transport
//!
//! `Transport` is the seam the manager talks to: lifecycle calls plus
//! fire-and-forget sends. `WsTransport` is the tokio-tungstenite
//! implementation. It owns one connection task at a time and reports
//! everything that happens on the wire as `TransportEvent`s, each tagged with
//! the id of the connection that produced it.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use huddle_protocol::{new_id, ClientMessage, Envelope};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionConfig, TransportOptions};
use crate::error::TransportError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle and send surface of a real-time transport.
///
/// All calls return immediately; connecting, closing and sending happen in
/// the background.
pub trait Transport: Send + Sync {
    /// Open the connection. A no-op while a connection is already live.
    fn initialize(&self);

    /// Close the connection. Safe to call when nothing is connected.
    fn close(&self);

    /// Queue a control message on the live connection.
    fn send_message(&self, message: ClientMessage);

    /// Id of the live connection. Events tagged with any other id come from a
    /// connection that was closed or replaced.
    fn connection_id(&self) -> Option<String>;
}

/// What the transport observed on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Socket opened. `reconnect` is true when earlier attempts had failed.
    Connected { reconnect: bool },

    /// Inbound envelope
    Message(Envelope),

    /// Sequence gap: events between `expected` and `received` never arrived
    MissedEvents { expected: u64, received: u64 },

    /// Socket dropped or a connect attempt failed
    Closed { failure_count: u32 },
}

/// A `TransportEvent` and the connection it was observed on
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    pub connection_id: String,
    pub event: TransportEvent,
}

struct Connection {
    id: String,
    outbound_tx: mpsc::UnboundedSender<ClientMessage>,
    shutdown_tx: oneshot::Sender<()>,
}

/// tokio-tungstenite transport with reconnect backoff
pub struct WsTransport {
    url: String,
    token: Option<String>,
    options: TransportOptions,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    connection: Mutex<Option<Connection>>,
}

impl WsTransport {
    /// Create a transport for `config`. Events are delivered on the returned receiver.
    pub fn new(
        config: &ConnectionConfig,
        options: TransportOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>), TransportError> {
        let url = config.connection_url()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Self {
            url,
            token: config.token.clone().filter(|t| !t.is_empty()),
            options,
            events_tx,
            connection: Mutex::new(None),
        };
        Ok((transport, events_rx))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// True while a connection task is alive (connected or retrying).
    pub fn is_active(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|conn| !conn.outbound_tx.is_closed())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Transport for WsTransport {
    fn initialize(&self) {
        let mut guard = self.lock();
        if guard
            .as_ref()
            .is_some_and(|conn| !conn.outbound_tx.is_closed())
        {
            debug!(
                component = "transport",
                event = "transport.initialize.skipped",
                "Connection already active"
            );
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(
                component = "transport",
                event = "transport.initialize.no_runtime",
                "initialize() called outside a tokio runtime"
            );
            return;
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let id = new_id();

        info!(
            component = "transport",
            event = "transport.initialize",
            connection_id = %id,
            url = %self.url,
            "Opening websocket"
        );

        runtime.spawn(run_connection_loop(
            ConnectionContext {
                id: id.clone(),
                url: self.url.clone(),
                token: self.token.clone(),
                options: self.options,
                events_tx: self.events_tx.clone(),
            },
            outbound_rx,
            shutdown_rx,
        ));

        *guard = Some(Connection {
            id,
            outbound_tx,
            shutdown_tx,
        });
    }

    fn close(&self) {
        let Some(conn) = self.lock().take() else {
            return;
        };
        info!(
            component = "transport",
            event = "transport.close",
            connection_id = %conn.id,
            "Closing websocket"
        );
        let _ = conn.shutdown_tx.send(());
    }

    fn send_message(&self, message: ClientMessage) {
        let guard = self.lock();
        let Some(conn) = guard.as_ref() else {
            debug!(
                component = "transport",
                event = "transport.send.no_connection",
                message_type = message.kind(),
                "No connection, message dropped"
            );
            return;
        };
        if conn.outbound_tx.send(message).is_err() {
            warn!(
                component = "transport",
                event = "transport.send.closed",
                connection_id = %conn.id,
                "Connection task gone, message dropped"
            );
        }
    }

    fn connection_id(&self) -> Option<String> {
        self.lock().as_ref().map(|conn| conn.id.clone())
    }
}

struct ConnectionContext {
    id: String,
    url: String,
    token: Option<String>,
    options: TransportOptions,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionContext {
    /// Returns false once nobody is listening for events.
    fn emit(&self, event: TransportEvent) -> bool {
        self.events_tx
            .send(ConnectionEvent {
                connection_id: self.id.clone(),
                event,
            })
            .is_ok()
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Connect, pump messages, and retry with exponential backoff until shut down.
async fn run_connection_loop(
    ctx: ConnectionContext,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut failure_count: u32 = 0;
    let mut backoff = ctx.options.initial_backoff;

    loop {
        let attempt = tokio::select! {
            result = connect(&ctx.url, ctx.token.as_deref()) => result,
            _ = &mut shutdown_rx => break,
        };

        match attempt {
            Ok(socket) => {
                info!(
                    component = "transport",
                    event = "transport.connected",
                    connection_id = %ctx.id,
                    reconnect = failure_count > 0,
                    "Websocket connected"
                );
                let reconnect = failure_count > 0;
                failure_count = 0;
                backoff = ctx.options.initial_backoff;

                if !ctx.emit(TransportEvent::Connected { reconnect }) {
                    break;
                }

                if run_message_loop(&ctx, socket, &mut outbound_rx, &mut shutdown_rx).await {
                    break;
                }

                warn!(
                    component = "transport",
                    event = "transport.disconnected",
                    connection_id = %ctx.id,
                    "Websocket disconnected"
                );
            }
            Err(e) => {
                warn!(
                    component = "transport",
                    event = "transport.connect_failed",
                    connection_id = %ctx.id,
                    error = %e,
                    "Websocket connect failed"
                );
            }
        }

        failure_count = failure_count.saturating_add(1);
        if !ctx.emit(TransportEvent::Closed { failure_count }) {
            break;
        }

        debug!(
            component = "transport",
            event = "transport.backoff",
            connection_id = %ctx.id,
            failure_count,
            wait_ms = backoff.as_millis() as u64,
            "Reconnecting after backoff"
        );

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = &mut shutdown_rx => break,
        }

        backoff = next_backoff(backoff, ctx.options.max_backoff);
    }

    debug!(
        component = "transport",
        event = "transport.loop.exited",
        connection_id = %ctx.id,
        "Connection loop exited"
    );
}

async fn connect(url: &str, token: Option<&str>) -> Result<Socket, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl(format!("{url}: {e}")))?;

    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid token: {e}")))?;
        request.headers_mut().insert("Authorization", value);
    }

    let (socket, _) = connect_async(request)
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    Ok(socket)
}

/// Pump one live connection.
///
/// Returns `true` when the loop should stop for good (shutdown requested or no
/// event listener left) and `false` when the socket dropped and a reconnect is due.
async fn run_message_loop(
    ctx: &ConnectionContext,
    socket: Socket,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> bool {
    let (mut write, mut read) = socket.split();
    // Server sequence numbers restart at zero for every connection.
    let mut expected_seq: u64 = 0;
    let mut last_activity = Instant::now();
    let mut health = tokio::time::interval(ctx.options.health_check_interval);

    loop {
        tokio::select! {
            Some(msg) = outbound_rx.recv() => {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(
                            component = "transport",
                            event = "transport.send.serialize_failed",
                            connection_id = %ctx.id,
                            error = %TransportError::from(e),
                            "Failed to serialize client message"
                        );
                        continue;
                    }
                };
                if write.send(Message::Text(json.into())).await.is_err() {
                    return false;
                }
            }

            frame = read.next() => {
                let Some(frame) = frame else {
                    return false;
                };
                last_activity = Instant::now();

                match frame {
                    Ok(Message::Text(text)) => {
                        let Some(envelope) = Envelope::from_frame(text.as_str()) else {
                            debug!(
                                component = "transport",
                                event = "transport.frame.ignored",
                                connection_id = %ctx.id,
                                payload_bytes = text.as_str().len(),
                                "Ignoring non-envelope frame"
                            );
                            continue;
                        };

                        if envelope.seq != expected_seq {
                            warn!(
                                component = "transport",
                                event = "transport.seq.gap",
                                connection_id = %ctx.id,
                                expected = expected_seq,
                                received = envelope.seq,
                                "Missed websocket events"
                            );
                            if !ctx.emit(TransportEvent::MissedEvents {
                                expected: expected_seq,
                                received: envelope.seq,
                            }) {
                                return true;
                            }
                        }
                        expected_seq = envelope.seq.saturating_add(1);

                        if !ctx.emit(TransportEvent::Message(envelope)) {
                            return true;
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            return false;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!(
                            component = "transport",
                            event = "transport.close_frame",
                            connection_id = %ctx.id,
                            "Server sent close frame"
                        );
                        return false;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(
                            component = "transport",
                            event = "transport.read_error",
                            connection_id = %ctx.id,
                            error = %e,
                            "Websocket error"
                        );
                        return false;
                    }
                }
            }

            _ = health.tick() => {
                if last_activity.elapsed() > ctx.options.stale_timeout {
                    warn!(
                        component = "transport",
                        event = "transport.stale",
                        connection_id = %ctx.id,
                        idle_secs = last_activity.elapsed().as_secs(),
                        "Connection stale, reconnecting"
                    );
                    return false;
                }
            }

            _ = &mut *shutdown_rx => {
                let _ = write.send(Message::Close(None)).await;
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn text(frame: &str) -> Message {
        Message::Text(frame.to_string().into())
    }

    fn fast_options() -> TransportOptions {
        TransportOptions {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(50),
            stale_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(5),
        }
    }

    async fn local_listener() -> (TcpListener, ConnectionConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ConnectionConfig {
            websocket_url: Some(format!("ws://{addr}")),
            ..Default::default()
        };
        (listener, config)
    }

    async fn next_tagged(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> TransportEvent {
        next_tagged(rx).await.event
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let max = Duration::from_secs(30);
        let mut backoff = Duration::from_secs(1);
        let mut waits = Vec::new();
        for _ in 0..7 {
            waits.push(backoff.as_secs());
            backoff = next_backoff(backoff, max);
        }
        assert_eq!(waits, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(next_backoff(Duration::MAX, max), max);
    }

    #[test]
    fn invalid_site_url_is_rejected_up_front() {
        let config = ConnectionConfig::new("chat.example.com");
        assert!(matches!(
            WsTransport::new(&config, fast_options()),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn send_and_close_without_connection_are_noops() {
        let (transport, _rx) =
            WsTransport::new(&ConnectionConfig::default(), fast_options()).unwrap();
        transport.send_message(ClientMessage::Subscribe {
            scopes: vec!["team:T1".into()],
        });
        transport.close();
        transport.close();
        assert!(!transport.is_active());
        assert_eq!(transport.connection_id(), None);
    }

    #[tokio::test]
    async fn delivers_envelopes_reports_gaps_and_sends_frames() {
        let (listener, config) = local_listener().await;
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(text(r#"{"event":"hello","data":{},"seq":0}"#))
                .await
                .unwrap();
            ws.send(text(r#"{"status":"OK","seq_reply":1}"#))
                .await
                .unwrap();
            ws.send(text(r#"{"event":"posted","data":{"channel_id":"c1"},"seq":2}"#))
                .await
                .unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(body) = msg {
                    let _ = frame_tx.send(body.as_str().to_string());
                }
            }
        });

        let (transport, mut rx) = WsTransport::new(&config, fast_options()).unwrap();
        transport.initialize();
        transport.initialize();
        let live = transport.connection_id().unwrap();

        let connected = next_tagged(&mut rx).await;
        assert_eq!(connected.connection_id, live);
        assert_eq!(connected.event, TransportEvent::Connected { reconnect: false });
        match next_event(&mut rx).await {
            TransportEvent::Message(env) => assert_eq!(env.event, "hello"),
            other => panic!("expected hello, got {other:?}"),
        }
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::MissedEvents {
                expected: 1,
                received: 2
            }
        );
        match next_event(&mut rx).await {
            TransportEvent::Message(env) => assert_eq!(env.event, "posted"),
            other => panic!("expected posted, got {other:?}"),
        }

        transport.send_message(ClientMessage::Subscribe {
            scopes: vec!["team:T1".into()],
        });
        let frame = timeout(Duration::from_secs(5), frame_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "subscribe", "scopes": ["team:T1"]})
        );

        transport.close();
        assert!(!transport.is_active());
    }

    #[tokio::test]
    async fn token_is_sent_as_bearer_authorization() {
        let (listener, mut config) = local_listener().await;
        config.token = Some("s3cret".to_string());
        let (header_tx, header_rx) = oneshot::channel::<Option<String>>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let auth = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let _ = header_tx.send(auth);
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();
            while ws.next().await.is_some() {}
        });

        let (transport, mut rx) = WsTransport::new(&config, fast_options()).unwrap();
        transport.initialize();

        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Connected { reconnect: false }
        );
        let auth = timeout(Duration::from_secs(5), header_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(auth.as_deref(), Some("Bearer s3cret"));

        transport.close();
    }

    #[tokio::test]
    async fn dropped_connection_is_retried_as_reconnect() {
        let (listener, config) = local_listener().await;

        tokio::spawn(async move {
            // First connection is dropped straight away.
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let (transport, mut rx) = WsTransport::new(&config, fast_options()).unwrap();
        transport.initialize();

        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Connected { reconnect: false }
        );
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Closed { failure_count: 1 }
        );
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Connected { reconnect: true }
        );

        transport.close();
    }

    #[tokio::test]
    async fn silent_connection_is_dropped_as_stale() {
        let (listener, config) = local_listener().await;

        tokio::spawn(async move {
            // Accept and then never send anything on the first socket.
            let (stream, _) = listener.accept().await.unwrap();
            let _silent = tokio_tungstenite::accept_async(stream).await.unwrap();

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let options = TransportOptions {
            stale_timeout: Duration::from_millis(100),
            health_check_interval: Duration::from_millis(20),
            ..fast_options()
        };
        let (transport, mut rx) = WsTransport::new(&config, options).unwrap();
        transport.initialize();

        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Connected { reconnect: false }
        );
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Closed { failure_count: 1 }
        );
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Connected { reconnect: true }
        );

        transport.close();
    }

    #[tokio::test]
    async fn failed_connects_keep_counting() {
        let (listener, config) = local_listener().await;
        drop(listener);

        let (transport, mut rx) = WsTransport::new(&config, fast_options()).unwrap();
        transport.initialize();

        for expected in 1..=3 {
            assert_eq!(
                next_event(&mut rx).await,
                TransportEvent::Closed {
                    failure_count: expected
                }
            );
        }
        assert!(transport.is_active());

        transport.close();
    }

    #[tokio::test]
    async fn close_sends_close_frame_and_next_connection_gets_a_new_id() {
        let (listener, config) = local_listener().await;
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let closed_tx = closed_tx.clone();
                tokio::spawn(async move {
                    while let Some(Ok(msg)) = ws.next().await {
                        if matches!(msg, Message::Close(_)) {
                            let _ = closed_tx.send(());
                        }
                    }
                });
            }
        });

        let (transport, mut rx) = WsTransport::new(&config, fast_options()).unwrap();
        transport.initialize();
        let first = next_tagged(&mut rx).await;
        assert_eq!(first.event, TransportEvent::Connected { reconnect: false });

        transport.close();
        timeout(Duration::from_secs(5), closed_rx.recv())
            .await
            .expect("server never saw a close frame")
            .unwrap();

        transport.initialize();
        let second = next_tagged(&mut rx).await;
        assert_eq!(second.event, TransportEvent::Connected { reconnect: false });
        assert_ne!(second.connection_id, first.connection_id);
        assert_eq!(transport.connection_id(), Some(second.connection_id));

        transport.close();
    }
}
