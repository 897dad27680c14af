//! Realtime websocket connection: state machine, subscription registry, and
//! bounded reconnection.
//!
//! A background worker owns the socket: it performs the handshake, writes
//! queued outbound frames, answers transport pings, and routes inbound
//! messages to the subscription registry. The connection object owns the
//! state machine, the registry, and the reconnect timer.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{InvalidHeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::config::SdkConfig;
use crate::events::{DisconnectReason, EventBus, SessionEvent};
use crate::realtime::frame::{ClientFrame, ServerFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of the realtime connection. Exactly one value at a time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Wire-style name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload delivered to a subscription handler.
///
/// Bodies are parsed as JSON; a body that fails to parse is delivered raw
/// rather than dropped.
#[derive(Clone, Debug)]
pub enum RealtimePayload {
    Json(Value),
    Text(String),
}

impl RealtimePayload {
    fn from_body(body: String) -> Self {
        match serde_json::from_str(&body) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Text(body),
        }
    }

    /// Structured view of the payload, when it parsed as JSON.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }
}

/// Errors produced by realtime transport and protocol handling.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Access token could not be converted to a valid HTTP header value.
    #[error("invalid authorization header: {0}")]
    InvalidAuthHeader(#[from] InvalidHeaderValue),

    /// Connection protocol or handshake contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

enum HandshakeError {
    /// The server rejected the session; terminal for this attempt.
    Rejected(RealtimeError),
    /// The transport dropped before the session was accepted.
    Transport(RealtimeError),
}

type SubscriptionHandler = Arc<dyn Fn(RealtimePayload) + Send + Sync>;

struct SubscriptionEntry {
    id: u64,
    handler: SubscriptionHandler,
}

/// Manager of one persistent bidirectional transport session.
pub struct RealtimeConnection {
    inner: Arc<Inner>,
}

struct Inner {
    ws_url: String,
    auto_reconnect: bool,
    reconnect_interval: Duration,
    max_reconnect_attempts: u32,
    debug: bool,
    events: Arc<EventBus>,
    state: Mutex<ConnectionState>,
    subscriptions: Mutex<HashMap<String, SubscriptionEntry>>,
    next_subscription_id: AtomicU64,
    reconnect_attempts: AtomicU32,
    current_token: Mutex<Option<SecretString>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    worker_generation: AtomicU64,
}

impl RealtimeConnection {
    /// Creates a disconnected connection manager.
    pub fn new(config: &SdkConfig, events: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ws_url: config.ws_url(),
                auto_reconnect: config.auto_reconnect,
                reconnect_interval: config.reconnect_interval,
                max_reconnect_attempts: config.max_reconnect_attempts,
                debug: config.debug,
                events,
                state: Mutex::new(ConnectionState::Disconnected),
                subscriptions: Mutex::new(HashMap::new()),
                next_subscription_id: AtomicU64::new(0),
                reconnect_attempts: AtomicU32::new(0),
                current_token: Mutex::new(None),
                outbound: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                worker_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Opens the transport with `token` attached as the connection credential.
    ///
    /// A no-op when already connected. A protocol-level rejection during the
    /// handshake is terminal for this attempt: the state moves to `Failed`,
    /// a `connection.error` event fires, and the error is returned without
    /// scheduling a retry. A transport drop during the handshake routes
    /// through the disconnection handler instead.
    pub async fn connect(&self, token: SecretString) -> Result<(), RealtimeError> {
        {
            let mut state = self.inner.lock_state();
            if *state == ConnectionState::Connected {
                debug!("realtime connect skipped: already connected");
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }
        *lock(&self.inner.current_token) = Some(token.clone());

        let generation = self.inner.worker_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        *lock(&self.inner.outbound) = Some(outbound_tx);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            transport_worker(inner, generation, token, outbound_rx, ready_tx).await;
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(HandshakeError::Rejected(err))) => {
                *self.inner.lock_state() = ConnectionState::Failed;
                self.inner.events.emit(SessionEvent::ConnectionError {
                    message: err.to_string(),
                });
                Err(err)
            }
            Ok(Err(HandshakeError::Transport(err))) => {
                // the worker already routed the drop through the
                // disconnection handler
                self.inner.events.emit(SessionEvent::ConnectionError {
                    message: err.to_string(),
                });
                Err(err)
            }
            Err(_) => Err(RealtimeError::Protocol(
                "transport worker stopped before connect completed".to_string(),
            )),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.lock_state()
    }

    /// True iff the state is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Tears the connection down.
    ///
    /// The state moves to `Disconnected` first, which suppresses the
    /// auto-reconnect path; any pending reconnect timer is cancelled, all
    /// subscriptions are cancelled and cleared, and the transport is closed.
    pub fn disconnect(&self) {
        *self.inner.lock_state() = ConnectionState::Disconnected;
        if let Some(task) = lock(&self.inner.reconnect_task).take() {
            task.abort();
        }

        let destinations: Vec<String> = {
            let mut subscriptions = lock(&self.inner.subscriptions);
            subscriptions.drain().map(|(destination, _)| destination).collect()
        };
        if let Some(outbound) = lock(&self.inner.outbound).take() {
            for destination in destinations {
                let _ = outbound.send(ClientFrame::Unsubscribe { destination });
            }
            // dropping the sender lets the worker close the socket gracefully
        }
        *lock(&self.inner.current_token) = None;
        self.inner.events.emit(SessionEvent::Disconnected {
            reason: DisconnectReason::Manual,
        });
        debug!("realtime disconnected");
    }

    /// Registers `handler` for messages arriving on `destination`.
    ///
    /// Subscribing to a destination that already has a handler replaces it:
    /// the previous handler stops receiving messages. Subscriptions are not
    /// restored automatically after a reconnect; callers re-subscribe once
    /// `connection.connected` fires again. When not connected this logs a
    /// warning and returns an inert handle instead of failing.
    pub fn subscribe<F>(&self, destination: &str, handler: F) -> SubscriptionHandle
    where
        F: Fn(RealtimePayload) + Send + Sync + 'static,
    {
        if !self.is_connected() {
            warn!(destination, "cannot subscribe: not connected");
            return SubscriptionHandle::inert();
        }

        let id = self.inner.next_subscription_id.fetch_add(1, Ordering::Relaxed) + 1;
        let replaced = lock(&self.inner.subscriptions).insert(
            destination.to_string(),
            SubscriptionEntry {
                id,
                handler: Arc::new(handler),
            },
        );
        if replaced.is_some() {
            debug!(destination, "replacing existing subscription");
            self.inner.send_frame(ClientFrame::Unsubscribe {
                destination: destination.to_string(),
            });
        }
        self.inner.send_frame(ClientFrame::Subscribe {
            destination: destination.to_string(),
        });
        debug!(destination, "subscribed");

        SubscriptionHandle {
            inner: Arc::downgrade(&self.inner),
            destination: destination.to_string(),
            id,
        }
    }

    /// Publishes `body` to `destination`.
    ///
    /// String bodies are sent as-is; everything else is serialized to JSON
    /// text. When not connected this logs a warning and sends nothing:
    /// messages are never queued for later delivery.
    pub fn publish<B: Serialize + ?Sized>(
        &self,
        destination: &str,
        body: &B,
    ) -> Result<(), RealtimeError> {
        if !self.is_connected() {
            warn!(destination, "cannot publish: not connected");
            return Ok(());
        }
        let body = publish_body(serde_json::to_value(body)?);
        self.inner.send_frame(ClientFrame::Send {
            destination: destination.to_string(),
            body,
        });
        if self.inner.debug {
            debug!(destination, "published message");
        }
        Ok(())
    }
}

fn publish_body(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

/// Handle returned by [`RealtimeConnection::subscribe`].
pub struct SubscriptionHandle {
    inner: Weak<Inner>,
    destination: String,
    id: u64,
}

impl SubscriptionHandle {
    fn inert() -> Self {
        Self {
            inner: Weak::new(),
            destination: String::new(),
            id: 0,
        }
    }

    /// Cancels the subscription and removes its registry entry.
    ///
    /// Idempotent; a handle superseded by a newer subscription at the same
    /// destination is inert.
    pub fn unsubscribe(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let removed = {
            let mut subscriptions = lock(&inner.subscriptions);
            match subscriptions.get(&self.destination) {
                Some(entry) if entry.id == self.id => {
                    subscriptions.remove(&self.destination);
                    true
                }
                _ => false,
            }
        };
        if removed {
            inner.send_frame(ClientFrame::Unsubscribe {
                destination: self.destination.clone(),
            });
            debug!(destination = %self.destination, "unsubscribed");
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        lock(&self.state)
    }

    fn send_frame(&self, frame: ClientFrame) {
        let outbound = lock(&self.outbound);
        if let Some(tx) = outbound.as_ref() {
            if tx.send(frame).is_err() {
                warn!("outbound queue closed; frame dropped");
            }
        }
    }

    /// Marks the session connected once the server accepts the handshake.
    ///
    /// Returns false when this worker has been superseded or the caller
    /// disconnected mid-handshake, in which case the worker must exit.
    fn mark_connected(&self, generation: u64) -> bool {
        if self.worker_generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        {
            let mut state = self.lock_state();
            if *state == ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Connected;
        }
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.events.emit(SessionEvent::Connected);
        debug!("realtime connected");
        true
    }

    /// Routes an unexpected transport close.
    ///
    /// Manual disconnects (state already `Disconnected`) and superseded
    /// workers are ignored. Reconnection is scheduled only when enabled, the
    /// previous state was exactly `Connected`, and a token is still held.
    fn handle_transport_close(self: &Arc<Self>, generation: u64) {
        if self.worker_generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let previous = {
            let mut state = self.lock_state();
            if *state == ConnectionState::Disconnected {
                return;
            }
            let previous = *state;
            *state = ConnectionState::Disconnected;
            previous
        };
        debug!(previous = %previous, "transport closed unexpectedly");
        self.events.emit(SessionEvent::Disconnected {
            reason: DisconnectReason::ConnectionLost,
        });

        let has_token = lock(&self.current_token).is_some();
        if self.auto_reconnect && previous == ConnectionState::Connected && has_token {
            self.schedule_reconnect();
        }
    }

    /// Schedules the next reconnect attempt, or moves to `Failed` once the
    /// attempt counter reaches its cap. The counter is reset only by a
    /// successful connect.
    fn schedule_reconnect(self: &Arc<Self>) {
        let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
        if attempts >= self.max_reconnect_attempts {
            debug!(attempts, "max reconnect attempts reached");
            *self.lock_state() = ConnectionState::Failed;
            return;
        }
        let attempt = attempts + 1;
        self.reconnect_attempts.store(attempt, Ordering::SeqCst);
        *self.lock_state() = ConnectionState::Reconnecting;
        self.events.emit(SessionEvent::Reconnecting { attempt });
        debug!(attempt, max = self.max_reconnect_attempts, "reconnect scheduled");

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(inner.reconnect_interval).await;
            let token = lock(&inner.current_token).clone();
            if *inner.lock_state() != ConnectionState::Reconnecting {
                return;
            }
            let Some(token) = token else {
                return;
            };
            let connection = RealtimeConnection {
                inner: Arc::clone(&inner),
            };
            if connection.connect(token).await.is_err() {
                inner.schedule_reconnect();
            }
        });
        *lock(&self.reconnect_task) = Some(task);
    }

    fn route_inbound(&self, text: &str) {
        let frame = match ServerFrame::from_text(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping undecodable server frame");
                return;
            }
        };
        match frame {
            ServerFrame::Message { destination, body } => {
                let handler = lock(&self.subscriptions)
                    .get(&destination)
                    .map(|entry| entry.handler.clone());
                match handler {
                    Some(handler) => {
                        let payload = RealtimePayload::from_body(body);
                        if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                            warn!(destination = %destination, "subscription handler panicked");
                        }
                    }
                    None => {
                        debug!(destination = %destination, "message for destination without subscription");
                    }
                }
            }
            ServerFrame::Error { message, code } => {
                warn!(?code, message = %message, "server reported an error");
                self.events
                    .emit(SessionEvent::ConnectionError { message });
            }
            ServerFrame::Connected { .. } => {
                debug!("ignoring connected frame after handshake");
            }
        }
    }
}

async fn transport_worker(
    inner: Arc<Inner>,
    generation: u64,
    token: SecretString,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientFrame>,
    ready_tx: oneshot::Sender<Result<(), HandshakeError>>,
) {
    let mut socket = match open_socket(&inner.ws_url, &token).await {
        Ok(socket) => socket,
        Err(err) => {
            inner.handle_transport_close(generation);
            let _ = ready_tx.send(Err(HandshakeError::Transport(err)));
            return;
        }
    };

    // the server speaks first: `connected` accepts the session, `error`
    // rejects it
    match await_server_hello(&mut socket).await {
        Ok(frame) => {
            if inner.debug {
                debug!(?frame, "handshake accepted");
            }
            if !inner.mark_connected(generation) {
                let _ = socket.close(None).await;
                let _ = ready_tx.send(Err(HandshakeError::Transport(RealtimeError::Protocol(
                    "connect was cancelled during the handshake".to_string(),
                ))));
                return;
            }
            let _ = ready_tx.send(Ok(()));
        }
        Err(HandshakeError::Rejected(err)) => {
            // terminal for this attempt: the caller moves to `Failed`
            let _ = ready_tx.send(Err(HandshakeError::Rejected(err)));
            return;
        }
        Err(HandshakeError::Transport(err)) => {
            inner.handle_transport_close(generation);
            let _ = ready_tx.send(Err(HandshakeError::Transport(err)));
            return;
        }
    }

    loop {
        tokio::select! {
            maybe_frame = outbound_rx.recv() => {
                match maybe_frame {
                    Some(frame) => match frame.to_text() {
                        Ok(text) => {
                            if socket.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "failed to encode outbound frame"),
                    },
                    None => {
                        // graceful teardown requested by disconnect()
                        let _ = socket.close(None).await;
                        return;
                    }
                }
            }
            maybe_message = socket.next() => {
                match maybe_message {
                    Some(Ok(Message::Text(text))) => inner.route_inbound(&text),
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(_)) | Some(Err(_)) | None => break,
                }
            }
        }
    }
    inner.handle_transport_close(generation);
}

async fn open_socket(url: &str, token: &SecretString) -> Result<WsStream, RealtimeError> {
    let mut request = url.into_client_request()?;
    let header: HeaderValue = format!("Bearer {}", token.expose_secret()).parse()?;
    request.headers_mut().insert(AUTHORIZATION, header);
    let (socket, _) = connect_async(request).await?;
    Ok(socket)
}

async fn await_server_hello(socket: &mut WsStream) -> Result<ServerFrame, HandshakeError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return match ServerFrame::from_text(&text) {
                    Ok(frame @ ServerFrame::Connected { .. }) => Ok(frame),
                    Ok(ServerFrame::Error { message, .. }) => {
                        Err(HandshakeError::Rejected(RealtimeError::Protocol(message)))
                    }
                    Ok(other) => Err(HandshakeError::Rejected(RealtimeError::Protocol(format!(
                        "expected connected frame, got {other:?}"
                    )))),
                    Err(err) => Err(HandshakeError::Rejected(RealtimeError::Json(err))),
                };
            }
            Some(Ok(Message::Ping(payload))) => {
                if let Err(err) = socket.send(Message::Pong(payload)).await {
                    return Err(HandshakeError::Transport(RealtimeError::WebSocket(err)));
                }
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                return Err(HandshakeError::Transport(RealtimeError::Protocol(
                    "socket closed before connected frame".to_string(),
                )));
            }
            Some(Ok(_)) => {
                return Err(HandshakeError::Rejected(RealtimeError::Protocol(
                    "received non-text frame before connected frame".to_string(),
                )));
            }
            Some(Err(err)) => {
                return Err(HandshakeError::Transport(RealtimeError::WebSocket(err)));
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}
