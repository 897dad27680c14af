use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use futures_util::StreamExt;
use relaychat_sdk::realtime::connection::{ConnectionState, RealtimeConnection};
use relaychat_sdk::realtime::frame::{ClientFrame, ServerFrame};
use relaychat_sdk::types::UserProfile;
use relaychat_sdk::{
    ChatSession, ConnectOptions, CredentialStore, EventBus, RequestDispatcher, SdkConfig,
    SessionEvent, TokenPair,
};
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep, timeout};

const FRESH_TOKEN: &str = "fresh-token";
const STALE_TOKEN: &str = "stale-token";
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn make_jwt(sub: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(json!({"alg": "HS256", "typ": "JWT"}).to_string());
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let payload =
        URL_SAFE_NO_PAD.encode(json!({"sub": sub, "exp": now + 3600, "iat": now}).to_string());
    format!("{header}.{payload}.signature")
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}

async fn send_frame(socket: &mut WebSocket, frame: ServerFrame) -> Result<(), String> {
    let text = frame.to_text().map_err(|err| err.to_string())?;
    socket
        .send(Message::Text(text))
        .await
        .map_err(|err| err.to_string())
}

async fn recv_frame(socket: &mut WebSocket) -> Option<ClientFrame> {
    while let Some(Ok(message)) = socket.next().await {
        match message {
            Message::Text(text) => return ClientFrame::from_text(&text).ok(),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

fn record_connection_events(events: &Arc<EventBus>) -> Arc<std::sync::Mutex<Vec<String>>> {
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    for name in [
        "connection.connected",
        "connection.disconnected",
        "connection.reconnecting",
        "connection.error",
    ] {
        let log = Arc::clone(&log);
        let _handle = events.on(name, move |event| {
            let entry = match event {
                SessionEvent::Connected => "connected".to_string(),
                SessionEvent::Disconnected { reason } => {
                    format!("disconnected:{}", reason.as_str())
                }
                SessionEvent::Reconnecting { attempt } => format!("reconnecting:{attempt}"),
                SessionEvent::ConnectionError { .. } => "error".to_string(),
                _ => return,
            };
            log.lock().expect("lock").push(entry);
        });
    }
    log
}

// ---------------------------------------------------------------------------
// HTTP dispatcher: refresh-and-retry behavior
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AuthHttpState {
    requests: Arc<AtomicUsize>,
    accepted_token: &'static str,
}

async fn me_handler(
    State(state): State<AuthHttpState>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let authorized = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {}", state.accepted_token));
    if authorized {
        (
            StatusCode::OK,
            Json(json!({
                "id": "user-1",
                "username": "casey",
                "createdAt": "2025-01-01T00:00:00Z"
            })),
        )
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"code": "TOKEN_EXPIRED", "message": "access token expired"})),
        )
    }
}

fn dispatcher_with_refresh(
    addr: SocketAddr,
    refreshed_token: &'static str,
) -> (RequestDispatcher, Arc<AtomicUsize>) {
    let credentials = Arc::new(CredentialStore::new());
    credentials.set_credential(STALE_TOKEN, None);

    let refresh_calls = Arc::new(AtomicUsize::new(0));
    let calls_for_callback = Arc::clone(&refresh_calls);
    credentials.set_refresh_callback(move || {
        let calls = Arc::clone(&calls_for_callback);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(TokenPair {
                access_token: refreshed_token.to_string(),
                refresh_token: None,
            })
        }
    });

    let config = SdkConfig::new(format!("http://{addr}"));
    let dispatcher =
        RequestDispatcher::new(&config, credentials).expect("build request dispatcher");
    (dispatcher, refresh_calls)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthorized_request_refreshes_once_and_retries() {
    let requests = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route("/api/v1/users/me", get(me_handler)).with_state(AuthHttpState {
        requests: Arc::clone(&requests),
        accepted_token: FRESH_TOKEN,
    });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let (dispatcher, refresh_calls) = dispatcher_with_refresh(addr, FRESH_TOKEN);
    let profile: UserProfile = dispatcher
        .get("/api/v1/users/me", &[])
        .await
        .expect("retried request should succeed with refreshed token");

    assert_eq!(profile.user.id, "user-1");
    assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(requests.load(Ordering::SeqCst), 2);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_unauthorized_response_is_surfaced_not_retried() {
    let requests = Arc::new(AtomicUsize::new(0));
    // the server never accepts any token, so the retried request fails too
    let app = Router::new().route("/api/v1/users/me", get(me_handler)).with_state(AuthHttpState {
        requests: Arc::clone(&requests),
        accepted_token: "token-nobody-holds",
    });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let (dispatcher, refresh_calls) = dispatcher_with_refresh(addr, FRESH_TOKEN);
    let error = dispatcher
        .get::<UserProfile>("/api/v1/users/me", &[])
        .await
        .expect_err("second unauthorized response must surface");

    assert_eq!(error.code, "TOKEN_EXPIRED");
    assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(requests.load(Ordering::SeqCst), 2);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_unauthorized_failure_skips_refresh() {
    let requests = Arc::new(AtomicUsize::new(0));
    let requests_for_handler = Arc::clone(&requests);
    let app = Router::new().route(
        "/api/v1/users/me",
        get(move || {
            let requests = Arc::clone(&requests_for_handler);
            async move {
                requests.fetch_add(1, Ordering::SeqCst);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"code": "INTERNAL", "message": "boom"})),
                )
            }
        }),
    );
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let (dispatcher, refresh_calls) = dispatcher_with_refresh(addr, FRESH_TOKEN);
    let error = dispatcher
        .get::<UserProfile>("/api/v1/users/me", &[])
        .await
        .expect_err("server error must surface");

    assert_eq!(error.code, "INTERNAL");
    assert_eq!(refresh_calls.load(Ordering::SeqCst), 0);
    assert_eq!(requests.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

// ---------------------------------------------------------------------------
// Realtime connection: routing, replace semantics, reconnection
// ---------------------------------------------------------------------------

/// Accepts the session, greets every subscription, and echoes published
/// bodies back to their destination.
async fn echo_ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        if send_frame(
            &mut socket,
            ServerFrame::Connected {
                session_id: Some("s-1".to_string()),
            },
        )
        .await
        .is_err()
        {
            return;
        }
        while let Some(frame) = recv_frame(&mut socket).await {
            match frame {
                ClientFrame::Subscribe { destination } => {
                    let _ = send_frame(
                        &mut socket,
                        ServerFrame::Message {
                            destination,
                            body: r#"{"greeting":"hello"}"#.to_string(),
                        },
                    )
                    .await;
                }
                ClientFrame::Send { destination, body } => {
                    let _ = send_frame(&mut socket, ServerFrame::Message { destination, body })
                        .await;
                }
                ClientFrame::Unsubscribe { .. } => {}
            }
        }
    })
}

fn realtime_config(addr: SocketAddr) -> SdkConfig {
    SdkConfig::new(format!("http://{addr}"))
        .with_reconnect_interval(Duration::from_millis(25))
        .with_max_reconnect_attempts(2)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connects_routes_messages_and_degrades_to_raw_payloads() {
    let app = Router::new().route("/ws", get(echo_ws_handler));
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let events = Arc::new(EventBus::new());
    let connection = RealtimeConnection::new(&realtime_config(addr), Arc::clone(&events));
    connection
        .connect(SecretString::new("access-token".to_string()))
        .await
        .expect("connect to mock ws server");
    assert_eq!(connection.state(), ConnectionState::Connected);

    let (payload_tx, mut payload_rx) = mpsc::unbounded_channel();
    let handle = connection.subscribe("/topic/channels/ch-1", move |payload| {
        let _ = payload_tx.send(payload);
    });

    // greeting sent by the server on subscribe
    let greeting = timeout(RECV_TIMEOUT, payload_rx.recv())
        .await
        .expect("greeting should arrive")
        .expect("subscription should be live");
    assert_eq!(
        greeting.as_json().and_then(|value| value.get("greeting")),
        Some(&json!("hello"))
    );

    // structured publish comes back parsed
    connection
        .publish("/topic/channels/ch-1", &json!({"n": 1}))
        .expect("publish");
    let echoed = timeout(RECV_TIMEOUT, payload_rx.recv())
        .await
        .expect("echo should arrive")
        .expect("subscription should be live");
    assert_eq!(
        echoed.as_json().and_then(|value| value.get("n")),
        Some(&json!(1))
    );

    // a body that is not JSON is delivered raw instead of dropped
    connection
        .publish("/topic/channels/ch-1", &json!("plain text body"))
        .expect("publish");
    let raw = timeout(RECV_TIMEOUT, payload_rx.recv())
        .await
        .expect("raw body should arrive")
        .expect("subscription should be live");
    assert!(raw.as_json().is_none());

    // after unsubscribe nothing is delivered
    handle.unsubscribe();
    connection
        .publish("/topic/channels/ch-1", &json!({"n": 2}))
        .expect("publish");
    assert!(
        timeout(Duration::from_millis(200), payload_rx.recv())
            .await
            .is_err(),
        "unsubscribed destination must not deliver"
    );

    connection.disconnect();
    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribing_twice_replaces_the_first_handler() {
    let app = Router::new().route("/ws", get(echo_ws_handler));
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let events = Arc::new(EventBus::new());
    let connection = RealtimeConnection::new(&realtime_config(addr), Arc::clone(&events));
    connection
        .connect(SecretString::new("access-token".to_string()))
        .await
        .expect("connect to mock ws server");

    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    let _first = connection.subscribe("/topic/channels/ch-1", move |payload| {
        let _ = first_tx.send(payload);
    });
    // drain the subscribe greeting delivered to the first handler
    timeout(RECV_TIMEOUT, first_rx.recv())
        .await
        .expect("first handler should get the greeting")
        .expect("subscription should be live");

    let (second_tx, mut second_rx) = mpsc::unbounded_channel();
    let _second = connection.subscribe("/topic/channels/ch-1", move |payload| {
        let _ = second_tx.send(payload);
    });

    connection
        .publish("/topic/channels/ch-1", &json!({"round": 2}))
        .expect("publish");

    // the replacement handler receives everything from now on
    let mut second_payloads = Vec::new();
    for _ in 0..2 {
        let payload = timeout(RECV_TIMEOUT, second_rx.recv())
            .await
            .expect("second handler should receive")
            .expect("subscription should be live");
        second_payloads.push(payload);
    }
    assert!(second_payloads
        .iter()
        .any(|payload| payload.as_json().and_then(|v| v.get("round")) == Some(&json!(2))));

    // the first handler is silenced by the replacement
    assert!(
        timeout(Duration::from_millis(200), first_rx.recv())
            .await
            .is_err(),
        "replaced handler must stop receiving"
    );

    connection.disconnect();
    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

/// Accepts the session and keeps the socket open until the client leaves.
async fn steady_ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        let _ = send_frame(&mut socket, ServerFrame::Connected { session_id: None }).await;
        while recv_frame(&mut socket).await.is_some() {}
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_disconnect_schedules_no_reconnect() {
    let app = Router::new().route("/ws", get(steady_ws_handler));
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let events = Arc::new(EventBus::new());
    let log = record_connection_events(&events);
    let connection = RealtimeConnection::new(&realtime_config(addr), Arc::clone(&events));
    connection
        .connect(SecretString::new("access-token".to_string()))
        .await
        .expect("connect to mock ws server");

    connection.disconnect();
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    // leave room for an erroneous reconnect timer (interval is 25ms)
    sleep(Duration::from_millis(250)).await;

    let entries = log.lock().expect("lock").clone();
    assert_eq!(entries, vec!["connected", "disconnected:manual"]);
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[derive(Clone)]
struct FlakyWsState {
    connections: Arc<AtomicUsize>,
}

/// Accepts the first session then drops it; every later upgrade is closed
/// before the handshake completes.
async fn flaky_ws_handler(
    State(state): State<FlakyWsState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let connection_number = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    ws.on_upgrade(move |mut socket| async move {
        if connection_number == 1 {
            let _ = send_frame(&mut socket, ServerFrame::Connected { session_id: None }).await;
        }
        let _ = socket.send(Message::Close(None)).await;
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_attempts_stop_at_the_configured_cap() {
    let connections = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/ws", get(flaky_ws_handler))
        .with_state(FlakyWsState {
            connections: Arc::clone(&connections),
        });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let events = Arc::new(EventBus::new());
    let log = record_connection_events(&events);
    let connection = RealtimeConnection::new(&realtime_config(addr), Arc::clone(&events));
    connection
        .connect(SecretString::new("access-token".to_string()))
        .await
        .expect("initial connect should succeed");

    // wait for the reconnect ladder to exhaust itself
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while connection.state() != ConnectionState::Failed {
        assert!(
            tokio::time::Instant::now() < deadline,
            "connection should end in the failed state"
        );
        sleep(Duration::from_millis(20)).await;
    }
    // no further attempts fire after the terminal state
    sleep(Duration::from_millis(150)).await;

    let entries = log.lock().expect("lock").clone();
    let connected = entries.iter().filter(|entry| *entry == "connected").count();
    let reconnecting: Vec<&String> = entries
        .iter()
        .filter(|entry| entry.starts_with("reconnecting"))
        .collect();
    assert_eq!(connected, 1, "only the initial connect may succeed");
    assert_eq!(reconnecting, vec!["reconnecting:1", "reconnecting:2"]);
    assert_eq!(connection.state(), ConnectionState::Failed);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

// ---------------------------------------------------------------------------
// Session facade: full connect flow against one mock backend
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct SessionWsState {
    observed_subscribe: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

async fn session_ws_handler(
    State(state): State<SessionWsState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let bearer_present = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("Bearer "));
    if !bearer_present {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |mut socket| async move {
        let _ = send_frame(
            &mut socket,
            ServerFrame::Connected {
                session_id: Some("s-9".to_string()),
            },
        )
        .await;
        while let Some(frame) = recv_frame(&mut socket).await {
            if let ClientFrame::Subscribe { destination } = frame {
                let body = json!({
                    "id": "msg-1",
                    "channelId": "ch-9",
                    "senderId": "user-7",
                    "type": "TEXT",
                    "content": "welcome",
                    "isEdited": false,
                    "isDeleted": false,
                    "createdAt": "2025-11-02T10:15:30Z"
                })
                .to_string();
                let _ = send_frame(
                    &mut socket,
                    ServerFrame::Message {
                        destination: destination.clone(),
                        body,
                    },
                )
                .await;
                if let Some(tx) = state.observed_subscribe.lock().await.take() {
                    let _ = tx.send(destination);
                }
            }
        }
    })
    .into_response()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_connect_flow_wires_credentials_realtime_and_events() {
    let (observed_tx, observed_rx) = oneshot::channel();
    let ws_state = SessionWsState {
        observed_subscribe: Arc::new(Mutex::new(Some(observed_tx))),
    };
    let app = Router::new()
        .route("/ws", get(session_ws_handler))
        .route(
            "/api/v1/users/me",
            get(|| async {
                Json(json!({
                    "id": "user-42",
                    "username": "casey",
                    "createdAt": "2025-01-01T00:00:00Z"
                }))
            }),
        )
        .with_state(ws_state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let session = ChatSession::new(SdkConfig::new(format!("http://{addr}")))
        .expect("build chat session");

    let (message_tx, mut message_rx) = mpsc::unbounded_channel();
    let _listener = session.messages.on_message(move |channel_id, _message| {
        let _ = message_tx.send(channel_id.to_string());
    });

    session
        .connect(ConnectOptions::new(make_jwt("user-42")))
        .await
        .expect("connect session");

    assert!(session.is_connected());
    assert_eq!(session.current_user_id().as_deref(), Some("user-42"));

    // the default subscription targets the personal message queue
    let observed = timeout(RECV_TIMEOUT, observed_rx)
        .await
        .expect("subscribe should be observed")
        .expect("observation channel should stay open");
    assert_eq!(observed, "/user/queue/messages");

    // inbound queue traffic is re-published as `message.new`
    let channel_id = timeout(RECV_TIMEOUT, message_rx.recv())
        .await
        .expect("message.new should fire")
        .expect("listener should stay registered");
    assert_eq!(channel_id, "ch-9");

    // HTTP rides the same credential
    let profile: UserProfile = session.users.me().await.expect("fetch profile");
    assert_eq!(profile.user.id, "user-42");

    session.disconnect();
    assert!(!session.is_connected());
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert!(session.current_user_id().is_none());

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}
