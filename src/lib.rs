//! Client SDK for the RelayChat backend: an authenticated, continuously
//! reconnecting realtime session with request/response HTTP access layered on
//! the same credentials.
//!
//! The crate is organized by concern:
//! - `session`: the caller-owned facade composing the pieces below.
//! - `auth`: credential store with single-flight token refresh.
//! - `http`: HTTP dispatcher that recovers from credential expiry.
//! - `realtime`: websocket connection, wire frames, and subscriptions.
//! - `events`: in-process event bus and typed session events.
//! - `modules`: channel, message, and user helpers over the core.
//! - `config`, `storage`, `types`: configuration, the token persistence port,
//!   and the wire data model.

/// Credential store and token refresh.
pub mod auth;
/// Session configuration and connect options.
pub mod config;
/// Event bus and typed session events.
pub mod events;
/// HTTP request dispatcher.
pub mod http;
/// Channel, message, and user modules.
pub mod modules;
/// Realtime connection and wire frames.
pub mod realtime;
/// The session facade.
pub mod session;
/// Token persistence port.
pub mod storage;
/// Wire data model.
pub mod types;

pub use auth::{AuthError, Credential, CredentialStore, TokenPair};
pub use config::{ConnectOptions, SdkConfig};
pub use events::{DisconnectReason, EventBus, ListenerHandle, SessionEvent};
pub use http::{ApiError, RequestDispatcher};
pub use realtime::connection::{
    ConnectionState, RealtimeConnection, RealtimeError, RealtimePayload, SubscriptionHandle,
};
pub use session::{ChatSession, ConnectError};
pub use storage::{MemoryTokenStorage, StorageError, TokenStorage};
