//! Caller-owned session facade composing credentials, HTTP, realtime, and
//! events.

use std::future::Future;
use std::sync::Arc;

use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::debug;

use crate::auth::{AuthError, CredentialStore, TokenPair};
use crate::config::{ConnectOptions, SdkConfig};
use crate::events::{DisconnectReason, EventBus, ListenerHandle, SessionEvent};
use crate::http::{ApiError, RequestDispatcher};
use crate::modules::{ChannelsApi, MessagesApi, UsersApi};
use crate::realtime::connection::{ConnectionState, RealtimeConnection, RealtimeError};
use crate::storage::TokenStorage;

/// Errors surfaced by [`ChatSession::connect`].
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Credential handling failed.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// The realtime transport failed.
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}

/// One independent chat session.
///
/// Sessions are plain values: construct as many as needed and drop them when
/// done. Nothing here is process-global.
pub struct ChatSession {
    events: Arc<EventBus>,
    credentials: Arc<CredentialStore>,
    http: Arc<RequestDispatcher>,
    realtime: Arc<RealtimeConnection>,
    /// Channel operations.
    pub channels: ChannelsApi,
    /// Message operations.
    pub messages: MessagesApi,
    /// User operations.
    pub users: UsersApi,
}

impl ChatSession {
    /// Creates a session without credential persistence.
    pub fn new(config: SdkConfig) -> Result<Self, ApiError> {
        Self::build(config, None)
    }

    /// Creates a session persisting credentials through `storage`.
    pub fn with_storage(
        config: SdkConfig,
        storage: Arc<dyn TokenStorage>,
    ) -> Result<Self, ApiError> {
        Self::build(config, Some(storage))
    }

    fn build(config: SdkConfig, storage: Option<Arc<dyn TokenStorage>>) -> Result<Self, ApiError> {
        let events = Arc::new(EventBus::new());
        let credentials = Arc::new(match storage {
            Some(storage) => CredentialStore::with_storage(storage),
            None => CredentialStore::new(),
        });
        let http = Arc::new(RequestDispatcher::new(&config, Arc::clone(&credentials))?);
        let realtime = Arc::new(RealtimeConnection::new(&config, Arc::clone(&events)));

        let channels = ChannelsApi::new(
            Arc::clone(&http),
            Arc::clone(&realtime),
            Arc::clone(&events),
            Arc::clone(&credentials),
        );
        let messages = MessagesApi::new(
            Arc::clone(&http),
            Arc::clone(&realtime),
            Arc::clone(&events),
        );
        let users = UsersApi::new(Arc::clone(&http));
        debug!("chat session initialized");

        Ok(Self {
            events,
            credentials,
            http,
            realtime,
            channels,
            messages,
            users,
        })
    }

    /// Connects to the chat server: stores the credentials, opens the realtime
    /// connection, and installs the default personal message-queue
    /// subscription.
    pub async fn connect(&self, options: ConnectOptions) -> Result<(), ConnectError> {
        debug!("connecting to chat server");
        self.credentials.set_credential(
            options.access_token.expose_secret(),
            options.refresh_token.as_ref().map(|token| token.expose_secret().as_str()),
        );
        self.realtime.connect(options.access_token.clone()).await?;

        // personal queue: every inbound message is re-published as a
        // `message.new` bus event
        let _ = self.messages.subscribe_to_user_messages(|message| {
            debug!(message_id = %message.id, "received message");
        });
        debug!("connected");
        Ok(())
    }

    /// Disconnects the realtime transport, clears credentials, and removes
    /// every event listener.
    pub fn disconnect(&self) {
        debug!("disconnecting");
        self.realtime.disconnect();
        self.credentials.clear();
        self.events.remove_all(None);
    }

    /// True iff the realtime connection is established.
    pub fn is_connected(&self) -> bool {
        self.realtime.is_connected()
    }

    /// Current realtime connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.realtime.state()
    }

    /// User id decoded from the current access token.
    pub fn current_user_id(&self) -> Option<String> {
        self.credentials.user_id()
    }

    /// Installs the host callback invoked when credentials must be refreshed.
    pub fn set_refresh_callback<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TokenPair, Box<dyn std::error::Error + Send + Sync>>>
            + Send
            + 'static,
    {
        self.credentials.set_refresh_callback(callback);
    }

    /// Restores a persisted credential, returning whether one was found.
    pub fn load_persisted_credential(&self) -> bool {
        self.credentials.load_persisted()
    }

    /// Listens for `connection.connected`.
    pub fn on_connected<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.events.on("connection.connected", move |_| listener())
    }

    /// Listens for `connection.disconnected`.
    pub fn on_disconnected<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(DisconnectReason) + Send + Sync + 'static,
    {
        self.events.on("connection.disconnected", move |event| {
            if let SessionEvent::Disconnected { reason } = event {
                listener(*reason);
            }
        })
    }

    /// Listens for `connection.reconnecting`.
    pub fn on_reconnecting<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.events.on("connection.reconnecting", move |event| {
            if let SessionEvent::Reconnecting { attempt } = event {
                listener(*attempt);
            }
        })
    }

    /// Listens for `connection.error`.
    pub fn on_connection_error<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.on("connection.error", move |event| {
            if let SessionEvent::ConnectionError { message } = event {
                listener(message);
            }
        })
    }

    /// The session's event bus, for advanced use.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The session's credential store, for advanced use.
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// The session's HTTP dispatcher, for advanced use.
    pub fn http(&self) -> &Arc<RequestDispatcher> {
        &self.http
    }

    /// The session's realtime connection, for advanced use.
    pub fn realtime(&self) -> &Arc<RealtimeConnection> {
        &self.realtime
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SdkConfig;

    use super::ChatSession;

    #[test]
    fn sessions_are_independent_values() {
        let first = ChatSession::new(SdkConfig::new("http://localhost:1")).expect("build");
        let second = ChatSession::new(SdkConfig::new("http://localhost:2")).expect("build");

        let _handle = first.events().on("connection.connected", |_| {});
        assert_eq!(first.events().listener_count("connection.connected"), 1);
        assert_eq!(second.events().listener_count("connection.connected"), 0);
    }

    #[test]
    fn current_user_id_is_none_before_connect() {
        let session = ChatSession::new(SdkConfig::new("http://localhost:1")).expect("build");
        assert!(session.current_user_id().is_none());
        assert!(!session.is_connected());
    }
}
