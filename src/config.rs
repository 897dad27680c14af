//! SDK configuration and connect options.

use std::time::Duration;

use secrecy::SecretString;

/// Default websocket endpoint appended to the server URL.
pub const DEFAULT_WS_ENDPOINT: &str = "/ws";
/// Default HTTP request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(3_000);
/// Default cap on consecutive reconnect attempts.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Configuration for a [`crate::session::ChatSession`].
#[derive(Clone, Debug)]
pub struct SdkConfig {
    /// Chat API server URL, e.g. `https://chat.example.com`.
    pub server_url: String,
    /// Websocket endpoint appended to the server URL.
    pub ws_endpoint: String,
    /// HTTP request timeout.
    pub timeout: Duration,
    /// Whether unexpected disconnections trigger automatic reconnects.
    pub auto_reconnect: bool,
    /// Delay between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Cap on consecutive reconnect attempts within one disconnection episode.
    pub max_reconnect_attempts: u32,
    /// Enables request/response and frame tracing.
    pub debug: bool,
}

impl SdkConfig {
    /// Creates a configuration with defaults for everything but the server URL.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            ws_endpoint: DEFAULT_WS_ENDPOINT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            auto_reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            debug: false,
        }
    }

    /// Sets the websocket endpoint.
    pub fn with_ws_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.ws_endpoint = endpoint.into();
        self
    }

    /// Sets the HTTP request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables or disables automatic reconnection.
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Sets the delay between reconnect attempts.
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Sets the cap on consecutive reconnect attempts.
    pub fn with_max_reconnect_attempts(mut self, max: u32) -> Self {
        self.max_reconnect_attempts = max;
        self
    }

    /// Enables debug tracing.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Websocket URL derived from the server URL and endpoint.
    ///
    /// `http`/`https` schemes map to `ws`/`wss`; `ws`/`wss` URLs pass through.
    pub fn ws_url(&self) -> String {
        let base = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.server_url.clone()
        };
        format!("{}{}", base, self.ws_endpoint)
    }
}

/// Credentials supplied to [`crate::session::ChatSession::connect`].
#[derive(Clone)]
pub struct ConnectOptions {
    /// JWT access token.
    pub access_token: SecretString,
    /// JWT refresh token, when the backend issued one.
    pub refresh_token: Option<SecretString>,
}

impl ConnectOptions {
    /// Creates connect options with an access token only.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::new(access_token.into()),
            refresh_token: None,
        }
    }

    /// Attaches a refresh token.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(SecretString::new(refresh_token.into()));
        self
    }
}
