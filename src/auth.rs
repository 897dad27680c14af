//! Credential store: token lifecycle, JWT claim decoding, and single-flight
//! refresh.
//!
//! The store is the only writer of the shared credential. Both the HTTP
//! dispatcher and the realtime connection read it; mutation goes through
//! [`CredentialStore::set_credential`] and the refresh path, which collapses
//! concurrent callers onto one in-flight operation.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage::TokenStorage;

/// Remaining validity below which a token is treated as already expired.
const EXPIRY_SKEW_SECS: i64 = 300;
/// Remaining validity below which a refresh should be scheduled.
const REFRESH_WINDOW_SECS: i64 = 600;

const ACCESS_TOKEN_KEY: &str = "chat_sdk:access_token";
const REFRESH_TOKEN_KEY: &str = "chat_sdk:refresh_token";
const USER_ID_KEY: &str = "chat_sdk:user_id";

/// Token pair returned by the host refresh callback.
#[derive(Clone)]
pub struct TokenPair {
    /// New JWT access token.
    pub access_token: String,
    /// New refresh token, when the backend rotated it.
    pub refresh_token: Option<String>,
}

/// Errors produced by credential management.
#[derive(Clone, Debug, Error)]
pub enum AuthError {
    /// `refresh` was called before a refresh callback was installed.
    #[error("no refresh callback configured")]
    NoRefreshCallback,
    /// The host refresh callback failed.
    #[error("refresh callback error: {0}")]
    RefreshFailed(String),
}

/// Snapshot of the currently held credential.
#[derive(Clone, Debug)]
pub struct Credential {
    /// Raw access token.
    pub access_token: SecretString,
    /// Raw refresh token, when present.
    pub refresh_token: Option<SecretString>,
    /// Subject claim of the access token; `Some` iff the token decoded.
    pub user_id: Option<String>,
    /// Expiry claim (unix seconds) of the access token.
    pub expires_at: Option<i64>,
    /// Issued-at claim (unix seconds) of the access token.
    pub issued_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    iat: Option<i64>,
}

type RefreshOutcome = Result<Credential, AuthError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;
type RefreshError = Box<dyn std::error::Error + Send + Sync>;
type RefreshCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<TokenPair, RefreshError>> + Send + Sync>;

/// Owner of the access/refresh token pair and the user identity derived from
/// the access token.
pub struct CredentialStore {
    inner: Arc<Inner>,
}

struct Inner {
    credential: Mutex<Option<Credential>>,
    storage: Option<Arc<dyn TokenStorage>>,
    refresh_callback: Mutex<Option<RefreshCallback>>,
    pending_refresh: Mutex<Option<SharedRefresh>>,
}

/// Clears the pending-refresh marker when the refresh task finishes, on every
/// exit path.
struct ClearPending(Arc<Inner>);

impl Drop for ClearPending {
    fn drop(&mut self) {
        *lock(&self.0.pending_refresh) = None;
    }
}

impl CredentialStore {
    /// Creates a store without persistence.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a store persisting through `storage`.
    pub fn with_storage(storage: Arc<dyn TokenStorage>) -> Self {
        Self::build(Some(storage))
    }

    fn build(storage: Option<Arc<dyn TokenStorage>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                credential: Mutex::new(None),
                storage,
                refresh_callback: Mutex::new(None),
                pending_refresh: Mutex::new(None),
            }),
        }
    }

    /// Installs the host callback used by [`CredentialStore::refresh`].
    pub fn set_refresh_callback<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TokenPair, RefreshError>> + Send + 'static,
    {
        let callback: RefreshCallback = Arc::new(move || callback().boxed());
        *lock(&self.inner.refresh_callback) = Some(callback);
    }

    /// Replaces the held credential, decoding identity and expiry claims from
    /// the access token.
    ///
    /// A malformed token (not three dot-separated base64url segments, or a
    /// non-JSON payload) leaves the claims unset without failing the call;
    /// downstream validity checks treat such a credential as invalid.
    /// Persistence is best-effort.
    pub fn set_credential(&self, access_token: &str, refresh_token: Option<&str>) {
        self.inner.apply_credential(access_token, refresh_token);
    }

    /// True iff a token is present, decodable, and expires more than the skew
    /// buffer into the future.
    pub fn is_valid(&self) -> bool {
        let credential = lock(&self.inner.credential);
        let Some(expires_at) = credential.as_ref().and_then(|c| c.expires_at) else {
            return false;
        };
        expires_at > now_secs() + EXPIRY_SKEW_SECS
    }

    /// True iff a token is present, decodable, and within the refresh window
    /// of its expiry.
    pub fn should_refresh(&self) -> bool {
        let credential = lock(&self.inner.credential);
        let Some(expires_at) = credential.as_ref().and_then(|c| c.expires_at) else {
            return false;
        };
        expires_at - now_secs() < REFRESH_WINDOW_SECS
    }

    /// Runs the host refresh callback and stores the resulting token pair.
    ///
    /// Single-flight: while a refresh is pending, concurrent callers attach to
    /// it and observe the same outcome instead of invoking the callback again.
    /// The pending marker is cleared exactly once when the operation settles,
    /// regardless of success or failure.
    pub async fn refresh(&self) -> RefreshOutcome {
        let shared = {
            let mut pending = lock(&self.inner.pending_refresh);
            if let Some(shared) = pending.as_ref() {
                debug!("attaching to in-flight token refresh");
                shared.clone()
            } else {
                let Some(callback) = lock(&self.inner.refresh_callback).clone() else {
                    return Err(AuthError::NoRefreshCallback);
                };
                let inner = Arc::clone(&self.inner);
                let task = tokio::spawn(async move {
                    let _clear = ClearPending(Arc::clone(&inner));
                    match callback().await {
                        Ok(pair) => {
                            let credential = inner
                                .apply_credential(&pair.access_token, pair.refresh_token.as_deref());
                            debug!("token refresh succeeded");
                            Ok(credential)
                        }
                        Err(err) => {
                            warn!(error = %err, "token refresh failed");
                            Err(AuthError::RefreshFailed(err.to_string()))
                        }
                    }
                });
                let shared: SharedRefresh = async move {
                    match task.await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(AuthError::RefreshFailed(
                            "refresh task stopped before completing".to_string(),
                        )),
                    }
                }
                .boxed()
                .shared();
                *pending = Some(shared.clone());
                shared
            }
        };
        shared.await
    }

    /// Current access token, if any.
    pub fn access_token(&self) -> Option<SecretString> {
        lock(&self.inner.credential)
            .as_ref()
            .map(|c| c.access_token.clone())
    }

    /// Current refresh token, if any.
    pub fn refresh_token(&self) -> Option<SecretString> {
        lock(&self.inner.credential)
            .as_ref()
            .and_then(|c| c.refresh_token.clone())
    }

    /// User id decoded from the access token, if any.
    pub fn user_id(&self) -> Option<String> {
        lock(&self.inner.credential)
            .as_ref()
            .and_then(|c| c.user_id.clone())
    }

    /// Snapshot of the held credential.
    pub fn credential(&self) -> Option<Credential> {
        lock(&self.inner.credential).clone()
    }

    /// Clears the in-memory credential and best-effort clears persisted state.
    pub fn clear(&self) {
        *lock(&self.inner.credential) = None;
        if let Some(storage) = &self.inner.storage {
            if let Err(err) =
                storage.remove(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_ID_KEY])
            {
                warn!(error = %err, "failed to clear persisted credential");
            }
        }
    }

    /// Restores a persisted credential, returning whether one was found.
    pub fn load_persisted(&self) -> bool {
        let Some(storage) = &self.inner.storage else {
            return false;
        };
        let access_token = match storage.get(ACCESS_TOKEN_KEY) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "failed to load persisted credential");
                return false;
            }
        };
        let Some(access_token) = access_token else {
            return false;
        };
        let refresh_token = storage.get(REFRESH_TOKEN_KEY).ok().flatten();
        self.inner
            .apply_credential(&access_token, refresh_token.as_deref());
        debug!("restored persisted credential");
        true
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn apply_credential(&self, access_token: &str, refresh_token: Option<&str>) -> Credential {
        let claims = decode_claims(access_token);
        if claims.is_none() {
            warn!("access token is not a decodable JWT; validity checks will fail");
        }
        let credential = Credential {
            access_token: SecretString::new(access_token.to_string()),
            refresh_token: refresh_token.map(|token| SecretString::new(token.to_string())),
            user_id: claims.as_ref().and_then(|c| c.sub.clone()),
            expires_at: claims.as_ref().and_then(|c| c.exp),
            issued_at: claims.as_ref().and_then(|c| c.iat),
        };
        *lock(&self.credential) = Some(credential.clone());
        self.persist(access_token, refresh_token, credential.user_id.as_deref());
        credential
    }

    fn persist(&self, access_token: &str, refresh_token: Option<&str>, user_id: Option<&str>) {
        let Some(storage) = &self.storage else {
            return;
        };
        if let Err(err) = storage.set(ACCESS_TOKEN_KEY, access_token) {
            warn!(error = %err, "failed to persist access token");
        }
        if let Some(refresh_token) = refresh_token {
            if let Err(err) = storage.set(REFRESH_TOKEN_KEY, refresh_token) {
                warn!(error = %err, "failed to persist refresh token");
            }
        }
        if let Some(user_id) = user_id {
            if let Err(err) = storage.set(USER_ID_KEY, user_id) {
                warn!(error = %err, "failed to persist user id");
            }
        }
    }
}

fn decode_claims(token: &str) -> Option<JwtClaims> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    let raw = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}
