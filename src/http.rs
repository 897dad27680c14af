//! HTTP request dispatcher with bearer injection and credential recovery.
//!
//! Every request carries the current access token when one is held. An
//! unauthorized response triggers exactly one credential refresh followed by
//! one resubmission of the original request; a second unauthorized response
//! surfaces as an [`ApiError`] without further retries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::CredentialStore;
use crate::config::SdkConfig;

/// Normalized HTTP failure surfaced to callers.
#[derive(Clone, Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    /// Machine-readable code from the response body, or a transport kind.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Structured response body, when the server returned one.
    pub details: Option<Value>,
    /// When the error was observed.
    pub timestamp: DateTime<Utc>,
}

impl ApiError {
    fn new(code: impl Into<String>, message: impl Into<String>, details: Option<Value>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details,
            timestamp: Utc::now(),
        }
    }

    fn from_response(status: StatusCode, body: &str) -> Self {
        let details: Option<Value> = serde_json::from_str(body).ok();
        let code = details
            .as_ref()
            .and_then(|value| value.get("code"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP_{}", status.as_u16()));
        let message = details
            .as_ref()
            .and_then(|value| value.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| "request failed".to_string());
        Self::new(code, message, details)
    }

    fn from_transport(error: &reqwest::Error) -> Self {
        let code = if error.is_timeout() {
            "TIMEOUT"
        } else if error.is_connect() {
            "CONNECTION_ERROR"
        } else {
            "NETWORK_ERROR"
        };
        Self::new(code, error.to_string(), None)
    }
}

/// Issues HTTP calls on behalf of the domain modules.
pub struct RequestDispatcher {
    http: Client,
    base_url: String,
    credentials: Arc<CredentialStore>,
    debug: bool,
}

impl RequestDispatcher {
    /// Builds a dispatcher from the session configuration.
    pub fn new(config: &SdkConfig, credentials: Arc<CredentialStore>) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| ApiError::from_transport(&err))?;
        Ok(Self {
            http,
            base_url: config.server_url.clone(),
            credentials,
            debug: config.debug,
        })
    }

    /// GET with query parameters.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        self.execute(Method::GET, path, query, None).await
    }

    /// POST with a JSON body.
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.execute(Method::POST, path, &[], Some(to_body(body)?))
            .await
    }

    /// POST without a body.
    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.execute(Method::POST, path, &[], None).await
    }

    /// PUT with a JSON body.
    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.execute(Method::PUT, path, &[], Some(to_body(body)?))
            .await
    }

    /// PATCH with a JSON body.
    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.execute(Method::PATCH, path, &[], Some(to_body(body)?))
            .await
    }

    /// DELETE.
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.execute(Method::DELETE, path, &[], None).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<T, ApiError> {
        let mut retried = false;
        loop {
            let url = format!("{}{}", self.base_url, path);
            let mut request = self.http.request(method.clone(), url.as_str());
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }
            if let Some(token) = self.credentials.access_token() {
                request = request.bearer_auth(token.expose_secret());
            }
            if self.debug {
                debug!(method = %method, path, "dispatching request");
            }

            let response = request
                .send()
                .await
                .map_err(|err| ApiError::from_transport(&err))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|err| ApiError::from_transport(&err))?;
            if self.debug {
                debug!(status = status.as_u16(), path, "response received");
            }

            if status == StatusCode::UNAUTHORIZED && !retried {
                retried = true;
                match self.credentials.refresh().await {
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(error = %err, "token refresh failed while recovering from unauthorized response");
                        return Err(ApiError::from_response(status, &text));
                    }
                }
            }
            if !status.is_success() {
                return Err(ApiError::from_response(status, &text));
            }
            return parse_body(&text);
        }
    }
}

fn to_body<B: Serialize + ?Sized>(body: &B) -> Result<Value, ApiError> {
    serde_json::to_value(body)
        .map_err(|err| ApiError::new("SERIALIZATION_ERROR", err.to_string(), None))
}

fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    // empty bodies (204-style responses) deserialize as JSON null
    let payload = if body.trim().is_empty() { "null" } else { body };
    serde_json::from_str(payload).map_err(|err| {
        ApiError::new(
            "PARSE_ERROR",
            format!("failed to parse response body: {err}"),
            None,
        )
    })
}
