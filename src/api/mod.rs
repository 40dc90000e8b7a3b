//! Client for the remote directory/auth service.
//!
//! The service itself is external; this module only speaks its JSON API:
//! login/logout, the endpoint directory, the DNS policy and session
//! management.

mod types;

pub use types::{AppSession, DnsPolicy, Endpoint, LocationsResponse, LoginResponse};

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Header carrying the app session token.
const SESSION_HEADER: &str = "X-App-Session-Token";

/// Errors returned by the directory service client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status without an error message
    #[error("server returned status {0}")]
    Status(u16),

    /// Error message reported by the service
    #[error("{0}")]
    Server(String),

    /// Too many app sessions; one must be terminated before logging in
    #[error("Maximum number of app sessions reached")]
    SessionLimit { sessions: Vec<AppSession> },

    /// Response body could not be decoded
    #[error("could not parse server response: {0}")]
    Decode(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP client for the directory service.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a client; `token` is attached to every request when present.
    pub fn new(base_url: &str, timeout: Duration, token: Option<String>) -> ApiResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(ApiClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> ApiResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "sending directory request");

        let mut request = self.http.request(method, &url);
        if let Some(token) = &self.token {
            request = request.header(SESSION_HEADER, token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, what: &str) -> ApiResult<T> {
        let response = self.send::<()>(Method::GET, path, None).await?;
        let status = response.status();
        if !status.is_success() {
            warn!(%status, what, "directory request failed");
            return Err(ApiError::Status(status.as_u16()));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(format!("{what}: {e}")))
    }

    /// Log in with account credentials.
    pub async fn login(&self, username: &str, password: &str) -> ApiResult<LoginResponse> {
        let payload = serde_json::json!({
            "username": username,
            "password": password,
        });
        let response = self.send(Method::POST, "/app/login", Some(&payload)).await?;
        let status = response.status();
        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        if status == StatusCode::CONFLICT {
            info!(sessions = body.sessions.len(), "login rejected: session limit reached");
            return Err(ApiError::SessionLimit {
                sessions: body.sessions,
            });
        }
        if status != StatusCode::OK {
            if !body.error.is_empty() {
                return Err(ApiError::Server(body.error));
            }
            return Err(ApiError::Server(format!(
                "invalid credentials or server error (status {})",
                status.as_u16()
            )));
        }
        Ok(body)
    }

    /// Invalidate the current app session on the server.
    pub async fn logout(&self) -> ApiResult<()> {
        let response = self.send::<()>(Method::POST, "/app/logout", None).await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            other => Err(ApiError::Status(other.as_u16())),
        }
    }

    /// Fetch the DNS resolvers for this account.
    pub async fn dns_settings(&self) -> ApiResult<DnsPolicy> {
        self.get_json("/app/dns_settings", "dns settings").await
    }

    /// Fetch the endpoint directory and the user identity.
    pub async fn locations(&self) -> ApiResult<LocationsResponse> {
        self.get_json("/app/locations", "locations").await
    }

    /// List the account's active app sessions.
    pub async fn sessions(&self) -> ApiResult<Vec<AppSession>> {
        self.get_json("/app/sessions", "sessions").await
    }

    /// Terminate an app session using the current token.
    pub async fn delete_session(&self, session_id: i64) -> ApiResult<()> {
        let path = format!("/app/sessions/delete/{session_id}");
        let response = self.send::<()>(Method::POST, &path, None).await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            other => Err(ApiError::Status(other.as_u16())),
        }
    }

    /// Terminate an app session with credentials, used when login hits the session limit.
    pub async fn delete_session_with_credentials(
        &self,
        username: &str,
        password: &str,
        session_id: i64,
    ) -> ApiResult<LoginResponse> {
        let payload = serde_json::json!({
            "username": username,
            "password": password,
            "session_id_to_delete": session_id,
        });
        let response = self
            .send(Method::POST, "/app/delete-session", Some(&payload))
            .await?;
        let status = response.status();
        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        if status != StatusCode::OK || body.status != "success" {
            if !body.error.is_empty() {
                return Err(ApiError::Server(body.error));
            }
            return Err(ApiError::Server("failed to terminate session".to_string()));
        }
        Ok(body)
    }
}
