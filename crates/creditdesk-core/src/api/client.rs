//! Authenticated HTTP client for the admin API.
//!
//! Every request carries the stored bearer token. A 401 triggers one shared
//! token refresh and a single replay of the failed request; a 403, or any
//! failure of the refresh itself, ends the session and sends the user back
//! to sign-in.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::error::{ApiError, RefreshError};
use super::policy::{decide, Disposition};
use super::refresh::{RefreshCoordinator, RefreshTicket};
use crate::auth::{Session, SessionData, SessionStore, SignInNavigator};

// ============================================================================
// Constants
// ============================================================================

/// Backend route issuing a new token from the session cookie.
pub const REFRESH_TOKEN_PATH: &str = "/api/auth/refresh-token";

/// Client-side route users are sent to when their session ends.
pub const SIGN_IN_ROUTE: &str = "/auth/signin";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on a refresh call. Requests queued behind a refresh wait at
/// most this long before they are rejected.
const REFRESH_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub refresh_path: String,
    pub sign_in_route: String,
    pub request_timeout: Duration,
    pub refresh_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            refresh_path: REFRESH_TOKEN_PATH.to_string(),
            sign_in_route: SIGN_IN_ROUTE.to_string(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            refresh_timeout: Duration::from_secs(REFRESH_TIMEOUT_SECS),
        }
    }
}

/// A request the client can send again after a token refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Whether this request has already been replayed after a refresh.
    pub fn is_retried(&self) -> bool {
        self.retried
    }
}

/// Failed attempt, before it is turned into an `ApiError`.
enum Failure {
    Status(Response),
    Transport(reqwest::Error),
}

impl Failure {
    fn status(&self) -> Option<StatusCode> {
        match self {
            Failure::Status(response) => Some(response.status()),
            Failure::Transport(e) => e.status(),
        }
    }

    async fn into_error(self) -> ApiError {
        match self {
            Failure::Status(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                ApiError::from_status(status, &body)
            }
            Failure::Transport(e) => ApiError::NetworkError(e),
        }
    }
}

/// Admin API client.
/// Clone is cheap - clones share the connection pool, the stored session and
/// the refresh gate.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    config: Arc<ClientConfig>,
    session: Session,
    navigator: Arc<dyn SignInNavigator>,
    refresh: RefreshCoordinator,
    default_token: Arc<RwLock<Option<String>>>,
    /// Bumped by every logout. A refresh that started under an older value
    /// must not bring the session back.
    logout_epoch: Arc<Mutex<u64>>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn SessionStore>,
        navigator: Arc<dyn SignInNavigator>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            config: Arc::new(config),
            session: Session::new(store),
            navigator,
            refresh: RefreshCoordinator::new(),
            default_token: Arc::new(RwLock::new(None)),
            logout_epoch: Arc::new(Mutex::new(0)),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    /// Token attached when the stored session has none (set by refreshes).
    pub fn default_token(&self) -> Option<String> {
        self.default_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_default_token(&self, token: Option<String>) {
        *self.default_token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn lock_epoch(&self) -> MutexGuard<'_, u64> {
        self.logout_epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
        }
    }

    fn is_refresh_call(&self, request: &ApiRequest) -> bool {
        let refresh_path = self.config.refresh_path.trim_end_matches('/');
        if refresh_path.is_empty() {
            return false;
        }
        let path = request.path.split('?').next().unwrap_or_default();
        path.trim_end_matches('/').ends_with(refresh_path)
    }

    /// Token for an outgoing request: the stored session first, then the
    /// client default.
    fn outbound_token(&self) -> Option<String> {
        self.session.token().or_else(|| self.default_token())
    }

    async fn send(&self, request: &ApiRequest, token: Option<&str>) -> Result<Response, reqwest::Error> {
        let mut builder = self.client.request(request.method.clone(), self.url(&request.path));
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }
        builder.send().await
    }

    /// Send a request, recovering from an expired token.
    ///
    /// Successful responses are returned as-is. A first 401 is refreshed and
    /// replayed exactly once; a 403 or a failing refresh call ends the session;
    /// every other failure is returned unchanged.
    pub async fn execute(&self, mut request: ApiRequest) -> Result<Response, ApiError> {
        let mut replay_token: Option<String> = None;

        loop {
            let token = replay_token.take().or_else(|| self.outbound_token());
            debug!(
                method = %request.method,
                path = %request.path,
                authenticated = token.is_some(),
                retried = request.retried,
                "Sending request"
            );

            let failure = match self.send(&request, token.as_deref()).await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => Failure::Status(response),
                Err(e) => Failure::Transport(e),
            };

            let status = failure.status();
            match decide(status, self.is_refresh_call(&request), request.retried) {
                Disposition::PassThrough => return Err(failure.into_error().await),
                Disposition::Logout => {
                    warn!(
                        path = %request.path,
                        status = ?status,
                        "Authorization failure is terminal, ending session"
                    );
                    self.end_session();
                    return Err(failure.into_error().await);
                }
                Disposition::Refresh => {
                    drop(failure);
                    // Flag first so a replay that fails again is never refreshed again.
                    request.retried = true;
                    let token = self.refreshed_token().await?;
                    debug!(path = %request.path, "Replaying request with refreshed token");
                    replay_token = Some(token);
                }
            }
        }
    }

    /// Obtain a fresh token, either by leading the refresh or by waiting for
    /// the one in flight.
    async fn refreshed_token(&self) -> Result<String, ApiError> {
        let guard = match self.refresh.enqueue_or_start() {
            RefreshTicket::Follower(waiter) => return Ok(waiter.wait().await?),
            RefreshTicket::Leader(guard) => guard,
        };

        let epoch = *self.lock_epoch();
        let outcome = self
            .call_refresh_endpoint()
            .await
            .and_then(|data| self.adopt_refreshed_session(data, epoch));

        match outcome {
            Ok(token) => {
                let waiters = guard.settle(Ok(token.clone()));
                info!(waiters = waiters, "Access token refreshed");
                Ok(token)
            }
            Err(RefreshError::LoggedOut) => {
                warn!("Session ended while the token refresh was in flight, discarding new token");
                guard.settle(Err(RefreshError::LoggedOut));
                Err(ApiError::RefreshFailed(RefreshError::LoggedOut))
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, ending session");
                guard.settle(Err(e.clone()));
                self.end_session();
                Err(ApiError::RefreshFailed(e))
            }
        }
    }

    /// Make a refreshed session the source of truth, unless a logout
    /// happened since `epoch` was read.
    ///
    /// The epoch lock is held across the check and the write, so a
    /// concurrent `end_session` either runs first (and wins) or clears
    /// what was written here.
    fn adopt_refreshed_session(&self, data: SessionData, epoch: u64) -> Result<String, RefreshError> {
        let current = self.lock_epoch();
        if *current != epoch {
            return Err(RefreshError::LoggedOut);
        }
        // A stale entry left in the store would shadow the new token.
        self.session
            .save(&data)
            .map_err(|e| RefreshError::Storage(format!("{:#}", e)))?;
        self.set_default_token(Some(data.token.clone()));
        Ok(data.token)
    }

    async fn call_refresh_endpoint(&self) -> Result<SessionData, RefreshError> {
        let limit = self.config.refresh_timeout;
        tokio::time::timeout(limit, self.exchange_refresh_token())
            .await
            .unwrap_or(Err(RefreshError::TimedOut(limit)))
    }

    async fn exchange_refresh_token(&self) -> Result<SessionData, RefreshError> {
        let request = ApiRequest::post(self.config.refresh_path.clone());
        let token = self.outbound_token();

        let response = self
            .send(&request, token.as_deref())
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                body: ApiError::truncate_body(&body),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| RefreshError::Decode(e.to_string()))?;
        SessionData::from_refresh_payload(payload)
    }

    /// Drop the session and hand control to the sign-in navigator.
    fn end_session(&self) {
        {
            let mut epoch = self.lock_epoch();
            *epoch += 1;
            if let Err(e) = self.session.clear() {
                warn!(error = %e, "Failed to delete stored session");
            }
            self.set_default_token(None);
        }
        self.navigator.navigate_to_sign_in(&self.config.sign_in_route);
    }

    /// End the current session on request.
    pub fn logout(&self) {
        info!("Logging out");
        self.end_session();
    }

    async fn decode<T: DeserializeOwned>(response: Response, path: &str) -> Result<T, ApiError> {
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", path, e))
        })
    }

    fn encode<B: Serialize>(body: &B) -> Result<Value, ApiError> {
        serde_json::to_value(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))
    }

    // ===== Typed helpers =====

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.execute(ApiRequest::get(path)).await?;
        Self::decode(response, path).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let request = ApiRequest::post(path).json(Self::encode(body)?);
        let response = self.execute(request).await?;
        Self::decode(response, path).await
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let request = ApiRequest::new(Method::PUT, path).json(Self::encode(body)?);
        let response = self.execute(request).await?;
        Self::decode(response, path).await
    }

    pub async fn patch_json<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let request = ApiRequest::new(Method::PATCH, path).json(Self::encode(body)?);
        let response = self.execute(request).await?;
        Self::decode(response, path).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.execute(ApiRequest::new(Method::DELETE, path)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{LogNavigator, MemorySessionStore};

    fn client(base_url: &str) -> ApiClient {
        ApiClient::new(
            ClientConfig::new(base_url),
            Arc::new(MemorySessionStore::new()),
            Arc::new(LogNavigator),
        )
        .expect("client")
    }

    #[test]
    fn test_url_joins_base_and_path() {
        let api = client("http://admin.local/");
        assert_eq!(api.url("/api/plans"), "http://admin.local/api/plans");
        assert_eq!(api.url("https://other.host/x"), "https://other.host/x");
    }

    #[test]
    fn test_refresh_call_detection() {
        let api = client("http://admin.local");
        assert!(api.is_refresh_call(&ApiRequest::post("/api/auth/refresh-token")));
        assert!(api.is_refresh_call(&ApiRequest::post("/api/auth/refresh-token?x=1")));
        assert!(api.is_refresh_call(&ApiRequest::post("http://admin.local/api/auth/refresh-token/")));
        assert!(!api.is_refresh_call(&ApiRequest::get("/api/auth/me")));
    }

    #[test]
    fn test_blank_refresh_path_matches_nothing() {
        let mut config = ClientConfig::new("http://admin.local");
        config.refresh_path = "/".to_string();
        let api = ApiClient::new(config, Arc::new(MemorySessionStore::new()), Arc::new(LogNavigator))
            .expect("client");
        assert!(!api.is_refresh_call(&ApiRequest::get("/api/plans")));
    }

    #[test]
    fn test_outbound_token_prefers_stored_session() {
        let api = client("http://admin.local");
        assert_eq!(api.outbound_token(), None);

        api.set_default_token(Some("fallback".to_string()));
        assert_eq!(api.outbound_token().as_deref(), Some("fallback"));

        api.session().save(&SessionData::new("stored")).unwrap();
        assert_eq!(api.outbound_token().as_deref(), Some("stored"));
    }

    #[test]
    fn test_logout_clears_default_token() {
        let api = client("http://admin.local");
        api.set_default_token(Some("T".to_string()));
        api.session().save(&SessionData::new("T")).unwrap();

        api.logout();

        assert_eq!(api.default_token(), None);
        assert_eq!(api.session().load(), None);
    }

    #[test]
    fn test_refreshed_session_is_not_adopted_after_logout() {
        let api = client("http://admin.local");
        let epoch = *api.lock_epoch();

        api.logout();

        assert_eq!(
            api.adopt_refreshed_session(SessionData::new("T2"), epoch),
            Err(RefreshError::LoggedOut)
        );
        assert_eq!(api.session().load(), None);
        assert_eq!(api.default_token(), None);

        let epoch = *api.lock_epoch();
        assert_eq!(api.adopt_refreshed_session(SessionData::new("T3"), epoch).as_deref(), Ok("T3"));
        assert_eq!(api.session().token().as_deref(), Some("T3"));
    }

    #[test]
    fn test_request_builder() {
        let request = ApiRequest::get("/api/coupons")
            .query("page", "2")
            .query("status", "active");
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.query.len(), 2);
        assert!(!request.is_retried());
    }
}
