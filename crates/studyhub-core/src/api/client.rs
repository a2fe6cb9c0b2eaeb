//! Authenticated HTTP client for the StudyHub REST API.
//!
//! Every call from the rest of the application goes through `ApiClient::send`.
//! It attaches the current access credential, and on a 401 hands off to the
//! `RefreshCoordinator` and resends the request once with the renewed
//! credential.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::error::{ApiError, RenewalError};
use super::refresh::RefreshCoordinator;
use super::request::ApiRequest;
use crate::auth::{AuthState, TokenPair};
use crate::config::Config;

// ============================================================================
// Constants
// ============================================================================

/// Obtain a token pair from username and password
pub const LOGIN_PATH: &str = "/token/";

/// Exchange a refresh credential for a new pair
pub const REFRESH_PATH: &str = "/token/refresh/";

/// Revoke a refresh credential
pub const LOGOUT_PATH: &str = "/users/logout/";

/// Set a new password after an admin-issued one
pub const SET_INITIAL_PASSWORD_PATH: &str = "/users/set-initial-password/";

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
    // Issuers that don't rotate only send a new access credential.
    refresh: Option<String>,
}

/// API client for StudyHub.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling,
/// and clones share the same session and renewal gate.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    auth: Arc<AuthState>,
    refresh: Arc<RefreshCoordinator>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str, timeout: Duration, auth: Arc<AuthState>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(Self::default_headers())
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            refresh: Arc::new(RefreshCoordinator::new()),
        })
    }

    pub fn from_config(config: &Config, auth: Arc<AuthState>) -> Result<Self, ApiError> {
        Self::new(
            &config.base_url,
            Duration::from_secs(config.request_timeout_secs),
            auth,
        )
    }

    fn default_headers() -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        headers
    }

    pub fn auth(&self) -> &Arc<AuthState> {
        &self.auth
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresh.is_refreshing()
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Compare an endpoint path ignoring query string and slash placement.
    fn same_endpoint(path: &str, endpoint: &str) -> bool {
        let path = path.split('?').next().unwrap_or_default();
        path.trim_matches('/') == endpoint.trim_matches('/')
    }

    fn is_renewal_endpoint(path: &str) -> bool {
        Self::same_endpoint(path, REFRESH_PATH)
    }

    /// Login and renewal: never carry a bearer, never trigger renewal.
    fn is_auth_endpoint(path: &str) -> bool {
        Self::is_renewal_endpoint(path) || Self::same_endpoint(path, LOGIN_PATH)
    }

    /// Send a request, renewing the session once if the credential is rejected.
    ///
    /// Any status other than 401 is returned as-is for the caller to inspect.
    /// A 401 that cannot be handled by renewal surfaces as `Unauthorized`.
    pub async fn send(&self, request: ApiRequest) -> Result<Response, ApiError> {
        let bearer = if Self::is_auth_endpoint(&request.path) {
            None
        } else {
            self.auth.access_token()
        };

        let response = self.transmit(&request, bearer.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        if request.retried || Self::is_auth_endpoint(&request.path) || bearer.is_none() {
            debug!(
                method = %request.method,
                path = %request.path,
                retried = request.retried,
                "Unauthorized, not eligible for renewal"
            );
            return Err(ApiError::Unauthorized);
        }

        warn!(method = %request.method, path = %request.path, "Access credential rejected");
        let access = self
            .refresh
            .renew(&self.auth, bearer.as_deref(), |refresh| {
                self.exchange_refresh(refresh)
            })
            .await?;

        let retry = request.into_retry();
        let response = self.transmit(&retry, Some(&access)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(path = %retry.path, "Renewed credential rejected, giving up");
            return Err(ApiError::Unauthorized);
        }
        Ok(response)
    }

    /// `request(method, path, body?)` shorthand for callers that don't build
    /// an `ApiRequest` themselves.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response, ApiError> {
        let mut request = ApiRequest::new(method, path);
        request.body = body;
        self.send(request).await
    }

    async fn transmit(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<Response, ApiError> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path));
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        debug!(
            method = %request.method,
            path = %request.path,
            status = response.status().as_u16(),
            "Response received"
        );
        Ok(response)
    }

    /// Trade a refresh credential for a new pair. Never goes through `send`,
    /// so a 401 here is terminal.
    async fn exchange_refresh(&self, refresh: String) -> Result<TokenPair, RenewalError> {
        let response = self
            .client
            .post(self.url(REFRESH_PATH))
            .json(&RefreshRequest { refresh: &refresh })
            .send()
            .await
            .map_err(|e| RenewalError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RenewalError::Rejected {
                status: status.as_u16(),
            });
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RenewalError::Malformed(e.to_string()))?;

        Ok(TokenPair {
            access: body.access,
            refresh: body.refresh.unwrap_or(refresh),
        })
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn parse_json<T: DeserializeOwned>(response: Response, path: &str) -> Result<T, ApiError> {
        let response = Self::check_response(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", path, e))
        })
    }

    // ===== Raw helpers =====

    pub async fn get(&self, path: &str) -> Result<Response, ApiError> {
        self.send(ApiRequest::get(path)).await
    }

    pub async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<Response, ApiError> {
        self.send(Self::with_body(Method::POST, path, body)?).await
    }

    pub async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<Response, ApiError> {
        self.send(Self::with_body(Method::PUT, path, body)?).await
    }

    pub async fn patch<B: Serialize>(&self, path: &str, body: &B) -> Result<Response, ApiError> {
        self.send(Self::with_body(Method::PATCH, path, body)?).await
    }

    pub async fn delete(&self, path: &str) -> Result<Response, ApiError> {
        self.send(ApiRequest::delete(path)).await
    }

    fn with_body<B: Serialize>(method: Method, path: &str, body: &B) -> Result<ApiRequest, ApiError> {
        ApiRequest::new(method, path)
            .with_body(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Unserializable request body: {}", e)))
    }

    // ===== Typed helpers =====

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.get(path).await?;
        Self::parse_json(response, path).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self.post(path, body).await?;
        Self::parse_json(response, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryStore;

    fn client(base: &str) -> ApiClient {
        let auth = Arc::new(AuthState::new(Arc::new(MemoryStore::new())));
        ApiClient::new(base, Duration::from_secs(5), auth).unwrap()
    }

    #[test]
    fn test_url_joining() {
        let api = client("http://localhost:8000/api/");
        assert_eq!(api.base_url(), "http://localhost:8000/api");
        assert_eq!(api.url("/modules/"), "http://localhost:8000/api/modules/");
        assert_eq!(api.url("modules/"), "http://localhost:8000/api/modules/");
    }

    #[test]
    fn test_auth_endpoint_detection() {
        assert!(ApiClient::is_renewal_endpoint("/token/refresh/"));
        assert!(ApiClient::is_renewal_endpoint("token/refresh"));
        assert!(ApiClient::is_auth_endpoint("/token/"));
        assert!(ApiClient::is_auth_endpoint("/token/?next=x"));
        assert!(ApiClient::is_auth_endpoint("/token/refresh/"));

        assert!(!ApiClient::is_auth_endpoint("/users/logout/"));
        assert!(!ApiClient::is_auth_endpoint("/modules/token/"));
        assert!(!ApiClient::is_renewal_endpoint("/token/"));
    }
}
