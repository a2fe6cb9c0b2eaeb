use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::credentials::{CredentialStore, TokenPair};
use super::state::{AuthState, EstablishError, SessionEvent, SessionState};
use super::token::Claims;
use crate::api::client::{LOGIN_PATH, LOGOUT_PATH, SET_INITIAL_PASSWORD_PATH};
use crate::api::{ApiClient, ApiError, ApiRequest};
use crate::config::Config;

/// Upper bound on waiting for the server to revoke the refresh credential.
/// Local logout proceeds regardless.
const LOGOUT_TIMEOUT_SECS: u64 = 5;

/// Minimum length for a new password
pub const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access: Option<String>,
    refresh: Option<String>,
    #[serde(default)]
    require_password_change: bool,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: Claims,
    pub require_password_change: bool,
}

#[derive(Debug, Deserialize)]
struct PasswordChangeResponse {
    message: Option<String>,
    error: Option<String>,
}

#[derive(Error, Debug)]
pub enum PasswordChangeError {
    #[error("Password must be at least 8 characters long")]
    TooShort,

    #[error("Passwords do not match")]
    Mismatch,

    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// The signed-in identity plus the client used to act on its behalf.
#[derive(Clone)]
pub struct Session {
    state: Arc<AuthState>,
    api: ApiClient,
}

impl Session {
    pub fn new(api: ApiClient) -> Self {
        Self {
            state: api.auth().clone(),
            api,
        }
    }

    pub fn from_config(config: &Config, store: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        let state = Arc::new(AuthState::new(store));
        Ok(Self::new(ApiClient::from_config(config, state)?))
    }

    pub fn client(&self) -> &ApiClient {
        &self.api
    }

    pub fn state(&self) -> SessionState {
        self.state.state()
    }

    pub fn current_user(&self) -> Option<Claims> {
        self.state.current_user()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.is_authenticated()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.state.subscribe()
    }

    /// Restore the session from the credential store. An expired or
    /// unreadable credential is discarded rather than renewed here.
    pub fn initialize(&self) -> SessionState {
        self.state.initialize_at(chrono::Utc::now())
    }

    /// Exchange username and password for a token pair.
    ///
    /// A 401 becomes `InvalidCredentials` and leaves any existing session
    /// untouched.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginOutcome, ApiError> {
        let request = ApiRequest::new(reqwest::Method::POST, LOGIN_PATH)
            .with_json(json!({ "username": username, "password": password }));

        let response = match self.api.send(request).await {
            Ok(response) => response,
            Err(ApiError::Unauthorized) => {
                info!(username, "Login rejected");
                return Err(ApiError::InvalidCredentials);
            }
            Err(e) => {
                error!(error = %e, "Login request failed");
                return Err(e);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), "Login failed");
            return Err(ApiError::from_status(status, &body));
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse login response: {}", e)))?;

        let (Some(access), Some(refresh)) = (body.access, body.refresh) else {
            return Err(ApiError::InvalidResponse(
                "Login response is missing credentials".to_string(),
            ));
        };

        let user = self
            .state
            .establish(&TokenPair { access, refresh })
            .map_err(|e| match e {
                EstablishError::Decode(e) => ApiError::Decode(e),
                EstablishError::Store(e) => ApiError::Store(e),
            })?;

        info!(
            subject_id = user.subject_id,
            require_password_change = body.require_password_change,
            "Login successful"
        );
        Ok(LoginOutcome {
            user,
            require_password_change: body.require_password_change,
        })
    }

    /// Sign out locally, telling the server to revoke the refresh credential
    /// on a best-effort basis. Never fails and never blocks on the network
    /// longer than the logout timeout.
    pub async fn logout(&self) {
        let refresh = match self.state.stored_pair() {
            Ok(pair) => pair.map(|p| p.refresh),
            Err(e) => {
                warn!(error = %e, "Failed to read stored credentials for logout");
                None
            }
        };

        if let Some(refresh) = refresh {
            let request = ApiRequest::new(reqwest::Method::POST, LOGOUT_PATH)
                .with_json(json!({ "refresh": refresh }));
            let revoke = self.api.send(request);
            match tokio::time::timeout(Duration::from_secs(LOGOUT_TIMEOUT_SECS), revoke).await {
                Ok(Ok(response)) if response.status().is_success() => {
                    info!("Refresh credential revoked");
                }
                Ok(Ok(response)) => {
                    warn!(status = response.status().as_u16(), "Server refused logout");
                }
                Ok(Err(e)) => warn!(error = %e, "Logout request failed"),
                Err(_) => warn!("Logout request timed out"),
            }
        }

        self.state.drop_credentials(None);
    }

    /// Replace an admin-issued password, as required when login reports
    /// `require_password_change`.
    pub async fn set_initial_password(
        &self,
        new_password: &str,
        confirmation: &str,
    ) -> Result<String, PasswordChangeError> {
        validate_new_password(new_password, confirmation)?;

        let request = ApiRequest::new(reqwest::Method::POST, SET_INITIAL_PASSWORD_PATH).with_json(
            json!({
                "new_password": new_password,
                "new_password_confirm": confirmation,
            }),
        );
        let response = self.api.send(request).await?;
        let status = response.status();
        let text = response.text().await.map_err(ApiError::from)?;

        match serde_json::from_str::<PasswordChangeResponse>(&text) {
            Ok(PasswordChangeResponse {
                error: Some(error), ..
            }) => Err(PasswordChangeError::Rejected(error)),
            Ok(PasswordChangeResponse {
                message: Some(message),
                ..
            }) if status.is_success() => {
                info!("Initial password set");
                Ok(message)
            }
            _ if status.is_success() => Ok(String::new()),
            _ => Err(ApiError::from_status(status, &text).into()),
        }
    }
}

pub fn validate_new_password(new_password: &str, confirmation: &str) -> Result<(), PasswordChangeError> {
    if new_password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(PasswordChangeError::TooShort);
    }
    if new_password != confirmation {
        return Err(PasswordChangeError::Mismatch);
    }
    Ok(())
}

/// Turn a login failure into a message fit for the login prompt.
pub fn login_error_message(err: &ApiError) -> String {
    match err {
        ApiError::InvalidCredentials => {
            "Invalid username or password. Please check and try again.".to_string()
        }
        ApiError::NotFound(_) => {
            "Login service unreachable. Please try again later.".to_string()
        }
        ApiError::Network(e) if e.is_timeout() => {
            "Connection timed out. Please try again.".to_string()
        }
        ApiError::Network(_) => {
            "Unable to connect to server. Check your internet connection.".to_string()
        }
        _ => "Login failed. Please try again later.".to_string(),
    }
}
