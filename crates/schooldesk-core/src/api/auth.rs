//! Raw calls to the backend's auth endpoints.
//!
//! These never go through the intercepting [`ApiClient`](super::ApiClient):
//! a 401 from the refresh endpoint must end the session, not start another
//! refresh.

use std::time::Duration;

use reqwest::{header, Client, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::ApiError;
use crate::auth::error::GENERIC_LOGIN_ERROR;
use crate::auth::AuthError;
use crate::config::{endpoint_url, Endpoints};
use crate::models::UserProfile;

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user: Option<UserProfile>,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    /// Present only if the backend rotates refresh tokens.
    pub refresh_token: Option<String>,
}

/// `/auth/me` answers `{"user": {...}}`; older builds answered the bare profile.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProfileResponse {
    Wrapped { user: UserProfile },
    Bare(UserProfile),
}

/// Client for the login, refresh and profile endpoints.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct AuthApi {
    client: Client,
    base_url: Url,
    endpoints: Endpoints,
}

impl AuthApi {
    pub fn new(base_url: Url, endpoints: Endpoints, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            endpoints,
        })
    }

    /// Exchange a username and password for tokens.
    ///
    /// Any non-success answer becomes [`AuthError::Credentials`] carrying the
    /// server's message, or a generic one if the body has none.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, AuthError> {
        let url = endpoint_url(&self.base_url, &self.endpoints.login).map_err(ApiError::from)?;

        let response = self
            .client
            .post(url)
            .header(header::ACCEPT, "application/json")
            .json(&LoginRequest { username, password })
            .send()
            .await
            .map_err(ApiError::from)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            debug!(%status, "Login rejected");
            let message =
                ApiError::server_message(&body).unwrap_or_else(|| GENERIC_LOGIN_ERROR.to_string());
            return Err(AuthError::Credentials(message));
        }

        let login: LoginResponse = response.json().await.map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse login response: {}", e))
        })?;
        Ok(login)
    }

    /// Mint a new access token.
    ///
    /// The refresh token goes both in the body and as the bearer credential;
    /// backends differ in which one they read.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, ApiError> {
        let url = endpoint_url(&self.base_url, &self.endpoints.refresh)?;

        let response = self
            .client
            .post(url)
            .bearer_auth(refresh_token)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse refresh response: {}", e)))
    }

    /// Fetch the profile of the user owning `access_token`.
    pub async fn profile(&self, access_token: &str) -> Result<UserProfile, ApiError> {
        let url = endpoint_url(&self.base_url, &self.endpoints.profile)?;

        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let profile: ProfileResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse profile response: {}", e)))?;

        Ok(match profile {
            ProfileResponse::Wrapped { user } => user,
            ProfileResponse::Bare(user) => user,
        })
    }

    /// Check if response is successful, returning an error with body if not.
    pub(crate) async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }
}
