use thiserror::Error;

use super::credentials::StoreError;
use crate::api::ApiError;

/// Message shown when a login fails without a server-provided reason.
pub const GENERIC_LOGIN_ERROR: &str = "Login failed";

#[derive(Error, Debug)]
pub enum AuthError {
    /// Bad username/password, or the backend refused the login.
    #[error("{0}")]
    Credentials(String),

    #[error("Username and password required")]
    MissingCredentials,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Failed to persist credentials: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of a failed refresh, shared between every caller awaiting it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Refresh token rejected")]
    Rejected,

    #[error("Refresh failed: {0}")]
    Failed(String),
}
