//! REST API client module for the school backend.
//!
//! `AuthApi` speaks the raw authentication endpoints. `ApiClient` is what
//! everything else uses: it attaches the bearer token and handles expired
//! tokens transparently.

pub mod auth;
pub mod client;
pub mod envelope;
pub mod error;

pub use auth::{AuthApi, LoginResponse, RefreshResponse};
pub use client::{ApiClient, ApiRequest};
pub use envelope::{extract_page, Page};
pub use error::ApiError;
