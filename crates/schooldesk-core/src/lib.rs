//! Core library for schooldesk.
//!
//! Session management, credential storage, the authenticated API client and
//! role-based route guarding for the school administration console.

pub mod api;
pub mod auth;
pub mod config;
pub mod guard;
pub mod models;

pub use api::{ApiClient, ApiError, AuthApi};
pub use auth::{AuthError, CredentialStore, SessionManager, SessionState};
pub use config::Config;
pub use guard::{GuardDecision, RouteGuard, RouteTable};
pub use models::{Role, UserProfile};
