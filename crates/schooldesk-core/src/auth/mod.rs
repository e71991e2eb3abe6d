//! Authentication: credential persistence, token inspection and the
//! session lifecycle.
//!
//! This module provides:
//! - `CredentialStore`: where tokens and the cached profile live between runs
//! - `SessionManager`: login, logout, startup restore and token refresh
//!
//! Access tokens are refreshed shortly before they expire, and on demand
//! when the backend rejects one.

pub mod credentials;
pub mod error;
pub mod session;
pub mod token;

pub use credentials::{CredentialStore, FileStore, KeyringStore, MemoryStore, StoreError};
pub use error::{AuthError, RefreshError, GENERIC_LOGIN_ERROR};
pub use session::{SessionData, SessionManager, SessionState};
