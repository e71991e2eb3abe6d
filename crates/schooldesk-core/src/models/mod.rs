//! Data models shared by the session core.
//!
//! - `UserProfile`: the authenticated user as reported by the profile endpoint
//! - `Role`: the coarse role that drives which console sections are visible

pub mod user;

pub use user::{Role, UserProfile};
