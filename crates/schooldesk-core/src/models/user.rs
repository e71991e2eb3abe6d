//! The authenticated user and their role.
//!
//! The backend has reported profiles in a few shapes over time
//! (`fullname` vs `display_name`, `privileges` vs `role`, numeric vs string
//! ids), so deserialization goes through a lenient wire struct.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Coarse role of a console user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum Role {
    Admin,
    Director,
    Contador,
    Instructor,
    Other,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Director => "director",
            Role::Contador => "contador",
            Role::Instructor => "instructor",
            Role::Other => "other",
        }
    }

    /// Parse a role name, accepting both the console's names and the
    /// backend's privilege names. Unknown names map to `Other`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "admin" | "administrador" | "administrator" => Role::Admin,
            "director" | "secretaria" => Role::Director,
            "contador" | "finanzas" => Role::Contador,
            "instructor" | "profesor" => Role::Instructor,
            _ => Role::Other,
        }
    }
}

impl FromStr for Role {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Role::parse(s))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Role::parse(&raw))
    }
}

/// A user profile as cached alongside the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireProfile")]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
            username: None,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireId {
    Number(i64),
    Text(String),
}

#[derive(Deserialize)]
struct WireProfile {
    id: Option<WireId>,
    #[serde(alias = "displayName", alias = "fullname", alias = "full_name")]
    display_name: Option<String>,
    username: Option<String>,
    #[serde(alias = "privileges")]
    role: Option<Role>,
}

impl TryFrom<WireProfile> for UserProfile {
    type Error = String;

    fn try_from(wire: WireProfile) -> Result<Self, Self::Error> {
        let id = match wire.id {
            Some(WireId::Number(n)) => n.to_string(),
            Some(WireId::Text(s)) => s,
            None => return Err("user profile is missing an id".to_string()),
        };

        let display_name = wire
            .display_name
            .filter(|name| !name.trim().is_empty())
            .or_else(|| wire.username.clone())
            .unwrap_or_else(|| id.clone());

        Ok(Self {
            id,
            display_name,
            role: wire.role.unwrap_or(Role::Other),
            username: wire.username,
        })
    }
}
