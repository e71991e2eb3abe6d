use std::collections::HashSet;

use super::navigator::{location_path, LOGIN_PATH};
use crate::models::{Role, UserProfile};

/// A protected view prefix and who may see it.
#[derive(Debug, Clone)]
pub struct RouteRule {
    prefix: String,
    /// Navigation section label, if this prefix is a top-level section.
    section: Option<String>,
    /// `None` means any logged-in user.
    allowed_roles: Option<HashSet<Role>>,
}

impl RouteRule {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn section(&self) -> Option<&str> {
        self.section.as_deref()
    }

    /// Admins are always allowed.
    pub fn allows(&self, role: Role) -> bool {
        role == Role::Admin
            || self
                .allowed_roles
                .as_ref()
                .map(|roles| roles.contains(&role))
                .unwrap_or(true)
    }
}

/// Protected and public view prefixes. Longest matching prefix wins;
/// locations matching nothing are not guarded.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
    public: Vec<String>,
}

fn normalize(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Segment-aware prefix match: `/finanzas` covers `/finanzas/gastos` but
/// not `/finanzas-old`.
fn covers(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The administrative console's views.
    pub fn console() -> Self {
        Self::new()
            .public(LOGIN_PATH)
            .protect("/")
            .section("/dashboard", "Dashboard", None)
            .section(
                "/estudiantes",
                "Estudiantes",
                Some(vec![Role::Director, Role::Instructor]),
            )
            .section(
                "/finanzas",
                "Finanzas",
                Some(vec![Role::Director, Role::Contador]),
            )
            .section("/administracion", "Administración", Some(vec![Role::Director]))
    }

    pub fn public(mut self, prefix: &str) -> Self {
        self.public.push(normalize(prefix));
        self
    }

    /// Require a session for `prefix`, any role.
    pub fn protect(self, prefix: &str) -> Self {
        self.push(prefix, None, None)
    }

    /// Require a session and one of `roles` for `prefix`.
    pub fn protect_for(self, prefix: &str, roles: impl IntoIterator<Item = Role>) -> Self {
        self.push(prefix, None, Some(roles.into_iter().collect()))
    }

    /// A protected top-level navigation section.
    pub fn section(self, prefix: &str, label: &str, roles: Option<Vec<Role>>) -> Self {
        self.push(
            prefix,
            Some(label.to_string()),
            roles.map(|roles| roles.into_iter().collect()),
        )
    }

    fn push(mut self, prefix: &str, section: Option<String>, allowed_roles: Option<HashSet<Role>>) -> Self {
        self.rules.push(RouteRule {
            prefix: normalize(prefix),
            section,
            allowed_roles,
        });
        self
    }

    pub fn is_public(&self, location: &str) -> bool {
        let path = location_path(location);
        self.public.iter().any(|prefix| covers(prefix, path))
    }

    /// The rule guarding `location`, or `None` if it is not guarded.
    pub fn rule_for(&self, location: &str) -> Option<&RouteRule> {
        if self.is_public(location) {
            return None;
        }
        let path = location_path(location);
        self.rules
            .iter()
            .filter(|rule| covers(&rule.prefix, path))
            .max_by_key(|rule| rule.prefix.len())
    }

    /// Labels of the sections `user` may see, in declaration order.
    pub fn visible_sections(&self, user: &UserProfile) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|rule| rule.allows(user.role))
            .filter_map(RouteRule::section)
            .collect()
    }
}
