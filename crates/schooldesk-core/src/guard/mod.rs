//! Access control for console views.
//!
//! This module provides:
//! - `RouteTable`: which views need a session, and which roles may see them
//! - `RouteGuard`: decides render / wait / redirect for a requested location
//! - `Navigator`: the location surface redirects are expressed against

pub mod navigator;
pub mod routes;

use serde::Serialize;
use tokio::sync::watch;

pub use navigator::{
    is_login_location, redirect_to_login, MemoryNavigator, Navigator, DEFAULT_LANDING_PATH,
    LOGIN_PATH,
};
pub use routes::{RouteRule, RouteTable};

use crate::auth::{SessionManager, SessionState};
use crate::models::UserProfile;

/// What to do with a request for a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum GuardDecision {
    /// The session has not resolved; show a neutral loading indication only.
    Loading,
    Render,
    /// Not logged in. `from` is where to return after login.
    RedirectToLogin { from: String },
    /// Logged in, but the role may not see this view.
    RedirectToLanding { to: String },
    /// Logged in, but the role may not even see the landing view.
    Forbidden,
}

/// Where to navigate after a successful login: back to `from`, unless it is
/// missing or the login view itself.
pub fn post_login_target(from: Option<&str>, login_path: &str, landing_path: &str) -> String {
    match from {
        Some(from) if !from.is_empty() && !is_login_location(from, login_path) => from.to_string(),
        _ => landing_path.to_string(),
    }
}

pub struct RouteGuard {
    session: SessionManager,
    routes: RouteTable,
    login_path: String,
    landing_path: String,
}

impl RouteGuard {
    pub fn new(session: SessionManager, routes: RouteTable) -> Self {
        Self {
            session,
            routes,
            login_path: LOGIN_PATH.to_string(),
            landing_path: DEFAULT_LANDING_PATH.to_string(),
        }
    }

    pub fn with_paths(mut self, login_path: impl Into<String>, landing_path: impl Into<String>) -> Self {
        self.login_path = login_path.into();
        self.landing_path = landing_path.into();
        self
    }

    /// Decide for `location` given the session as it is right now.
    pub fn check(&self, location: &str) -> GuardDecision {
        decide(
            &self.routes,
            self.session.state(),
            self.session.user().as_ref(),
            location,
            &self.login_path,
            &self.landing_path,
        )
    }

    /// [`post_login_target`] with this guard's login and landing views.
    pub fn post_login_target(&self, from: Option<&str>) -> String {
        post_login_target(from, &self.login_path, &self.landing_path)
    }

    /// Wait until the session has resolved, then decide.
    pub async fn resolve(&self, location: &str) -> GuardDecision {
        let mut states: watch::Receiver<SessionState> = self.session.subscribe();
        loop {
            let decision = self.check(location);
            if decision != GuardDecision::Loading {
                return decision;
            }
            if states.changed().await.is_err() {
                return self.check(location);
            }
        }
    }

    /// Section names of the console the current user may see.
    pub fn visible_sections(&self) -> Vec<&str> {
        match self.session.user() {
            Some(user) if self.session.is_authenticated() => self.routes.visible_sections(&user),
            _ => Vec::new(),
        }
    }
}

/// The guard's decision as a pure function of its inputs.
pub fn decide(
    routes: &RouteTable,
    state: SessionState,
    user: Option<&UserProfile>,
    location: &str,
    login_path: &str,
    landing_path: &str,
) -> GuardDecision {
    if is_login_location(location, login_path) {
        return GuardDecision::Render;
    }
    let Some(rule) = routes.rule_for(location) else {
        return GuardDecision::Render;
    };
    if state.is_pending() {
        return GuardDecision::Loading;
    }

    let user = match state {
        SessionState::Anonymous => None,
        // The session still holds its user while the token is swapped
        SessionState::Refreshing if user.is_none() => return GuardDecision::Loading,
        _ => user,
    };

    let Some(user) = user else {
        return GuardDecision::RedirectToLogin {
            from: location.to_string(),
        };
    };

    if rule.allows(user.role) {
        return GuardDecision::Render;
    }

    let at_landing = navigator::location_path(location).trim_end_matches('/')
        == landing_path.trim_end_matches('/');
    let landing_allowed = routes
        .rule_for(landing_path)
        .map(|landing| landing.allows(user.role))
        .unwrap_or(true);

    if at_landing || !landing_allowed {
        GuardDecision::Forbidden
    } else {
        GuardDecision::RedirectToLanding {
            to: landing_path.to_string(),
        }
    }
}
