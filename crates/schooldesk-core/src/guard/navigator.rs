//! The location surface redirects are expressed against.

use parking_lot::Mutex;
use tracing::debug;

/// Path of the login view.
pub const LOGIN_PATH: &str = "/login";

/// Where users land after login when they did not ask for anything else.
pub const DEFAULT_LANDING_PATH: &str = "/dashboard";

/// Something that knows the current location and can replace it.
pub trait Navigator: Send + Sync {
    fn current_location(&self) -> String;

    /// Replace the current location, without adding a history entry.
    fn replace(&self, location: &str);
}

/// The path part of a location, without query or fragment.
pub fn location_path(location: &str) -> &str {
    let end = location.find(['?', '#']).unwrap_or(location.len());
    &location[..end]
}

/// True if `location` is the login view (or below it).
pub fn is_login_location(location: &str, login_path: &str) -> bool {
    let path = location_path(location).trim_end_matches('/');
    let login = login_path.trim_end_matches('/');
    path == login
        || path
            .strip_prefix(login)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
}

/// Send the user to the login view unless they are already there.
///
/// Returns whether a redirect was issued.
pub fn redirect_to_login(navigator: &dyn Navigator, login_path: &str) -> bool {
    let current = navigator.current_location();
    if is_login_location(&current, login_path) {
        debug!(location = %current, "Already on the login view, not redirecting");
        return false;
    }
    debug!(from = %current, "Redirecting to login");
    navigator.replace(login_path);
    true
}

/// In-process navigator keeping the current location and every replacement.
pub struct MemoryNavigator {
    state: Mutex<NavigatorState>,
}

struct NavigatorState {
    current: String,
    redirects: Vec<String>,
}

impl MemoryNavigator {
    pub fn new(start: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(NavigatorState {
                current: start.into(),
                redirects: Vec::new(),
            }),
        }
    }

    /// Every location passed to `replace`, oldest first.
    pub fn redirects(&self) -> Vec<String> {
        self.state.lock().redirects.clone()
    }
}

impl Navigator for MemoryNavigator {
    fn current_location(&self) -> String {
        self.state.lock().current.clone()
    }

    fn replace(&self, location: &str) {
        let mut state = self.state.lock();
        state.current = location.to_string();
        state.redirects.push(location.to_string());
    }
}
