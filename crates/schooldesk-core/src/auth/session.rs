//! Session lifecycle: login, logout, startup restore, token refresh and
//! proactive refresh scheduling.
//!
//! `SessionManager` is the only thing that mutates the session or writes the
//! credential store. It is cheap to clone; clones share one session.

use std::sync::{Arc, Weak};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::credentials::CredentialStore;
use super::error::{AuthError, RefreshError};
use super::token::RefreshPlan;
use crate::api::{ApiError, AuthApi};
use crate::models::UserProfile;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum SessionState {
    /// Startup restore has not resolved yet.
    Initializing,
    Anonymous,
    Authenticating,
    Authenticated,
    Refreshing,
}

impl SessionState {
    /// True while nobody can yet say whether the user is logged in.
    pub fn is_pending(&self) -> bool {
        matches!(self, SessionState::Initializing | SessionState::Authenticating)
    }
}

/// The session value itself. Read-only outside this module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionData {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<UserProfile>,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<String, RefreshError>>>;

struct RefreshTimer {
    ticket: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    api: AuthApi,
    store: Arc<dyn CredentialStore>,
    session: Mutex<SessionData>,
    state: watch::Sender<SessionState>,
    /// The one refresh allowed in flight, tagged with the session
    /// generation it started in; later callers await it.
    pending_refresh: Mutex<Option<(u64, SharedRefresh)>>,
    timer: Mutex<Option<RefreshTimer>>,
    /// Bumped whenever the session is replaced or ended, so a refresh that
    /// started against an older session cannot resurrect it.
    generation: Mutex<u64>,
    next_ticket: Mutex<u64>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(api: AuthApi, store: Arc<dyn CredentialStore>) -> Self {
        let (state, _) = watch::channel(SessionState::Initializing);
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                session: Mutex::new(SessionData::default()),
                state,
                pending_refresh: Mutex::new(None),
                timer: Mutex::new(None),
                generation: Mutex::new(0),
                next_ticket: Mutex::new(0),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Authenticated | SessionState::Refreshing
        ) && self.inner.session.lock().user.is_some()
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.inner.session.lock().user.clone()
    }

    pub fn session(&self) -> SessionData {
        self.inner.session.lock().clone()
    }

    pub(crate) fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }

    /// True if a proactive refresh is currently scheduled.
    pub fn has_scheduled_refresh(&self) -> bool {
        self.inner
            .timer
            .lock()
            .as_ref()
            .map(|timer| !timer.handle.is_finished())
            .unwrap_or(false)
    }

    fn replace_session(&self, data: SessionData) {
        *self.inner.session.lock() = data;
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "Session state changed");
        }
    }

    fn generation(&self) -> u64 {
        *self.inner.generation.lock()
    }

    fn bump_generation(&self) -> u64 {
        let mut generation = self.inner.generation.lock();
        *generation += 1;
        *generation
    }

    // ===== Login / logout =====

    /// Log in with a username and password.
    ///
    /// On failure the session is anonymous and the error carries the
    /// server's message (or a generic one).
    pub async fn login(&self, username: &str, password: &str) -> Result<UserProfile, AuthError> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        self.cancel_timer();
        self.bump_generation();
        self.set_state(SessionState::Authenticating);
        info!(username, "Logging in");

        match self.establish(username, password).await {
            Ok(user) => {
                info!(user_id = %user.id, role = %user.role, "Login succeeded");
                Ok(user)
            }
            Err(e) => {
                warn!(username, error = %e, "Login failed");
                // A previous user's tokens must not outlive a failed login
                self.inner.store.clear();
                self.replace_session(SessionData::default());
                self.set_state(SessionState::Anonymous);
                Err(e)
            }
        }
    }

    async fn establish(&self, username: &str, password: &str) -> Result<UserProfile, AuthError> {
        let login = self.inner.api.login(username, password).await?;

        let user = match login.user {
            Some(user) => user,
            None => self.inner.api.profile(&login.access_token).await?,
        };

        self.inner
            .store
            .save(&login.access_token, login.refresh_token.as_deref(), &user)?;

        self.replace_session(SessionData {
            access_token: Some(login.access_token.clone()),
            refresh_token: login.refresh_token,
            user: Some(user.clone()),
        });
        self.set_state(SessionState::Authenticated);
        self.schedule_refresh(&login.access_token, true);

        Ok(user)
    }

    /// End the session locally. Always succeeds, and is a no-op when
    /// already anonymous apart from clearing the store again.
    pub fn logout(&self) {
        info!("Logging out");
        self.end_session();
    }

    /// Drop the session after an irrecoverable auth failure.
    pub fn end_session(&self) {
        self.cancel_timer();
        self.bump_generation();
        self.inner.store.clear();
        self.replace_session(SessionData::default());
        self.set_state(SessionState::Anonymous);
    }

    // ===== Startup =====

    /// Restore a persisted session and validate it against the backend.
    ///
    /// Returns the state once validation has resolved.
    pub async fn restore(&self) -> SessionState {
        if self.begin_restore() {
            self.validate().await
        } else {
            self.state()
        }
    }

    /// Like [`restore`](Self::restore), but validation runs in the
    /// background. A stored token with a cached profile is treated as
    /// authenticated immediately.
    pub fn restore_in_background(&self) -> JoinHandle<SessionState> {
        let needs_validation = self.begin_restore();
        let manager = self.clone();
        tokio::spawn(async move {
            if needs_validation {
                manager.validate().await
            } else {
                manager.state()
            }
        })
    }

    /// Load what the store has. Returns whether a backend check is needed.
    fn begin_restore(&self) -> bool {
        let store = &self.inner.store;
        let Some(access_token) = store.load_access_token() else {
            debug!("No stored session");
            store.clear();
            self.set_state(SessionState::Anonymous);
            return false;
        };

        let user = store.load_user();
        let optimistic = user.is_some();
        self.replace_session(SessionData {
            access_token: Some(access_token.clone()),
            refresh_token: store.load_refresh_token(),
            user,
        });

        if optimistic {
            debug!("Restored cached session, validating in the background");
            self.set_state(SessionState::Authenticated);
            self.schedule_refresh(&access_token, true);
        } else {
            debug!("Stored token without a cached profile, fetching it");
            self.set_state(SessionState::Initializing);
        }
        true
    }

    async fn validate(&self) -> SessionState {
        let generation = self.generation();
        let Some(access_token) = self.session().access_token else {
            return self.state();
        };

        match self.inner.api.profile(&access_token).await {
            Ok(user) => {
                if self.generation() != generation {
                    return self.state();
                }
                self.adopt_profile(&access_token, user);
                self.set_state(SessionState::Authenticated);
                info!("Stored session is valid");
            }
            Err(ApiError::NetworkError(e)) => {
                // Offline is not an auth failure: keep what we have
                warn!(error = %e, "Could not reach backend to validate session");
                if self.user().is_some() {
                    self.set_state(SessionState::Authenticated);
                } else {
                    self.replace_session(SessionData::default());
                    self.set_state(SessionState::Anonymous);
                }
            }
            Err(e) => {
                info!(error = %e, "Stored session rejected, attempting refresh");
                if let Err(e) = self.refresh_token().await {
                    info!(error = %e, "Could not recover stored session");
                }
            }
        }
        self.state()
    }

    /// Cache `user` as the profile belonging to `access_token`.
    ///
    /// Both tokens are taken from the store so the durable entries always
    /// move together; the in-memory user only changes if the session holds
    /// that same token.
    fn adopt_profile(&self, access_token: &str, user: UserProfile) {
        {
            let mut session = self.inner.session.lock();
            if session.access_token.as_deref() == Some(access_token) {
                session.user = Some(user.clone());
            }
        }
        let refresh_token = self.inner.store.load_refresh_token();
        if let Err(e) = self
            .inner
            .store
            .save(access_token, refresh_token.as_deref(), &user)
        {
            warn!(error = %e, "Failed to cache user profile");
        }
    }

    /// Re-fetch the profile for the current token.
    pub async fn refresh_profile(&self) -> bool {
        let Some(access_token) = self.inner.store.load_access_token() else {
            return false;
        };
        match self.inner.api.profile(&access_token).await {
            Ok(user) => {
                self.adopt_profile(&access_token, user);
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to refresh user profile");
                false
            }
        }
    }

    // ===== Refresh =====

    /// Exchange the refresh token for a new access token.
    ///
    /// At most one refresh runs at a time: callers arriving while one is in
    /// flight get its result instead of starting another. Any failure ends
    /// the session.
    pub async fn refresh_token(&self) -> Result<String, RefreshError> {
        let generation = self.generation();
        let refresh = {
            let mut pending = self.inner.pending_refresh.lock();
            match pending.as_ref() {
                Some((started_in, inflight)) if *started_in == generation => {
                    debug!("Joining in-flight token refresh");
                    inflight.clone()
                }
                _ => {
                    let manager = self.clone();
                    let refresh = async move {
                        let result = manager.perform_refresh().await;
                        let mut pending = manager.inner.pending_refresh.lock();
                        if pending.as_ref().map(|(started_in, _)| *started_in) == Some(generation) {
                            pending.take();
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    *pending = Some((generation, refresh.clone()));
                    refresh
                }
            }
        };
        refresh.await
    }

    async fn perform_refresh(&self) -> Result<String, RefreshError> {
        let generation = self.generation();
        let Some(refresh_token) = self.inner.store.load_refresh_token() else {
            info!("No refresh token, ending session");
            self.end_session();
            return Err(RefreshError::NoRefreshToken);
        };

        self.set_state(SessionState::Refreshing);
        info!("Refreshing access token");

        let refreshed = match self.inner.api.refresh(&refresh_token).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                warn!(error = %e, "Token refresh failed, ending session");
                if self.generation() == generation {
                    self.end_session();
                }
                return Err(match e {
                    ApiError::Unauthorized => RefreshError::Rejected,
                    other => RefreshError::Failed(other.to_string()),
                });
            }
        };

        let user = match self.inner.api.profile(&refreshed.access_token).await {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Profile re-fetch after refresh failed, keeping cached profile");
                self.user()
            }
        };

        if self.generation() != generation {
            debug!("Session changed during refresh, discarding result");
            return Err(RefreshError::Failed("session ended during refresh".into()));
        }

        let Some(user) = user else {
            self.end_session();
            return Err(RefreshError::Failed("no user profile available".into()));
        };

        let refresh_token = refreshed.refresh_token.unwrap_or(refresh_token);
        if let Err(e) = self
            .inner
            .store
            .save(&refreshed.access_token, Some(&refresh_token), &user)
        {
            warn!(error = %e, "Failed to persist refreshed token, ending session");
            self.end_session();
            return Err(RefreshError::Failed(e.to_string()));
        }

        self.replace_session(SessionData {
            access_token: Some(refreshed.access_token.clone()),
            refresh_token: Some(refresh_token),
            user: Some(user),
        });
        self.set_state(SessionState::Authenticated);
        self.schedule_refresh(&refreshed.access_token, false);
        info!("Access token refreshed");

        Ok(refreshed.access_token)
    }

    // ===== Proactive refresh =====

    /// Arm the one-shot refresh timer for `access_token`.
    ///
    /// `allow_immediate` is false right after a refresh: a backend issuing
    /// tokens shorter-lived than the threshold would otherwise loop.
    fn schedule_refresh(&self, access_token: &str, allow_immediate: bool) {
        let delay = match RefreshPlan::for_token(access_token, Utc::now()) {
            RefreshPlan::After(delay) => delay,
            RefreshPlan::Immediate if allow_immediate => {
                info!("Access token is about to expire, refreshing now");
                std::time::Duration::ZERO
            }
            RefreshPlan::Immediate => {
                warn!("Fresh token expires within the refresh threshold, not scheduling");
                self.cancel_timer();
                return;
            }
            RefreshPlan::Unscheduled => {
                debug!("Access token has no readable expiry, relying on 401 handling");
                self.cancel_timer();
                return;
            }
        };

        let ticket = {
            let mut next = self.inner.next_ticket.lock();
            *next += 1;
            *next
        };
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = SessionManager { inner };
            {
                // Detach ourselves so the reschedule after this refresh
                // does not abort the running task
                let mut timer = manager.inner.timer.lock();
                if timer.as_ref().map(|t| t.ticket) == Some(ticket) {
                    timer.take();
                } else {
                    return;
                }
            }
            debug!("Proactive refresh timer fired");
            if let Err(e) = manager.refresh_token().await {
                warn!(error = %e, "Proactive refresh failed");
            }
        });

        debug!(delay_secs = delay.as_secs(), "Scheduled proactive token refresh");
        if let Some(previous) = self.inner.timer.lock().replace(RefreshTimer { ticket, handle }) {
            previous.handle.abort();
        }
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.handle.abort();
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state())
            .field("user", &self.user().map(|u| u.id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::token::test_jwt;
    use crate::auth::MemoryStore;
    use crate::config::Endpoints;
    use crate::models::Role;
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager(server: &MockServer) -> (SessionManager, Arc<MemoryStore>) {
        let base = Url::parse(&server.uri()).unwrap();
        let api = AuthApi::new(base, Endpoints::default(), Duration::from_secs(5)).unwrap();
        let store = Arc::new(MemoryStore::new());
        (SessionManager::new(api, store.clone()), store)
    }

    fn user_json(id: i64) -> serde_json::Value {
        json!({"id": id, "username": "mrojas", "fullname": "Marta Rojas", "privileges": "FINANZAS"})
    }

    async fn mount_profile(server: &MockServer, token: &str, status: u16) {
        let response = if status == 200 {
            ResponseTemplate::new(200).set_body_json(json!({"user": user_json(7)}))
        } else {
            ResponseTemplate::new(status).set_body_json(json!({"error": "Token inválido"}))
        };
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .and(header("authorization", format!("Bearer {}", token).as_str()))
            .respond_with(response)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_login_transitions_and_persists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-1",
                "refresh_token": "refresh-1",
                "user": user_json(7)
            })))
            .mount(&server)
            .await;

        let (manager, store) = manager(&server);
        let mut states = manager.subscribe();
        assert_eq!(manager.state(), SessionState::Initializing);

        let login = manager.clone();
        let task = tokio::spawn(async move { login.login("mrojas", "secreto").await });

        let mut seen = Vec::new();
        while seen.last() != Some(&SessionState::Authenticated) {
            states.changed().await.unwrap();
            seen.push(*states.borrow_and_update());
        }
        let user = task.await.unwrap().unwrap();

        assert_eq!(seen.first(), Some(&SessionState::Authenticating));
        assert_eq!(user.role, Role::Contador);
        assert_eq!(store.load_access_token().as_deref(), Some("access-1"));
        assert_eq!(store.load_refresh_token().as_deref(), Some("refresh-1"));
        assert_eq!(store.load_user(), Some(user));
        assert!(manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_login_failure_stays_anonymous() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"error": "Credenciales inválidas"})),
            )
            .mount(&server)
            .await;

        let (manager, store) = manager(&server);
        let err = manager.login("mrojas", "mal").await.unwrap_err();

        assert_eq!(err.to_string(), "Credenciales inválidas");
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_login_requires_both_fields() {
        let server = MockServer::start().await;
        let (manager, _) = manager(&server);
        assert!(matches!(
            manager.login("", "x").await,
            Err(AuthError::MissingCredentials)
        ));
        assert!(matches!(
            manager.login("mrojas", "").await,
            Err(AuthError::MissingCredentials)
        ));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let server = MockServer::start().await;
        let (manager, store) = manager(&server);

        manager.logout();
        assert_eq!(manager.state(), SessionState::Anonymous);
        manager.logout();
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert!(store.is_empty());

        let user = UserProfile::new("1", "Laura", Role::Director);
        store.save("a", Some("r"), &user).unwrap();
        manager.logout();
        assert!(store.is_empty());
        assert_eq!(manager.session(), SessionData::default());
    }

    #[tokio::test]
    async fn test_restore_valid_session_without_refresh() {
        let server = MockServer::start().await;
        mount_profile(&server, "stored", 200).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (manager, store) = manager(&server);
        let cached = UserProfile::new("7", "Marta", Role::Contador);
        store.save("stored", Some("refresh-1"), &cached).unwrap();

        let validation = manager.restore_in_background();
        // Optimistic: authenticated before the backend answers
        assert_eq!(manager.state(), SessionState::Authenticated);

        assert_eq!(validation.await.unwrap(), SessionState::Authenticated);
        assert_eq!(manager.user().unwrap().display_name, "Marta Rojas");
    }

    #[tokio::test]
    async fn test_restore_rejected_token_refreshes_once() {
        let server = MockServer::start().await;
        mount_profile(&server, "stale", 401).await;
        mount_profile(&server, "fresh", 200).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "fresh"})))
            .expect(1)
            .mount(&server)
            .await;

        let (manager, store) = manager(&server);
        let cached = UserProfile::new("7", "Marta", Role::Contador);
        store.save("stale", Some("refresh-1"), &cached).unwrap();

        assert_eq!(manager.restore().await, SessionState::Authenticated);
        assert_eq!(store.load_access_token().as_deref(), Some("fresh"));
        assert_eq!(store.load_refresh_token().as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_restore_with_dead_refresh_token_clears() {
        let server = MockServer::start().await;
        mount_profile(&server, "stale", 401).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "Token expirado"})))
            .expect(1)
            .mount(&server)
            .await;

        let (manager, store) = manager(&server);
        let cached = UserProfile::new("7", "Marta", Role::Contador);
        store.save("stale", Some("refresh-1"), &cached).unwrap();

        assert_eq!(manager.restore().await, SessionState::Anonymous);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_restore_without_cached_profile_fetches_it() {
        let server = MockServer::start().await;
        mount_profile(&server, "stored", 200).await;

        let (manager, store) = manager(&server);
        store.save_access_token("stored").unwrap();

        let validation = manager.restore_in_background();
        assert_eq!(manager.state(), SessionState::Initializing);
        assert_eq!(validation.await.unwrap(), SessionState::Authenticated);
        assert_eq!(store.load_user().unwrap().id, "7");
    }

    #[tokio::test]
    async fn test_restore_with_empty_store_is_anonymous() {
        let server = MockServer::start().await;
        let (manager, _) = manager(&server);
        assert_eq!(manager.restore().await, SessionState::Anonymous);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_call() {
        let server = MockServer::start().await;
        mount_profile(&server, "fresh", 200).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "fresh"}))
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (manager, store) = manager(&server);
        let cached = UserProfile::new("7", "Marta", Role::Contador);
        store.save("stale", Some("refresh-1"), &cached).unwrap();

        let results = futures::future::join_all((0..5).map(|_| manager.refresh_token())).await;
        for result in results {
            assert_eq!(result.unwrap(), "fresh");
        }
        assert_eq!(manager.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_ends_session() {
        let server = MockServer::start().await;
        let (manager, store) = manager(&server);
        store.save_access_token("stale").unwrap();

        assert_eq!(manager.refresh_token().await, Err(RefreshError::NoRefreshToken));
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_login_schedules_refresh_for_jwt() {
        let server = MockServer::start().await;
        let token = test_jwt(Utc::now().timestamp() + 3600);
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": token,
                "refresh_token": "refresh-1",
                "user": user_json(7)
            })))
            .mount(&server)
            .await;

        let (manager, _) = manager(&server);
        manager.login("mrojas", "secreto").await.unwrap();
        assert!(manager.has_scheduled_refresh());

        manager.logout();
        assert!(!manager.has_scheduled_refresh());
    }

    #[tokio::test]
    async fn test_opaque_token_schedules_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "opaque",
                "refresh_token": "refresh-1",
                "user": user_json(7)
            })))
            .mount(&server)
            .await;

        let (manager, _) = manager(&server);
        manager.login("mrojas", "secreto").await.unwrap();
        assert!(!manager.has_scheduled_refresh());
    }

    #[tokio::test]
    async fn test_refresh_profile_updates_cache() {
        let server = MockServer::start().await;
        mount_profile(&server, "access-1", 200).await;

        let (manager, store) = manager(&server);
        assert!(!manager.refresh_profile().await);

        let stale = UserProfile::new("7", "M. Rojas", Role::Other);
        store.save("access-1", Some("refresh-1"), &stale).unwrap();
        assert!(manager.refresh_profile().await);

        let cached = store.load_user().unwrap();
        assert_eq!(cached.display_name, "Marta Rojas");
        assert_eq!(cached.role, Role::Contador);
        assert_eq!(store.load_refresh_token().as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_failed_login_clears_previous_user() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(body_partial_json(json!({"username": "mrojas"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-marta",
                "refresh_token": "refresh-marta",
                "user": user_json(7)
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(body_partial_json(json!({"username": "lperez"})))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"error": "Credenciales inválidas"})),
            )
            .mount(&server)
            .await;

        let (manager, store) = manager(&server);
        manager.login("mrojas", "secreto").await.unwrap();
        assert!(manager.login("lperez", "mal").await.is_err());

        assert_eq!(manager.state(), SessionState::Anonymous);
        assert!(store.is_empty());

        // Nothing left for the next start to bring back
        let base = Url::parse(&server.uri()).unwrap();
        let api = AuthApi::new(base, Endpoints::default(), Duration::from_secs(5)).unwrap();
        let next_start = SessionManager::new(api, store.clone());
        assert_eq!(next_start.restore().await, SessionState::Anonymous);
    }

    async fn refresh_calls(server: &MockServer) -> usize {
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/auth/refresh")
            .count()
    }

    #[tokio::test]
    async fn test_proactive_refresh_fires_threshold_before_expiry() {
        let server = MockServer::start().await;
        // Expires a little over three seconds past the threshold
        let expiring = test_jwt(Utc::now().timestamp() + 303);
        let renewed = test_jwt(Utc::now().timestamp() + 3600);
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": expiring,
                "refresh_token": "refresh-1",
                "user": user_json(7)
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": &renewed})))
            .mount(&server)
            .await;
        mount_profile(&server, &renewed, 200).await;

        let (manager, store) = manager(&server);
        manager.login("mrojas", "secreto").await.unwrap();
        assert!(manager.has_scheduled_refresh());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(refresh_calls(&server).await, 0);

        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(refresh_calls(&server).await, 1);
        assert_eq!(store.load_access_token(), Some(renewed));
        assert_eq!(manager.state(), SessionState::Authenticated);

        // Rescheduled for the new token, far in the future
        assert!(manager.has_scheduled_refresh());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(refresh_calls(&server).await, 1);
    }
}
