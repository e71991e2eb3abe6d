//! API client for the school backend.
//!
//! Every backend call goes through [`ApiClient::execute`], which attaches
//! the stored bearer token and recovers from a 401 with exactly one
//! refresh-and-retry before giving up on the session.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::envelope::{extract_page, Page};
use super::{ApiError, AuthApi};
use crate::auth::{CredentialStore, SessionManager};
use crate::config::{endpoint_url, Endpoints};
use crate::guard::{redirect_to_login, Navigator, LOGIN_PATH};

/// A request as the client will (re)send it.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Set once the request has been resubmitted after a refresh; a 401 on
    /// a retry is final.
    pub is_retry: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            is_retry: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Serialize)]
struct ChangePasswordRequest<'a> {
    current_password: &'a str,
    new_password: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(alias = "mensaje")]
    message: Option<String>,
}

/// API client for the school backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    endpoints: Endpoints,
    session: SessionManager,
    navigator: Option<Arc<dyn Navigator>>,
    login_path: String,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(
        base_url: Url,
        endpoints: Endpoints,
        timeout: Duration,
        session: SessionManager,
    ) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            endpoints,
            session,
            navigator: None,
            login_path: LOGIN_PATH.to_string(),
        })
    }

    /// Redirect through `navigator` when the session is lost.
    pub fn with_navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub fn with_login_path(mut self, login_path: impl Into<String>) -> Self {
        self.login_path = login_path.into();
        self
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    fn store(&self) -> &Arc<dyn CredentialStore> {
        self.session.store()
    }

    /// Send one request, with or without a bearer token.
    async fn dispatch(&self, request: &ApiRequest, token: Option<&str>) -> Result<Response, ApiError> {
        let url = endpoint_url(&self.base_url, &request.path)?;
        let mut builder = self.client.request(request.method.clone(), url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder.send().await?)
    }

    /// Send a request through the auth interceptor.
    ///
    /// Returns the response for any status but 401, including error
    /// statuses. Transport errors are returned untouched. A 401 is
    /// recovered from at most once; when recovery is impossible the session
    /// is ended, the user is sent to the login view and
    /// [`ApiError::Unauthorized`] is returned.
    pub async fn execute(&self, mut request: ApiRequest) -> Result<Response, ApiError> {
        loop {
            let sent_with = self.store().load_access_token();
            let response = self.dispatch(&request, sent_with.as_deref()).await?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            debug!(path = %request.path, retry = request.is_retry, "Request unauthorized");
            if !self.recover(&request, sent_with.as_deref()).await {
                self.fail_session();
                return Err(ApiError::Unauthorized);
            }
            request.is_retry = true;
        }
    }

    /// Try to obtain a usable token after a 401. Returns whether the
    /// request should be resubmitted.
    async fn recover(&self, request: &ApiRequest, sent_with: Option<&str>) -> bool {
        if request.is_retry {
            warn!(path = %request.path, "Retried request rejected again");
            return false;
        }
        if self.store().load_refresh_token().is_none() {
            info!(path = %request.path, "No refresh token available");
            return false;
        }

        // Someone else refreshed while this request was in flight
        let current = self.store().load_access_token();
        if current.is_some() && current.as_deref() != sent_with {
            debug!(path = %request.path, "Token already refreshed, retrying");
            return true;
        }

        match self.session.refresh_token().await {
            Ok(_) => true,
            Err(e) => {
                warn!(path = %request.path, error = %e, "Token refresh failed");
                false
            }
        }
    }

    fn fail_session(&self) {
        self.session.end_session();
        if let Some(ref navigator) = self.navigator {
            redirect_to_login(navigator.as_ref(), &self.login_path);
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let path = request.path.clone();
        let response = AuthApi::check_response(self.execute(request).await?).await?;
        let text = response.text().await?;
        // DELETE and some updates answer with an empty body
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response from {}: {}", path, e)))
    }

    // ===== Typed helpers =====

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(ApiRequest::get(path)).await
    }

    pub async fn get_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let request = query
            .iter()
            .fold(ApiRequest::get(path), |request, (k, v)| request.with_query(*k, *v));
        self.send_json(request).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode request body: {}", e)))?;
        self.send_json(ApiRequest::post(path, body)).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode request body: {}", e)))?;
        self.send_json(ApiRequest::new(Method::PUT, path).with_body(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ApiError> {
        self.send_json(ApiRequest::new(Method::DELETE, path)).await
    }

    /// Fetch a list endpoint, wherever in the response the list lives.
    ///
    /// `keys` are resource-specific wrapper names to try, e.g.
    /// `&["alumnos", "estudiantes"]`.
    pub async fn get_list<T: DeserializeOwned>(&self, path: &str, keys: &[&str]) -> Result<Page<T>, ApiError> {
        let value: Value = self.get(path).await?;
        extract_page(&value, keys)
            .map_err(|e| ApiError::InvalidResponse(format!("Unexpected list item in {}: {}", path, e)))
    }

    /// Change the logged-in user's password. Returns the server's message.
    pub async fn change_password(&self, current: &str, new: &str) -> Result<String, ApiError> {
        let path = self.endpoints.change_password.clone();
        let response: MessageResponse = self
            .post(
                &path,
                &ChangePasswordRequest {
                    current_password: current,
                    new_password: new,
                },
            )
            .await?;
        Ok(response
            .message
            .unwrap_or_else(|| "Password updated".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MemoryStore, SessionState};
    use crate::guard::MemoryNavigator;
    use crate::models::{Role, UserProfile};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        client: ApiClient,
        store: Arc<MemoryStore>,
        navigator: Arc<MemoryNavigator>,
    }

    fn harness(server: &MockServer, location: &str) -> Harness {
        harness_at(Url::parse(&server.uri()).unwrap(), location)
    }

    fn harness_at(base: Url, location: &str) -> Harness {
        let timeout = Duration::from_secs(5);
        let store = Arc::new(MemoryStore::new());
        let auth = AuthApi::new(base.clone(), Endpoints::default(), timeout).unwrap();
        let session = SessionManager::new(auth, store.clone());
        let navigator = Arc::new(MemoryNavigator::new(location));
        let client = ApiClient::new(base, Endpoints::default(), timeout, session)
            .unwrap()
            .with_navigator(navigator.clone());
        Harness {
            client,
            store,
            navigator,
        }
    }

    fn seed(store: &MemoryStore, access: &str, refresh: Option<&str>) {
        let user = UserProfile::new("7", "Marta Rojas", Role::Contador);
        store.save(access, refresh, &user).unwrap();
    }

    async fn mount_resource(server: &MockServer, token: &str, status: u16) {
        let template = if status == 200 {
            ResponseTemplate::new(200).set_body_json(json!({"alumnos": [{"id": 1}], "total": 1}))
        } else {
            ResponseTemplate::new(status).set_body_json(json!({"error": "Token inválido"}))
        };
        Mock::given(method("GET"))
            .and(path("/estudiantes/"))
            .and(header("authorization", format!("Bearer {}", token).as_str()))
            .respond_with(template)
            .mount(server)
            .await;
    }

    async fn mount_profile(server: &MockServer, token: &str) {
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .and(header("authorization", format!("Bearer {}", token).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user": {"id": 7, "fullname": "Marta Rojas", "privileges": "FINANZAS"}
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_attaches_bearer_token() {
        let server = MockServer::start().await;
        mount_resource(&server, "access-1", 200).await;
        let h = harness(&server, "/estudiantes");
        seed(&h.store, "access-1", Some("refresh-1"));

        let value: Value = h.client.get("/estudiantes/").await.unwrap();
        assert_eq!(value["total"], 1);
    }

    #[tokio::test]
    async fn test_unauthenticated_request_has_no_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .mount(&server)
            .await;
        let h = harness(&server, "/login");

        let value: Value = h.client.get("/ping").await.unwrap();
        assert_eq!(value["status"], "ok");
        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_non_401_errors_pass_through() {
        let server = MockServer::start().await;
        mount_resource(&server, "access-1", 403).await;
        let h = harness(&server, "/estudiantes");
        seed(&h.store, "access-1", Some("refresh-1"));

        let err = h.client.get::<Value>("/estudiantes/").await.unwrap_err();
        assert!(matches!(err, ApiError::AccessDenied(_)));
        assert_eq!(h.store.load_access_token().as_deref(), Some("access-1"));
        assert!(h.navigator.redirects().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_and_retry_once() {
        let server = MockServer::start().await;
        mount_resource(&server, "stale", 401).await;
        mount_resource(&server, "fresh", 200).await;
        mount_profile(&server, "fresh").await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .and(body_json(json!({"refresh_token": "refresh-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "fresh"})))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, "/estudiantes");
        seed(&h.store, "stale", Some("refresh-1"));

        let page = h.client.get_list::<Value>("/estudiantes/", &["alumnos"]).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(h.store.load_access_token().as_deref(), Some("fresh"));
        assert_eq!(h.client.session().state(), SessionState::Authenticated);
        assert!(h.navigator.redirects().is_empty());
    }

    #[tokio::test]
    async fn test_retry_result_is_returned_whatever_it_is() {
        let server = MockServer::start().await;
        mount_resource(&server, "stale", 401).await;
        mount_resource(&server, "fresh", 500).await;
        mount_profile(&server, "fresh").await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "fresh"})))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, "/estudiantes");
        seed(&h.store, "stale", Some("refresh-1"));

        let response = h.client.execute(ApiRequest::get("/estudiantes/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_retry_rejected_again_is_not_retried() {
        let server = MockServer::start().await;
        mount_resource(&server, "stale", 401).await;
        mount_resource(&server, "fresh", 401).await;
        mount_profile(&server, "fresh").await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "fresh"})))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, "/estudiantes");
        seed(&h.store, "stale", Some("refresh-1"));

        let err = h.client.execute(ApiRequest::get("/estudiantes/")).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));

        let resource_hits = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/estudiantes/")
            .count();
        assert_eq!(resource_hits, 2);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_rejected_clears_and_redirects() {
        let server = MockServer::start().await;
        mount_resource(&server, "stale", 401).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "Token expirado"})))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, "/finanzas/gastos");
        seed(&h.store, "stale", Some("refresh-1"));

        let err = h.client.get::<Value>("/estudiantes/").await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
        assert!(h.store.is_empty());
        assert_eq!(h.client.session().state(), SessionState::Anonymous);
        assert_eq!(h.navigator.redirects(), vec!["/login".to_string()]);
    }

    #[tokio::test]
    async fn test_no_refresh_token_is_terminal() {
        let server = MockServer::start().await;
        mount_resource(&server, "stale", 401).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let h = harness(&server, "/estudiantes");
        seed(&h.store, "stale", None);

        let err = h.client.get::<Value>("/estudiantes/").await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_no_redirect_loop_on_login_view() {
        let server = MockServer::start().await;
        mount_resource(&server, "stale", 401).await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let h = harness(&server, "/login");
        seed(&h.store, "stale", Some("refresh-1"));

        assert!(h.client.get::<Value>("/estudiantes/").await.is_err());
        assert!(h.navigator.redirects().is_empty());
    }

    #[tokio::test]
    async fn test_redirects_to_configured_login_view() {
        let server = MockServer::start().await;
        mount_resource(&server, "stale", 401).await;

        let h = harness(&server, "/finanzas");
        let client = h.client.clone().with_login_path("/entrar");
        seed(&h.store, "stale", None);

        assert!(client.get::<Value>("/estudiantes/").await.is_err());
        assert_eq!(h.navigator.redirects(), vec!["/entrar".to_string()]);

        // Already there: no second redirect
        seed(&h.store, "stale", None);
        assert!(client.get::<Value>("/estudiantes/").await.is_err());
        assert_eq!(h.navigator.redirects().len(), 1);
    }

    #[tokio::test]
    async fn test_network_error_does_not_touch_session() {
        // Nothing listens on a port we just released
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let h = harness_at(Url::parse(&format!("http://{}", addr)).unwrap(), "/estudiantes");
        seed(&h.store, "access-1", Some("refresh-1"));

        let err = h.client.get::<Value>("/estudiantes/").await.unwrap_err();
        assert!(err.is_network());
        assert_eq!(h.store.load_access_token().as_deref(), Some("access-1"));
        assert!(h.navigator.redirects().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let server = MockServer::start().await;
        mount_resource(&server, "stale", 401).await;
        mount_resource(&server, "fresh", 200).await;
        mount_profile(&server, "fresh").await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "fresh"}))
                    .set_delay(Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, "/estudiantes");
        seed(&h.store, "stale", Some("refresh-1"));

        let requests = (0..8).map(|_| h.client.get::<Value>("/estudiantes/"));
        let results = futures::future::join_all(requests).await;
        for result in results {
            assert_eq!(result.unwrap()["total"], 1);
        }

        let retried_with: Vec<_> = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.url.path() == "/estudiantes/")
            .filter_map(|r| {
                r.headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .filter(|auth| auth != "Bearer stale")
            .collect();
        assert_eq!(retried_with.len(), 8);
        assert!(retried_with.iter().all(|auth| auth == "Bearer fresh"));
    }

    #[tokio::test]
    async fn test_change_password() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/change-password"))
            .and(header("authorization", "Bearer access-1"))
            .and(body_json(json!({"current_password": "vieja", "new_password": "nueva"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"mensaje": "Contraseña actualizada con éxito"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, "/perfil");
        seed(&h.store, "access-1", Some("refresh-1"));

        let message = h.client.change_password("vieja", "nueva").await.unwrap();
        assert_eq!(message, "Contraseña actualizada con éxito");
    }

    #[tokio::test]
    async fn test_put_and_empty_delete() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/gastos/4"))
            .and(body_json(json!({"monto": 120})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 4, "monto": 120})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/gastos/4"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let h = harness(&server, "/finanzas/gastos");
        seed(&h.store, "access-1", Some("refresh-1"));

        let updated: Value = h.client.put("/gastos/4", &json!({"monto": 120})).await.unwrap();
        assert_eq!(updated["monto"], 120);
        assert_eq!(h.client.delete("/gastos/4").await.unwrap(), Value::Null);
    }
}
