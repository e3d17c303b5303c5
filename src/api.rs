//! Authenticated access to the game server status API.
//!
//! [`ApiClient::call`] composes three layers in a fixed order: the retry loop
//! wraps the login step, which wraps a single [`StatusApi::request`].

use async_trait::async_trait;
use log::{error, info, warn};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::sleep};
use url::Url;

use crate::config::ApiConfig;
use crate::error::ApiError;

const API_PREFIX: &str = "api/";
const SESSION_ID_COOKIE: &str = "sessionid";

/// A credential accepted by the status API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// `sessionid` cookie obtained from `api/login`.
    Session(String),
    Bearer(String),
}

/// One round trip to the status API, without retries or session caching.
#[async_trait]
pub trait StatusApi: Send + Sync {
    async fn login(&self) -> Result<Credential, ApiError>;

    /// Calls `endpoint` and returns the unwrapped `result` of the response envelope.
    async fn request(
        &self,
        credential: &Credential,
        endpoint: &str,
        params: &Value,
    ) -> Result<Value, ApiError>;
}

/// HTTP implementation talking to a CRCON-style API under `{base}api/`.
pub struct HttpStatusApi {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Serialize)]
struct LoginParameters<'a> {
    username: &'a str,
    password: &'a str,
}

impl HttpStatusApi {
    pub fn new(client: Client, api: &ApiConfig) -> Self {
        HttpStatusApi {
            client,
            base_url: api.base_server_url.clone(),
            api_key: api.api_key.clone().filter(|k| !k.is_empty()),
            username: api.username.clone(),
            password: api.password.clone(),
        }
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(&format!("{API_PREFIX}{endpoint}"))
            .map_err(|e| ApiError::Malformed(format!("invalid endpoint {endpoint}: {e}")))
    }
}

#[async_trait]
impl StatusApi for HttpStatusApi {
    async fn login(&self) -> Result<Credential, ApiError> {
        if let Some(key) = &self.api_key {
            return Ok(Credential::Bearer(key.clone()));
        }
        let (Some(username), Some(password)) = (&self.username, &self.password) else {
            return Err(ApiError::MissingCredentials);
        };

        let response = self
            .client
            .post(self.endpoint_url("login")?)
            .json(&LoginParameters { username, password })
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => return Err(ApiError::Unauthorized),
            status if !status.is_success() => return Err(ApiError::Status(status.as_u16())),
            _ => {}
        }

        response
            .cookies()
            .find(|cookie| cookie.name() == SESSION_ID_COOKIE)
            .map(|cookie| Credential::Session(cookie.value().to_string()))
            .ok_or_else(|| ApiError::Malformed("login response carried no session cookie".into()))
    }

    async fn request(
        &self,
        credential: &Credential,
        endpoint: &str,
        params: &Value,
    ) -> Result<Value, ApiError> {
        let mut request = self.client.post(self.endpoint_url(endpoint)?);
        request = match credential {
            Credential::Session(id) => request.header(
                reqwest::header::COOKIE,
                format!("{SESSION_ID_COOKIE}={id}"),
            ),
            Credential::Bearer(key) => request.bearer_auth(key),
        };
        if !params.is_null() {
            request = request.json(params);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::UNAUTHORIZED => return Err(ApiError::Unauthorized),
            status if !status.is_success() => return Err(ApiError::Status(status.as_u16())),
            _ => {}
        }

        let mut body: Value = response.json().await?;
        match body.get_mut("result").map(Value::take) {
            None | Some(Value::Null) => {
                Err(ApiError::Malformed(format!("empty result from {endpoint}")))
            }
            Some(result) => Ok(result),
        }
    }
}

/// Bounds for [`ApiClient::call`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts allowed for transient failures.
    pub attempts: u32,
    pub delay: Duration,
    /// Re-logins allowed within one call; 401s do not count as attempts.
    pub max_relogins: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 10,
            delay: Duration::from_secs(1),
            max_relogins: 3,
        }
    }
}

/// Per-server API client shared by every section of that server.
pub struct ApiClient {
    server: Arc<str>,
    api: Arc<dyn StatusApi>,
    // Held across the login call so that concurrent callers wait for one login
    session: Mutex<Option<Credential>>,
    policy: RetryPolicy,
}

impl ApiClient {
    pub fn new(server: impl Into<Arc<str>>, api: Arc<dyn StatusApi>) -> Self {
        Self::with_policy(server, api, RetryPolicy::default())
    }

    pub fn with_policy(
        server: impl Into<Arc<str>>,
        api: Arc<dyn StatusApi>,
        policy: RetryPolicy,
    ) -> Self {
        ApiClient {
            server: server.into(),
            api,
            session: Mutex::new(None),
            policy,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Calls `endpoint`, logging in and retrying as needed.
    ///
    /// Scalar and list results come back wrapped as `{"result": value}`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Exhausted`] once the transient retry budget is
    /// spent, [`ApiError::Unauthorized`] when re-logging in keeps failing, and
    /// non-transient errors such as [`ApiError::MissingCredentials`] at once.
    pub async fn call(
        &self,
        endpoint: &str,
        params: Value,
    ) -> Result<Map<String, Value>, ApiError> {
        let mut failures = 0;
        let mut relogins = 0;

        loop {
            match self.authenticated_request(endpoint, &params).await {
                Ok(result) => return Ok(normalize(result)),
                Err(ApiError::Unauthorized) => {
                    relogins += 1;
                    if relogins > self.policy.max_relogins {
                        error!("{} still unauthorized after {relogins} logins", self.server);
                        return Err(ApiError::Unauthorized);
                    }
                    warn!(
                        "{} HTTP 401 (Unauthorized) calling {endpoint}, logging in again",
                        self.server
                    );
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures >= self.policy.attempts {
                        error!("{} {endpoint} failed: {e}", self.server);
                        return Err(ApiError::Exhausted {
                            endpoint: endpoint.to_string(),
                            attempts: failures,
                        });
                    }
                    warn!(
                        "{} {endpoint} failed: {e}. Retrying attempt {failures}/{}, waiting {:?}",
                        self.server, self.policy.attempts, self.policy.delay
                    );
                    sleep(self.policy.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Single unretried `get_status` call used to check connectivity.
    pub async fn probe(&self) -> Result<(), ApiError> {
        self.authenticated_request("get_status", &Value::Null)
            .await
            .map(|_| ())
    }

    async fn authenticated_request(
        &self,
        endpoint: &str,
        params: &Value,
    ) -> Result<Value, ApiError> {
        let credential = self.credential().await?;
        match self.api.request(&credential, endpoint, params).await {
            Err(ApiError::Unauthorized) => {
                self.invalidate(&credential).await;
                Err(ApiError::Unauthorized)
            }
            other => other,
        }
    }

    async fn credential(&self) -> Result<Credential, ApiError> {
        let mut session = self.session.lock().await;
        if let Some(credential) = session.as_ref() {
            return Ok(credential.clone());
        }

        info!("{} logging in to the status API", self.server);
        let credential = self.api.login().await?;
        *session = Some(credential.clone());
        Ok(credential)
    }

    async fn invalidate(&self, stale: &Credential) {
        let mut session = self.session.lock().await;
        // Another section may already have logged in again
        if session.as_ref() == Some(stale) {
            *session = None;
        }
    }
}

fn normalize(result: Value) -> Map<String, Value> {
    match result {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub enum Scripted {
        Ok(Value),
        Unauthorized,
        Status(u16),
    }

    /// Status API double that answers from a script and then from a fallback.
    pub struct FakeApi {
        pub logins: AtomicUsize,
        pub requests: AtomicUsize,
        pub login_delay: Duration,
        script: std::sync::Mutex<VecDeque<Scripted>>,
        fallback: Box<dyn Fn(&str) -> Value + Send + Sync>,
    }

    impl FakeApi {
        pub fn new(fallback: impl Fn(&str) -> Value + Send + Sync + 'static) -> Self {
            FakeApi {
                logins: AtomicUsize::new(0),
                requests: AtomicUsize::new(0),
                login_delay: Duration::from_millis(50),
                script: std::sync::Mutex::new(VecDeque::new()),
                fallback: Box::new(fallback),
            }
        }

        pub fn then(self, outcome: Scripted) -> Self {
            self.script.lock().unwrap().push_back(outcome);
            self
        }

        pub fn logins(&self) -> usize {
            self.logins.load(Ordering::SeqCst)
        }

        pub fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatusApi for FakeApi {
        async fn login(&self) -> Result<Credential, ApiError> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst);
            sleep(self.login_delay).await;
            Ok(Credential::Session(format!("session-{n}")))
        }

        async fn request(
            &self,
            _credential: &Credential,
            endpoint: &str,
            _params: &Value,
        ) -> Result<Value, ApiError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            // Lets concurrent callers reach the server before any answer comes back
            tokio::task::yield_now().await;
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Scripted::Ok(value)) => Ok(value),
                Some(Scripted::Unauthorized) => Err(ApiError::Unauthorized),
                Some(Scripted::Status(code)) => Err(ApiError::Status(code)),
                None => Ok((self.fallback)(endpoint)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{FakeApi, Scripted};
    use super::*;
    use serde_json::json;
    use tokio::time::Instant;

    fn client(api: &Arc<FakeApi>) -> ApiClient {
        ApiClient::new("alpha", api.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_login() {
        let api = Arc::new(FakeApi::new(|_| json!({"name": "Alpha"})));
        let client = client(&api);

        let (a, b, c) = tokio::join!(
            client.call("get_status", Value::Null),
            client.call("get_gamestate", Value::Null),
            client.call("get_slots", Value::Null),
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(api.logins(), 1, "Expected exactly one login");
        assert_eq!(api.requests(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_triggers_relogin_without_delay() {
        let api = FakeApi::new(|_| json!("50/100"))
            .then(Scripted::Unauthorized);
        let api = Arc::new(api);
        let client = client(&api);

        let start = Instant::now();
        let result = client.call("get_slots", Value::Null).await.unwrap();

        assert_eq!(result["result"], json!("50/100"));
        assert_eq!(api.logins(), 2);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_unauthorized_calls_share_one_relogin() {
        let api = Arc::new(
            FakeApi::new(|_| json!({"name": "Alpha"}))
                .then(Scripted::Ok(json!({"name": "Alpha"})))
                .then(Scripted::Unauthorized)
                .then(Scripted::Unauthorized)
                .then(Scripted::Unauthorized),
        );
        let client = client(&api);
        client.call("get_status", Value::Null).await.unwrap();
        assert_eq!(api.logins(), 1);

        let (a, b, c) = tokio::join!(
            client.call("get_status", Value::Null),
            client.call("get_gamestate", Value::Null),
            client.call("get_live_game_stats", Value::Null),
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(api.logins(), 2, "Expected exactly one re-login");
        assert_eq!(api.requests(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_unauthorized_gives_up() {
        let mut api = FakeApi::new(|_| json!(1));
        for _ in 0..5 {
            api = api.then(Scripted::Unauthorized);
        }
        let api = Arc::new(api);

        let result = client(&api).call("get_slots", Value::Null).await;
        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert_eq!(api.logins(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_with_fixed_delay() {
        let api = Arc::new(
            FakeApi::new(|_| json!({"name": "Alpha"}))
                .then(Scripted::Status(502))
                .then(Scripted::Status(500)),
        );
        let client = client(&api);

        let start = Instant::now();
        let result = client.call("get_status", Value::Null).await;

        assert!(result.is_ok());
        assert_eq!(api.requests(), 3);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_the_call() {
        let mut api = FakeApi::new(|_| json!(1));
        for _ in 0..10 {
            api = api.then(Scripted::Status(503));
        }
        let api = Arc::new(api);

        let result = client(&api).call("get_vips_count", Value::Null).await;

        assert!(matches!(
            result,
            Err(ApiError::Exhausted { attempts: 10, .. })
        ));
        assert_eq!(api.requests(), 10);
    }

    #[test]
    fn test_scalar_and_list_results_are_wrapped() {
        assert_eq!(
            normalize(json!(7)),
            json!({"result": 7}).as_object().unwrap().clone()
        );
        assert_eq!(
            normalize(json!(["foy_warfare"])),
            json!({"result": ["foy_warfare"]}).as_object().unwrap().clone()
        );
        assert_eq!(
            normalize(json!({"name": "Alpha"})),
            json!({"name": "Alpha"}).as_object().unwrap().clone()
        );
    }

    #[tokio::test]
    async fn test_http_login_without_credentials_is_rejected() {
        let config = crate::config::test_support::sample();
        let mut api_config = config.api.clone();
        api_config.api_key = None;

        let api = HttpStatusApi::new(Client::new(), &api_config);
        assert!(matches!(
            api.login().await,
            Err(ApiError::MissingCredentials)
        ));
    }

    #[tokio::test]
    async fn test_http_login_with_api_key_needs_no_request() {
        let config = crate::config::test_support::sample();
        let api = HttpStatusApi::new(Client::new(), &config.api);
        assert_eq!(
            api.login().await.unwrap(),
            Credential::Bearer("secret".to_string())
        );
    }
}
