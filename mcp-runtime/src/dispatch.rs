//! Authenticated request dispatch against the Metabase REST API.

use std::sync::Arc;
use std::time::Duration;

use metabase_core::{Error, Result};
use reqwest::Method;
use serde_json::Value;
use url::Url;

use crate::session::{AuthHeader, SessionAuthenticator};

/// Bounded retry for transient failures.
/// delay = min(base_delay * 2^(attempt-1), max_delay)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 2u64.saturating_pow(exponent);
        let delay = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as u64))
    }
}

/// `{base}/api{path}`, with `path` already normalised.
pub(crate) fn api_url(base: &Url, path: &str) -> Result<Url> {
    let raw = format!("{}/api{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&raw).map_err(|e| Error::invalid_field("path", format!("invalid request path: {e}")))
}

pub(crate) fn normalize_api_path(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_field("path", "API path must not be empty"));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Err(Error::invalid_field(
            "path",
            "pass an API path (e.g. /card/1), not a full URL",
        ));
    }
    let trimmed = trimmed.strip_prefix("/api/").map_or(trimmed, |rest| rest);
    if trimmed.starts_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("/{trimmed}"))
    }
}

fn parse_response_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).to_string()))
}

/// Query endpoints answer 202 even when the query itself failed; the
/// failure is carried as `{"status": "failed", "error": ...}` in the body.
pub(crate) fn check_query_result(status: u16, path: &str, body: Value) -> Result<Value> {
    if body.get("status").and_then(Value::as_str) != Some("failed") {
        return Ok(body);
    }
    let message = match body.get("error") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => "query failed".to_string(),
        Some(other) => other.to_string(),
    };
    Err(Error::client(status, path, &message))
}

/// Outcome of a single HTTP round-trip, before retry/re-auth decisions.
enum Attempt {
    Success { status: u16, body: Value },
    AuthExpired { body: String },
    Failed(Error),
}

pub struct Dispatcher {
    http: reqwest::Client,
    base_url: Url,
    auth: Arc<SessionAuthenticator>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        http: reqwest::Client,
        base_url: Url,
        auth: Arc<SessionAuthenticator>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            base_url,
            auth,
            timeout,
            retry,
        }
    }

    pub fn authenticator(&self) -> &SessionAuthenticator {
        &self.auth
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.send(Method::GET, path, None, &[]).await
    }

    pub async fn get_with_query(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.send(Method::GET, path, None, query).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(Method::POST, path, Some(body), &[]).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(Method::PUT, path, Some(body), &[]).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.send(Method::DELETE, path, None, &[]).await
    }

    /// POST a query to `/dataset` or `/card/:id/query`. A result whose
    /// `status` is `failed` becomes a client error carrying the remote message.
    pub async fn run_query(&self, path: &str, body: &Value) -> Result<Value> {
        let path = normalize_api_path(path)?;
        let (status, result) = self.exchange(Method::POST, &path, Some(body), &[]).await?;
        check_query_result(status, &path, result)
    }

    /// Send one logical request. Transient failures are retried up to the
    /// policy bound; a session 401 triggers one re-login and one resend.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: &[(&str, String)],
    ) -> Result<Value> {
        let (_, value) = self.exchange(method, path, body, query).await?;
        Ok(value)
    }

    async fn exchange(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: &[(&str, String)],
    ) -> Result<(u16, Value)> {
        let path = normalize_api_path(path)?;
        let mut url = api_url(&self.base_url, &path)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }

        let mut attempt = 1;
        let mut reauthenticated = false;
        loop {
            let header = self.auth.auth_header().await?;
            tracing::debug!(method = %method, path = %path, attempt, "metabase request");
            match self.attempt(method.clone(), url.clone(), body, &header, &path).await {
                Attempt::Success { status, body } => return Ok((status, body)),
                Attempt::AuthExpired { body } => {
                    if !self.auth.uses_session() {
                        return Err(Error::client(401, &path, &body));
                    }
                    if reauthenticated {
                        return Err(Error::Authentication(format!(
                            "{path} was still rejected after re-authenticating"
                        )));
                    }
                    tracing::info!(path = %path, "metabase session expired; re-authenticating");
                    self.auth.invalidate(&header.value).await;
                    reauthenticated = true;
                }
                Attempt::Failed(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.calculate_backoff(attempt);
                    tracing::warn!(
                        path = %path,
                        attempt,
                        error = %err,
                        "transient metabase failure; retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Attempt::Failed(err) => {
                    tracing::debug!(path = %path, code = err.code(), "metabase request failed");
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        header: &AuthHeader,
        path: &str,
    ) -> Attempt {
        let mut request = self
            .http
            .request(method, url)
            .header(header.name, &header.value)
            .timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Attempt::Failed(transport_error(e, path)),
        };
        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return Attempt::Failed(transport_error(e, path)),
        };

        let code = status.as_u16();
        if status.is_success() {
            return Attempt::Success {
                status: code,
                body: parse_response_body(&bytes),
            };
        }
        let text = String::from_utf8_lossy(&bytes);
        match code {
            401 => Attempt::AuthExpired {
                body: text.into_owned(),
            },
            500..=599 => Attempt::Failed(Error::server(code, path, &text)),
            _ => Attempt::Failed(Error::client(code, path, &text)),
        }
    }
}

fn transport_error(err: reqwest::Error, path: &str) -> Error {
    if err.is_timeout() {
        Error::Timeout {
            path: path.to_string(),
        }
    } else {
        Error::Network {
            path: path.to_string(),
            message: err.without_url().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use metabase_core::Credential;
    use serde_json::json;

    use super::*;
    use crate::session::{API_KEY_HEADER, SESSION_HEADER};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn dispatcher(server: &MockServer, credential: Credential, timeout: Duration) -> Dispatcher {
        let http = reqwest::Client::new();
        let base_url = Url::parse(&server.base_url()).unwrap();
        let auth = Arc::new(SessionAuthenticator::new(
            credential,
            base_url.clone(),
            http.clone(),
            timeout,
        ));
        Dispatcher::new(http, base_url, auth, timeout, fast_retry())
    }

    fn api_key() -> Credential {
        Credential::ApiKey("mb_key".to_string())
    }

    fn session() -> Credential {
        Credential::Session {
            email: "analyst@example.com".to_string(),
            password: "hunter2".to_string(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.calculate_backoff(1), Duration::from_millis(250));
        assert_eq!(policy.calculate_backoff(2), Duration::from_millis(500));
        assert_eq!(policy.calculate_backoff(3), Duration::from_millis(1000));
        assert_eq!(policy.calculate_backoff(10), Duration::from_secs(4));
    }

    #[test]
    fn paths_are_normalised() {
        assert_eq!(normalize_api_path("card/1").unwrap(), "/card/1");
        assert_eq!(normalize_api_path("/api/card/1").unwrap(), "/card/1");
        assert!(normalize_api_path("https://evil.example.com/api/card").is_err());
        assert!(normalize_api_path("  ").is_err());
    }

    #[tokio::test]
    async fn success_returns_payload_with_api_key_header() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/card/1")
                    .header(API_KEY_HEADER, "mb_key");
                then.status(200).json_body(json!({ "id": 1, "name": "Orders" }));
            })
            .await;
        let dispatcher = dispatcher(&server, api_key(), Duration::from_secs(5));

        let body = dispatcher.get("/card/1").await.unwrap();
        assert_eq!(body["name"], "Orders");
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn empty_success_body_is_null() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/api/card/1");
                then.status(204);
            })
            .await;
        let dispatcher = dispatcher(&server, api_key(), Duration::from_secs(5));
        assert_eq!(dispatcher.delete("/card/1").await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn server_errors_are_retried_to_the_bound() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/dataset");
                then.status(503).body("unavailable");
            })
            .await;
        let dispatcher = dispatcher(&server, api_key(), Duration::from_secs(5));

        let err = dispatcher.post("/dataset", &json!({})).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert!(matches!(err, Error::Server { .. }));
        mock.assert_hits_async(3).await;
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/card/404");
                then.status(404).body("Not found.");
            })
            .await;
        let dispatcher = dispatcher(&server, api_key(), Duration::from_secs(5));

        let err = dispatcher.get("/card/404").await.unwrap_err();
        let Error::Client { status, path, body } = &err else {
            panic!("expected client error, got {err:?}");
        };
        assert_eq!(*status, 404);
        assert_eq!(path, "/card/404");
        assert_eq!(body, "Not found.");
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn api_key_401_is_a_client_error() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/database");
                then.status(401).body("Unauthenticated");
            })
            .await;
        let dispatcher = dispatcher(&server, api_key(), Duration::from_secs(5));

        let err = dispatcher.get("/database").await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert!(!err.to_string().contains("mb_key"));
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn session_401_reauthenticates_once_and_retries() {
        let server = MockServer::start_async().await;
        let login = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/session");
                then.status(200).json_body(json!({ "id": "fresh" }));
            })
            .await;
        let stale = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/database")
                    .header(SESSION_HEADER, "stale");
                then.status(401).body("Unauthenticated");
            })
            .await;
        let fresh = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/database")
                    .header(SESSION_HEADER, "fresh");
                then.status(200).json_body(json!({ "data": [] }));
            })
            .await;
        let dispatcher = dispatcher(&server, session(), Duration::from_secs(5));
        dispatcher.authenticator().seed_token("stale").await;

        let body = dispatcher.get("/database").await.unwrap();
        assert_eq!(body, json!({ "data": [] }));
        stale.assert_hits_async(1).await;
        fresh.assert_hits_async(1).await;
        login.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn second_401_escalates_to_authentication_error() {
        let server = MockServer::start_async().await;
        let login = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/session");
                then.status(200).json_body(json!({ "id": "token" }));
            })
            .await;
        let rejected = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/database");
                then.status(401).body("Unauthenticated");
            })
            .await;
        let dispatcher = dispatcher(&server, session(), Duration::from_secs(5));

        let err = dispatcher.get("/database").await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)), "{err:?}");
        rejected.assert_hits_async(2).await;
        login.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn timeouts_are_not_retried() {
        let server = MockServer::start_async().await;
        let slow = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/dataset");
                then.status(200)
                    .delay(Duration::from_millis(500))
                    .json_body(json!({}));
            })
            .await;
        let dispatcher = dispatcher(&server, api_key(), Duration::from_millis(50));

        let err = dispatcher.post("/dataset", &json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err:?}");
        slow.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn connection_failures_are_network_errors() {
        let http = reqwest::Client::new();
        let base_url = Url::parse("http://127.0.0.1:9").unwrap();
        let auth = Arc::new(SessionAuthenticator::new(
            api_key(),
            base_url.clone(),
            http.clone(),
            Duration::from_secs(1),
        ));
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(40),
            max_delay: Duration::from_millis(60),
        };
        let dispatcher = Dispatcher::new(http, base_url, auth, Duration::from_secs(1), retry);

        let started = std::time::Instant::now();
        let err = dispatcher.get("/database").await.unwrap_err();
        assert!(matches!(err, Error::Network { .. }), "{err:?}");
        // Two backoffs (40ms, then 60ms) separate the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(100), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn a_single_attempt_policy_does_not_wait() {
        let http = reqwest::Client::new();
        let base_url = Url::parse("http://127.0.0.1:9").unwrap();
        let auth = Arc::new(SessionAuthenticator::new(
            api_key(),
            base_url.clone(),
            http.clone(),
            Duration::from_secs(1),
        ));
        let retry = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
        };
        let dispatcher = Dispatcher::new(http, base_url, auth, Duration::from_secs(1), retry);

        let started = std::time::Instant::now();
        let err = dispatcher.get("/database").await.unwrap_err();
        assert!(matches!(err, Error::Network { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn failed_query_results_become_client_errors() {
        let body = json!({ "status": "failed", "error": "Metric 999 does not exist" });
        let err = check_query_result(202, "/dataset", body).unwrap_err();
        let Error::Client { status, path, body } = &err else {
            panic!("expected client error, got {err:?}");
        };
        assert_eq!(*status, 202);
        assert_eq!(path, "/dataset");
        assert_eq!(body, "Metric 999 does not exist");

        let completed = json!({ "status": "completed", "data": { "rows": [] } });
        assert_eq!(check_query_result(202, "/dataset", completed.clone()).unwrap(), completed);
    }

    #[tokio::test]
    async fn run_query_surfaces_failed_status() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/card/7/query");
                then.status(202)
                    .json_body(json!({ "status": "failed", "error": "Column missing" }));
            })
            .await;
        let dispatcher = dispatcher(&server, api_key(), Duration::from_secs(5));

        let err = dispatcher
            .run_query("card/7/query", &json!({ "parameters": [] }))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(202));
        assert!(err.to_string().contains("Column missing"), "{err}");
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn query_pairs_are_appended() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/card")
                    .query_param("f", "all");
                then.status(200).json_body(json!([]));
            })
            .await;
        let dispatcher = dispatcher(&server, api_key(), Duration::from_secs(5));
        dispatcher
            .get_with_query("/card", &[("f", "all".to_string())])
            .await
            .unwrap();
        mock.assert_hits_async(1).await;
    }
}
