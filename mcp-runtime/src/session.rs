//! Credential-scheme selection and session token lifecycle.
//!
//! With an API key every request carries `X-API-KEY` and nothing is ever
//! fetched. With email/password the authenticator logs in lazily, caches the
//! token, and re-acquires it after the dispatcher reports it stale. The state
//! lock is held across the login round-trip so concurrent callers share a
//! single acquisition.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metabase_core::{Credential, Error, Result};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use url::Url;

use crate::dispatch::api_url;

pub const API_KEY_HEADER: &str = "X-API-KEY";
pub const SESSION_HEADER: &str = "X-Metabase-Session";

const SESSION_PATH: &str = "/session";

#[derive(Clone)]
pub struct SessionToken {
    value: String,
    created_at: DateTime<Utc>,
}

impl SessionToken {
    fn new(value: String) -> Self {
        Self {
            value,
            created_at: Utc::now(),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("value", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[derive(Debug)]
enum SessionState {
    NoToken,
    Valid(SessionToken),
    Invalid,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::NoToken => "no_token",
            SessionState::Valid(_) => "valid",
            SessionState::Invalid => "invalid",
        }
    }
}

/// The header a request must carry. `value` doubles as the token handle
/// passed back to [`SessionAuthenticator::invalidate`].
#[derive(Clone, PartialEq, Eq)]
pub struct AuthHeader {
    pub name: &'static str,
    pub value: String,
}

impl fmt::Debug for AuthHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthHeader")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .finish()
    }
}

pub struct SessionAuthenticator {
    credential: Credential,
    base_url: Url,
    http: reqwest::Client,
    timeout: Duration,
    state: Mutex<SessionState>,
}

impl SessionAuthenticator {
    pub fn new(
        credential: Credential,
        base_url: Url,
        http: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            credential,
            base_url,
            http,
            timeout,
            state: Mutex::new(SessionState::NoToken),
        }
    }

    pub fn uses_session(&self) -> bool {
        matches!(self.credential, Credential::Session { .. })
    }

    pub fn method_name(&self) -> &'static str {
        self.credential.method_name()
    }

    pub async fn state_name(&self) -> &'static str {
        self.state.lock().await.name()
    }

    /// Header for the next request, logging in first when no valid session
    /// token is cached.
    pub async fn auth_header(&self) -> Result<AuthHeader> {
        let (email, password) = match &self.credential {
            Credential::ApiKey(key) => {
                return Ok(AuthHeader {
                    name: API_KEY_HEADER,
                    value: key.clone(),
                });
            }
            Credential::Session { email, password } => (email, password),
        };

        let mut state = self.state.lock().await;
        if let SessionState::Valid(token) = &*state {
            return Ok(AuthHeader {
                name: SESSION_HEADER,
                value: token.value.clone(),
            });
        }

        tracing::debug!(previous = state.name(), "acquiring metabase session");
        match self.login(email, password).await {
            Ok(token) => {
                let header = AuthHeader {
                    name: SESSION_HEADER,
                    value: token.value.clone(),
                };
                *state = SessionState::Valid(token);
                tracing::info!("metabase session established");
                Ok(header)
            }
            Err(err) => {
                *state = SessionState::NoToken;
                tracing::warn!(error = %err, "metabase login failed");
                Err(err)
            }
        }
    }

    /// Mark `stale` as rejected. A no-op when another caller already replaced
    /// it, so concurrent rejections of one token cause one re-login.
    pub async fn invalidate(&self, stale: &str) {
        let mut state = self.state.lock().await;
        if matches!(&*state, SessionState::Valid(token) if token.value == stale) {
            *state = SessionState::Invalid;
            tracing::debug!("metabase session token invalidated");
        }
    }

    /// Best-effort server-side logout. Only meaningful for sessions.
    pub async fn logout(&self) -> Result<()> {
        let token = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, SessionState::NoToken) {
                SessionState::Valid(token) => token,
                _ => return Ok(()),
            }
        };
        let url = api_url(&self.base_url, SESSION_PATH)?;
        let response = self
            .http
            .delete(url)
            .header(SESSION_HEADER, &token.value)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Network {
                path: SESSION_PATH.to_string(),
                message: e.without_url().to_string(),
            })?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::client(status, SESSION_PATH, &body));
        }
        tracing::info!("metabase session closed");
        Ok(())
    }

    async fn login(&self, email: &str, password: &str) -> Result<SessionToken> {
        let url = api_url(&self.base_url, SESSION_PATH)?;
        let response = self
            .http
            .post(url)
            .json(&json!({ "username": email, "password": password }))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() { "timed out" } else { "could not reach Metabase" };
                Error::Authentication(format!("login request {reason}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Authentication(format!(
                "login rejected with status {}",
                status.as_u16()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|_| Error::Authentication("login response was not JSON".to_string()))?;
        body.get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(|id| SessionToken::new(id.to_string()))
            .ok_or_else(|| {
                Error::Authentication("login response carried no session id".to_string())
            })
    }

    #[cfg(test)]
    pub(crate) async fn seed_token(&self, value: &str) {
        *self.state.lock().await = SessionState::Valid(SessionToken::new(value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use httpmock::prelude::*;

    use super::*;

    fn session_credential() -> Credential {
        Credential::Session {
            email: "analyst@example.com".to_string(),
            password: "hunter2".to_string(),
        }
    }

    fn authenticator(server: &MockServer, credential: Credential) -> SessionAuthenticator {
        SessionAuthenticator::new(
            credential,
            Url::parse(&server.base_url()).unwrap(),
            reqwest::Client::new(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn api_key_never_touches_the_network() {
        let server = MockServer::start_async().await;
        let login = server
            .mock_async(|when, then| {
                when.path("/api/session");
                then.status(200).json_body(json!({ "id": "unused" }));
            })
            .await;
        let auth = authenticator(&server, Credential::ApiKey("mb_key".to_string()));

        let header = auth.auth_header().await.unwrap();
        assert_eq!(header.name, API_KEY_HEADER);
        assert_eq!(header.value, "mb_key");
        auth.invalidate("mb_key").await;
        auth.logout().await.unwrap();
        login.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_login() {
        let server = MockServer::start_async().await;
        let login = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/session")
                    .json_body(json!({ "username": "analyst@example.com", "password": "hunter2" }));
                then.status(200)
                    .delay(Duration::from_millis(100))
                    .json_body(json!({ "id": "token-1" }));
            })
            .await;
        let auth = Arc::new(authenticator(&server, session_credential()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let auth = Arc::clone(&auth);
            handles.push(tokio::spawn(async move { auth.auth_header().await }));
        }
        for handle in handles {
            let header = handle.await.unwrap().unwrap();
            assert_eq!(header.name, SESSION_HEADER);
            assert_eq!(header.value, "token-1");
        }
        login.assert_hits_async(1).await;
        assert_eq!(auth.state_name().await, "valid");
    }

    #[tokio::test]
    async fn stale_invalidation_is_ignored_after_refresh() {
        let server = MockServer::start_async().await;
        let login = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/session");
                then.status(200).json_body(json!({ "id": "fresh" }));
            })
            .await;
        let auth = authenticator(&server, session_credential());
        auth.seed_token("old").await;

        auth.invalidate("old").await;
        assert_eq!(auth.state_name().await, "invalid");
        assert_eq!(auth.auth_header().await.unwrap().value, "fresh");

        // A late rejection of the replaced token must not drop the new one.
        auth.invalidate("old").await;
        assert_eq!(auth.state_name().await, "valid");
        assert_eq!(auth.auth_header().await.unwrap().value, "fresh");
        login.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn rejected_login_is_an_authentication_error_and_resets_state() {
        let server = MockServer::start_async().await;
        let login = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/session");
                then.status(401)
                    .json_body(json!({ "errors": { "password": "did not match stored password" } }));
            })
            .await;
        let auth = authenticator(&server, session_credential());

        let err = auth.auth_header().await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert!(!err.to_string().contains("hunter2"));
        assert_eq!(auth.state_name().await, "no_token");

        // No retry at this layer: each call is one attempt.
        let _ = auth.auth_header().await;
        login.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn logout_deletes_the_active_session() {
        let server = MockServer::start_async().await;
        let logout = server
            .mock_async(|when, then| {
                when.method(DELETE)
                    .path("/api/session")
                    .header(SESSION_HEADER, "live");
                then.status(204);
            })
            .await;
        let auth = authenticator(&server, session_credential());
        auth.seed_token("live").await;

        auth.logout().await.unwrap();
        assert_eq!(auth.state_name().await, "no_token");
        auth.logout().await.unwrap();
        logout.assert_hits_async(1).await;
    }
}
