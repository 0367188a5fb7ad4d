use std::fmt;

use crate::error::{Error, Result};

pub const API_KEY_ENV: &str = "METABASE_API_KEY";
pub const USER_EMAIL_ENV: &str = "METABASE_USER_EMAIL";
pub const PASSWORD_ENV: &str = "METABASE_PASSWORD";

/// The credential scheme active for the process lifetime.
/// Chosen once at startup, immutable afterwards, passed explicitly to every
/// component that needs it.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Static key sent as `X-API-KEY`. Never expires locally.
    ApiKey(String),
    /// Email/password pair exchanged for a session token via login.
    Session { email: String, password: String },
}

impl Credential {
    /// Resolve the credential from an environment-like lookup.
    /// An API key takes precedence over an email/password pair. Blank values
    /// count as absent.
    pub fn resolve<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = read(API_KEY_ENV) {
            return Ok(Credential::ApiKey(key));
        }

        match (read(USER_EMAIL_ENV), read(PASSWORD_ENV)) {
            (Some(email), Some(password)) => Ok(Credential::Session { email, password }),
            (Some(_), None) => Err(Error::Configuration(format!(
                "{USER_EMAIL_ENV} is set but {PASSWORD_ENV} is missing"
            ))),
            (None, Some(_)) => Err(Error::Configuration(format!(
                "{PASSWORD_ENV} is set but {USER_EMAIL_ENV} is missing"
            ))),
            (None, None) => Err(Error::Configuration(format!(
                "either {API_KEY_ENV} or both {USER_EMAIL_ENV} and {PASSWORD_ENV} must be provided"
            ))),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::resolve(|key| std::env::var(key).ok())
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            Credential::ApiKey(_) => "api_key",
            Credential::Session { .. } => "session",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::ApiKey(_) => f.write_str("Credential::ApiKey(<redacted>)"),
            Credential::Session { email, .. } => f
                .debug_struct("Credential::Session")
                .field("email", email)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn api_key_wins_over_session_pair() {
        let credential = Credential::resolve(env(&[
            (API_KEY_ENV, "mb_key"),
            (USER_EMAIL_ENV, "a@example.com"),
            (PASSWORD_ENV, "secret"),
        ]))
        .unwrap();
        assert_eq!(credential, Credential::ApiKey("mb_key".to_string()));
    }

    #[test]
    fn complete_pair_resolves_to_session() {
        let credential = Credential::resolve(env(&[
            (USER_EMAIL_ENV, "a@example.com"),
            (PASSWORD_ENV, "secret"),
        ]))
        .unwrap();
        assert_eq!(credential.method_name(), "session");
    }

    #[test]
    fn incomplete_or_blank_credentials_are_configuration_errors() {
        for pairs in [
            vec![],
            vec![(USER_EMAIL_ENV, "a@example.com")],
            vec![(PASSWORD_ENV, "secret")],
            vec![(API_KEY_ENV, "  "), (USER_EMAIL_ENV, "a@example.com")],
        ] {
            let err = Credential::resolve(env(&pairs)).expect_err("should not resolve");
            assert!(matches!(err, Error::Configuration(_)), "{err:?}");
        }
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let key = format!("{:?}", Credential::ApiKey("mb_secret_key".to_string()));
        assert!(!key.contains("mb_secret_key"));
        let session = format!(
            "{:?}",
            Credential::Session {
                email: "a@example.com".to_string(),
                password: "hunter2".to_string()
            }
        );
        assert!(session.contains("a@example.com"));
        assert!(!session.contains("hunter2"));
    }
}
