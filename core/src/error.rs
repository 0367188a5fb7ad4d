use serde_json::{Value, json};

/// Maximum number of characters of a remote response body kept in an error.
pub const ERROR_BODY_MAX_CHARS: usize = 512;

/// Structured error for agent callers.
/// Every variant carries enough context for the caller to decide whether to
/// fix its input, retry, or give up. Credentials never appear in any field.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Missing or contradictory credentials. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Login failed or re-authentication was exhausted for this call.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Malformed query/parameter/mapping input. Never sent upstream.
    #[error("{message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// The remote rejected a structurally valid request (4xx other than 401),
    /// or accepted a query that then reported `status: failed`.
    #[error("request to {path} rejected with status {status}: {body}")]
    Client {
        status: u16,
        path: String,
        body: String,
    },

    /// 5xx from the remote, after retries were exhausted.
    #[error("request to {path} failed with server status {status}")]
    Server {
        status: u16,
        path: String,
        body: String,
    },

    /// Connection-level failure, after retries were exhausted.
    #[error("network error calling {path}: {message}")]
    Network { path: String, message: String },

    /// The call exceeded its deadline. The remote may or may not have applied it.
    #[error("request to {path} timed out")]
    Timeout { path: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error codes used across the tool surface
pub mod codes {
    pub const CONFIGURATION_ERROR: &str = "configuration_error";
    pub const AUTHENTICATION_FAILED: &str = "authentication_failed";
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const CLIENT_ERROR: &str = "client_error";
    pub const SERVER_ERROR: &str = "server_error";
    pub const NETWORK_ERROR: &str = "network_error";
    pub const TIMEOUT: &str = "timeout";
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Build a `Client` error, truncating the remote body.
    pub fn client(status: u16, path: impl Into<String>, body: &str) -> Self {
        Error::Client {
            status,
            path: path.into(),
            body: truncate_body(body),
        }
    }

    /// Build a `Server` error, truncating the remote body.
    pub fn server(status: u16, path: impl Into<String>, body: &str) -> Self {
        Error::Server {
            status,
            path: path.into(),
            body: truncate_body(body),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Error::Configuration(_) => codes::CONFIGURATION_ERROR,
            Error::Authentication(_) => codes::AUTHENTICATION_FAILED,
            Error::Validation { .. } => codes::VALIDATION_FAILED,
            Error::Client { .. } => codes::CLIENT_ERROR,
            Error::Server { .. } => codes::SERVER_ERROR,
            Error::Network { .. } => codes::NETWORK_ERROR,
            Error::Timeout { .. } => codes::TIMEOUT,
        }
    }

    /// Transient failures are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Server { .. } | Error::Network { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Client { status, .. } | Error::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            Error::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    /// Remediation hint for the calling agent.
    pub fn docs_hint(&self) -> Option<&'static str> {
        match self {
            Error::Configuration(_) => Some(
                "Set METABASE_URL and either METABASE_API_KEY or both METABASE_USER_EMAIL and METABASE_PASSWORD.",
            ),
            Error::Authentication(_) => {
                Some("Check the Metabase credentials; the whole call may be retried.")
            }
            Error::Validation { .. } => Some("Correct the arguments and retry."),
            Error::Client { .. } => {
                Some("The request was rejected by Metabase; check referenced ids and retry.")
            }
            Error::Server { .. } | Error::Network { .. } => {
                Some("Metabase is unavailable; retry later.")
            }
            Error::Timeout { .. } => Some(
                "The call timed out; the effect may have been applied. Read back state before retrying writes.",
            ),
        }
    }

    /// Structured details for remote errors.
    pub fn details(&self) -> Option<Value> {
        match self {
            Error::Client { status, path, body } | Error::Server { status, path, body } => {
                Some(json!({ "status": status, "path": path, "body": body }))
            }
            Error::Network { path, .. } | Error::Timeout { path } => Some(json!({ "path": path })),
            _ => None,
        }
    }

    /// `{error, message, field?, docs_hint?, details?}`
    pub fn to_value(&self) -> Value {
        let mut payload = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        if let Some(field) = self.field() {
            payload["field"] = json!(field);
        }
        if let Some(hint) = self.docs_hint() {
            payload["docs_hint"] = json!(hint);
        }
        if let Some(details) = self.details() {
            payload["details"] = details;
        }
        payload
    }
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= ERROR_BODY_MAX_CHARS {
        return body.to_string();
    }
    let mut truncated = body.chars().take(ERROR_BODY_MAX_CHARS).collect::<String>();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_bodies_are_truncated() {
        let body = "x".repeat(ERROR_BODY_MAX_CHARS * 2);
        let err = Error::client(404, "/card/1", &body);
        let Error::Client { body, .. } = &err else {
            panic!("expected client error");
        };
        assert_eq!(body.chars().count(), ERROR_BODY_MAX_CHARS + 3);
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.code(), codes::CLIENT_ERROR);
    }

    #[test]
    fn only_server_and_network_errors_are_transient() {
        assert!(Error::server(502, "/dataset", "").is_transient());
        assert!(
            Error::Network {
                path: "/dataset".to_string(),
                message: "refused".to_string()
            }
            .is_transient()
        );
        assert!(!Error::client(400, "/dataset", "").is_transient());
        assert!(
            !Error::Timeout {
                path: "/dataset".to_string()
            }
            .is_transient()
        );
        assert!(!Error::validation("bad").is_transient());
    }
}
