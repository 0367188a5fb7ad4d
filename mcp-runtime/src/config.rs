use std::time::Duration;

use metabase_core::{Credential, Error, Result};
use url::Url;

use crate::dispatch::RetryPolicy;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the runtime needs to talk to one Metabase instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub base_url: Url,
    pub credential: Credential,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl RuntimeConfig {
    pub fn new(base_url: Url, credential: Credential) -> Self {
        Self {
            base_url,
            credential,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Parse `METABASE_URL`. Trailing slashes and a trailing `/api` are dropped so
/// request paths can always be joined as `{base}/api{path}`.
pub fn parse_base_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Configuration("METABASE_URL must not be empty".to_string()));
    }
    let mut url = Url::parse(trimmed)
        .map_err(|e| Error::Configuration(format!("METABASE_URL is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Configuration(format!(
            "METABASE_URL must use http or https, got '{}'",
            url.scheme()
        )));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(Error::Configuration(
            "METABASE_URL must not carry a query string or fragment".to_string(),
        ));
    }
    let path = url.path().trim_end_matches('/');
    let path = path.strip_suffix("/api").unwrap_or(path).to_string();
    url.set_path(&path);
    Ok(url)
}
