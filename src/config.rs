use std::time::Duration;

use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};

use crate::cache::CachePolicy;
use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::error::Error;
use crate::metrics::DEFAULT_SAMPLE_SIZE;
use crate::retry::RetryPolicy;
use crate::util::{parse_header_name, parse_header_value};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// What a final non-2xx response turns into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatusPolicy {
    /// Non-2xx becomes [`Error::HttpStatus`].
    #[default]
    Error,
    /// Non-2xx is returned to the caller as a response.
    Response,
}

#[derive(Clone, Debug)]
pub struct HttpPolicy {
    default_timeout: Duration,
    base_headers: HeaderMap,
    status_policy: StatusPolicy,
}

impl HttpPolicy {
    pub fn standard() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            base_headers: HeaderMap::new(),
            status_policy: StatusPolicy::Error,
        }
    }

    pub fn default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout;
        self
    }

    pub fn base_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.base_headers.insert(name, value);
        self
    }

    pub fn try_base_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.base_header(name, value))
    }

    pub fn status_policy(mut self, status_policy: StatusPolicy) -> Self {
        self.status_policy = status_policy;
        self
    }

    pub fn configured_default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn base_headers(&self) -> &HeaderMap {
        &self.base_headers
    }

    pub fn configured_status_policy(&self) -> StatusPolicy {
        self.status_policy
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.default_timeout.is_zero() {
            return Err(Error::InvalidConfig {
                field: "http.default_timeout",
                message: "must be greater than zero".to_owned(),
            });
        }
        Ok(())
    }
}

impl Default for HttpPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Complete client configuration. Built once, validated when the client is
/// constructed and immutable afterwards.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerPolicy,
    pub cache: CachePolicy,
    pub http: HttpPolicy,
    pub metrics_sample_size: usize,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self {
            retry: RetryPolicy::standard(),
            circuit_breaker: CircuitBreakerPolicy::standard(),
            cache: CachePolicy::disabled(),
            http: HttpPolicy::standard(),
            metrics_sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_http(mut self, http: HttpPolicy) -> Self {
        self.http = http;
        self
    }

    pub fn with_metrics_sample_size(mut self, metrics_sample_size: usize) -> Self {
        self.metrics_sample_size = metrics_sample_size;
        self
    }

    /// Checks every policy and reports the first offending field.
    pub fn validate(&self) -> crate::Result<()> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.cache.validate()?;
        self.http.validate()?;
        if self.metrics_sample_size == 0 {
            return Err(Error::InvalidConfig {
                field: "metrics.sample_size",
                message: "must be at least 1".to_owned(),
            });
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ClientConfig, HttpPolicy, StatusPolicy};
    use crate::error::Error;
    use crate::retry::RetryPolicy;

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        config.validate().expect("default config should validate");
        assert_eq!(config.http.configured_default_timeout(), Duration::from_secs(30));
        assert_eq!(config.http.configured_status_policy(), StatusPolicy::Error);
        assert!(!config.cache.is_enabled());
        assert_eq!(config.metrics_sample_size, 100);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config =
            ClientConfig::new().with_http(HttpPolicy::standard().default_timeout(Duration::ZERO));
        match config.validate() {
            Err(Error::InvalidConfig { field, .. }) => assert_eq!(field, "http.default_timeout"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn nested_policy_errors_surface() {
        let config = ClientConfig::new().with_retry(RetryPolicy::standard().max_attempts(0));
        match config.validate() {
            Err(Error::InvalidConfig { field, .. }) => assert_eq!(field, "retry.max_attempts"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn zero_sample_size_is_rejected() {
        let config = ClientConfig::new().with_metrics_sample_size(0);
        match config.validate() {
            Err(Error::InvalidConfig { field, .. }) => assert_eq!(field, "metrics.sample_size"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn base_header_parses_text() {
        let policy = HttpPolicy::standard()
            .try_base_header("x-client", "reqguard")
            .expect("header should parse");
        assert_eq!(policy.base_headers()["x-client"], "reqguard");
    }
}
