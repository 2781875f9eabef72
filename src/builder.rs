use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use serde_json::Value;

use crate::cache::CachePolicy;
use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::config::{ClientConfig, HttpPolicy, StatusPolicy};
use crate::execution::ClientCore;
use crate::extensions::{Clock, JitterSource, SystemClock, ThreadRngJitter};
use crate::plugin::Plugin;
use crate::retry::RetryPolicy;

/// Builder shared by the blocking and async clients; `T` is the transport
/// trait object the finished client drives.
pub struct ClientBuilder<T: ?Sized> {
    transport: Arc<T>,
    config: ClientConfig,
    plugins: Vec<(Arc<dyn Plugin>, Value)>,
    jitter: Arc<dyn JitterSource>,
    clock: Arc<dyn Clock>,
}

impl<T: ?Sized> ClientBuilder<T> {
    pub(crate) fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            config: ClientConfig::new(),
            plugins: Vec::new(),
            jitter: Arc::new(ThreadRngJitter),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the whole configuration, including anything set earlier on
    /// this builder.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.config.retry = retry_policy;
        self
    }

    pub fn circuit_breaker_policy(mut self, circuit_breaker_policy: CircuitBreakerPolicy) -> Self {
        self.config.circuit_breaker = circuit_breaker_policy;
        self
    }

    pub fn cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.config.cache = cache_policy;
        self
    }

    pub fn http_policy(mut self, http_policy: HttpPolicy) -> Self {
        self.config.http = http_policy;
        self
    }

    pub fn default_timeout(mut self, default_timeout: Duration) -> Self {
        self.config.http = self.config.http.default_timeout(default_timeout);
        self
    }

    pub fn base_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.http = self.config.http.base_header(name, value);
        self
    }

    pub fn try_base_header(mut self, name: &str, value: &str) -> crate::Result<Self> {
        self.config.http = self.config.http.try_base_header(name, value)?;
        Ok(self)
    }

    pub fn status_policy(mut self, status_policy: StatusPolicy) -> Self {
        self.config.http = self.config.http.status_policy(status_policy);
        self
    }

    pub fn metrics_sample_size(mut self, metrics_sample_size: usize) -> Self {
        self.config.metrics_sample_size = metrics_sample_size;
        self
    }

    /// Registers `plugin` at build time, initialized with `config`.
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>, config: Value) -> Self {
        self.plugins.push((plugin, config));
        self
    }

    pub fn jitter_source(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Time source for breaker recovery, cache expiry and request durations.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn configured(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn into_parts(self) -> crate::Result<(Arc<T>, ClientCore)> {
        let core = ClientCore::new(self.config, self.plugins, self.jitter, self.clock)?;
        Ok((self.transport, core))
    }
}

impl<T: ?Sized> std::fmt::Debug for ClientBuilder<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field(
                "plugins",
                &self
                    .plugins
                    .iter()
                    .map(|(plugin, _)| plugin.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
