//! Blocking client: one calling thread per request, `std::thread::sleep`
//! between attempts.

use std::collections::BTreeMap;
use std::sync::Arc;

use http::Method;
use serde_json::Value;

use crate::builder::ClientBuilder;
use crate::circuit_breaker::CircuitState;
use crate::config::ClientConfig;
use crate::execution::ClientCore;
use crate::metrics::MetricsSnapshot;
use crate::plugin::Plugin;
use crate::request::RequestOptions;
use crate::response::HttpResponse;
use crate::transport::Transport;

mod execute;

pub type HttpClientBuilder = ClientBuilder<dyn Transport>;

impl ClientBuilder<dyn Transport> {
    pub fn build(self) -> crate::Result<HttpClient> {
        self.try_build()
    }

    /// Validates the configuration and initializes every registered plugin.
    pub fn try_build(self) -> crate::Result<HttpClient> {
        let (transport, core) = self.into_parts()?;
        Ok(HttpClient { transport, core })
    }
}

pub struct HttpClient {
    transport: Arc<dyn Transport>,
    core: ClientCore,
}

impl HttpClient {
    pub fn builder(transport: Arc<dyn Transport>) -> HttpClientBuilder {
        ClientBuilder::new(transport)
    }

    pub fn new(transport: Arc<dyn Transport>) -> crate::Result<Self> {
        Self::builder(transport).try_build()
    }

    pub fn get(&self, url: &str, options: RequestOptions) -> crate::Result<HttpResponse> {
        self.execute(Method::GET, url, options)
    }

    pub fn head(&self, url: &str, options: RequestOptions) -> crate::Result<HttpResponse> {
        self.execute(Method::HEAD, url, options)
    }

    pub fn post(&self, url: &str, options: RequestOptions) -> crate::Result<HttpResponse> {
        self.execute(Method::POST, url, options)
    }

    pub fn put(&self, url: &str, options: RequestOptions) -> crate::Result<HttpResponse> {
        self.execute(Method::PUT, url, options)
    }

    pub fn patch(&self, url: &str, options: RequestOptions) -> crate::Result<HttpResponse> {
        self.execute(Method::PATCH, url, options)
    }

    pub fn delete(&self, url: &str, options: RequestOptions) -> crate::Result<HttpResponse> {
        self.execute(Method::DELETE, url, options)
    }

    pub fn config(&self) -> &ClientConfig {
        self.core.config()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics().snapshot()
    }

    pub fn reset_metrics(&self) {
        self.core.metrics().reset();
    }

    pub fn circuit_breaker_state(&self, host: &str) -> CircuitState {
        self.core.breakers().state(host)
    }

    pub fn circuit_breaker_states(&self) -> BTreeMap<String, CircuitState> {
        self.core.breakers().states()
    }

    pub fn reset_circuit_breaker(&self, host: &str) {
        self.core.breakers().reset(host);
    }

    pub fn reset_circuit_breakers(&self) {
        self.core.breakers().reset_all();
    }

    pub fn clear_cache(&self) {
        self.core.cache().clear();
    }

    pub fn cache_len(&self) -> usize {
        self.core.cache().len()
    }

    /// Registers a plugin on a live client.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>, config: &Value) -> crate::Result<()> {
        self.core.plugins().register(plugin, config)
    }

    pub fn unregister_plugin(&self, name: &str) -> bool {
        self.core.plugins().unregister(name)
    }

    /// Plugins in execution order.
    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.core.plugins().plugins()
    }

    pub fn plugin_metrics(&self) -> BTreeMap<String, Value> {
        self.core.plugins().all_metrics()
    }

    /// Shuts every plugin down. Dropping the client does the same.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClient")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}
