//! Async client for tokio. Clones share one breaker registry, cache, metrics
//! registry and plugin pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use http::Method;
use serde_json::Value;
use tracing::{Instrument, debug};

use crate::builder::ClientBuilder;
use crate::circuit_breaker::CircuitState;
use crate::config::ClientConfig;
use crate::execution::{ClientCore, Start, Step};
use crate::metrics::MetricsSnapshot;
use crate::plugin::Plugin;
use crate::request::RequestOptions;
use crate::response::HttpResponse;
use crate::transport::AsyncTransport;

pub type AsyncHttpClientBuilder = ClientBuilder<dyn AsyncTransport>;

impl ClientBuilder<dyn AsyncTransport> {
    pub fn build(self) -> crate::Result<AsyncHttpClient> {
        self.try_build()
    }

    /// Validates the configuration and initializes every registered plugin.
    pub fn try_build(self) -> crate::Result<AsyncHttpClient> {
        let (transport, core) = self.into_parts()?;
        Ok(AsyncHttpClient {
            inner: Arc::new(Inner { transport, core }),
        })
    }
}

struct Inner {
    transport: Arc<dyn AsyncTransport>,
    core: ClientCore,
}

/// Cheap to clone. No concurrency cap is applied; callers fan out as they see
/// fit. Dropping a request future mid-flight leaves shared state consistent.
#[derive(Clone)]
pub struct AsyncHttpClient {
    inner: Arc<Inner>,
}

impl AsyncHttpClient {
    pub fn builder(transport: Arc<dyn AsyncTransport>) -> AsyncHttpClientBuilder {
        ClientBuilder::new(transport)
    }

    pub fn new(transport: Arc<dyn AsyncTransport>) -> crate::Result<Self> {
        Self::builder(transport).try_build()
    }

    /// Runs one logical request: cache, breaker, plugins and the retry loop.
    /// Backoff waits yield to the runtime.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> crate::Result<HttpResponse> {
        let core = &self.inner.core;
        let mut run = match core.start(method, url, options) {
            Start::Finished(result) => return result,
            Start::Run(run) => run,
        };

        loop {
            let span = run.span().clone();
            span.in_scope(|| debug!(attempt = run.attempt(), "sending request"));
            let result = self
                .inner
                .transport
                .send(run.request())
                .instrument(span)
                .await;
            match core.complete_attempt(&mut run, result) {
                Step::Retry(delay) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Step::Finished(result) => return result,
            }
        }
    }

    pub async fn get(&self, url: &str, options: RequestOptions) -> crate::Result<HttpResponse> {
        self.execute(Method::GET, url, options).await
    }

    pub async fn head(&self, url: &str, options: RequestOptions) -> crate::Result<HttpResponse> {
        self.execute(Method::HEAD, url, options).await
    }

    pub async fn post(&self, url: &str, options: RequestOptions) -> crate::Result<HttpResponse> {
        self.execute(Method::POST, url, options).await
    }

    pub async fn put(&self, url: &str, options: RequestOptions) -> crate::Result<HttpResponse> {
        self.execute(Method::PUT, url, options).await
    }

    pub async fn patch(&self, url: &str, options: RequestOptions) -> crate::Result<HttpResponse> {
        self.execute(Method::PATCH, url, options).await
    }

    pub async fn delete(&self, url: &str, options: RequestOptions) -> crate::Result<HttpResponse> {
        self.execute(Method::DELETE, url, options).await
    }

    pub fn config(&self) -> &ClientConfig {
        self.inner.core.config()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.core.metrics().snapshot()
    }

    pub fn reset_metrics(&self) {
        self.inner.core.metrics().reset();
    }

    pub fn circuit_breaker_state(&self, host: &str) -> CircuitState {
        self.inner.core.breakers().state(host)
    }

    pub fn circuit_breaker_states(&self) -> BTreeMap<String, CircuitState> {
        self.inner.core.breakers().states()
    }

    pub fn reset_circuit_breaker(&self, host: &str) {
        self.inner.core.breakers().reset(host);
    }

    pub fn reset_circuit_breakers(&self) {
        self.inner.core.breakers().reset_all();
    }

    pub fn clear_cache(&self) {
        self.inner.core.cache().clear();
    }

    pub fn cache_len(&self) -> usize {
        self.inner.core.cache().len()
    }

    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>, config: &Value) -> crate::Result<()> {
        self.inner.core.plugins().register(plugin, config)
    }

    pub fn unregister_plugin(&self, name: &str) -> bool {
        self.inner.core.plugins().unregister(name)
    }

    /// Plugins in execution order.
    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.inner.core.plugins().plugins()
    }

    pub fn plugin_metrics(&self) -> BTreeMap<String, Value> {
        self.inner.core.plugins().all_metrics()
    }

    /// Shuts every plugin down for all clones. Dropping the last clone does
    /// the same.
    pub fn shutdown(&self) {
        self.inner.core.shutdown();
    }
}

impl std::fmt::Debug for AsyncHttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AsyncHttpClient")
            .field("core", &self.inner.core)
            .finish_non_exhaustive()
    }
}
