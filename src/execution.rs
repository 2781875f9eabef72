//! Request orchestration shared by the blocking and async clients.
//!
//! [`ClientCore::start`] resolves everything that happens before the first
//! transport call (cache lookup, breaker admission, `pre_request` hooks).
//! Each transport result is then fed to [`ClientCore::complete_attempt`],
//! which either asks the driver to wait and try again or finishes the request.
//! Drivers differ only in how they call the transport and how they wait.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use http::Method;
use serde_json::Value;
use tracing::{Span, debug, info_span, warn};

use crate::backoff::compute_delay;
use crate::cache::{ResponseCache, cache_key, is_cacheable_method};
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitPermit};
use crate::config::{ClientConfig, StatusPolicy};
use crate::error::Error;
use crate::extensions::{Clock, JitterSource};
use crate::metrics::MetricsRegistry;
use crate::plugin::{Plugin, PluginPipeline};
use crate::request::{RequestContext, RequestOptions};
use crate::response::HttpResponse;
use crate::transport::{TransportRequest, TransportResult};
use crate::util::{host_key, merge_headers, parse_request_url, redact_uri_for_logs, truncate_body};

pub(crate) struct ClientCore {
    config: ClientConfig,
    breakers: CircuitBreakerRegistry,
    cache: ResponseCache,
    metrics: MetricsRegistry,
    plugins: PluginPipeline,
    jitter: Arc<dyn JitterSource>,
    clock: Arc<dyn Clock>,
    next_request_id: AtomicU64,
}

pub(crate) enum Start {
    Finished(crate::Result<HttpResponse>),
    Run(RequestRun),
}

pub(crate) enum Step {
    Retry(Duration),
    Finished(crate::Result<HttpResponse>),
}

/// In-flight state of one logical request. Dropping it mid-flight releases
/// its breaker permit without recording an outcome.
pub(crate) struct RequestRun {
    context: RequestContext,
    request: TransportRequest,
    redacted_uri: String,
    permit: Option<CircuitPermit>,
    cache_key: Option<String>,
    cache_ttl: Duration,
    attempt: usize,
    max_attempts: usize,
    started_at: Instant,
    span: Span,
}

impl RequestRun {
    pub(crate) fn request(&self) -> &TransportRequest {
        &self.request
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn attempt(&self) -> usize {
        self.attempt
    }
}

impl ClientCore {
    pub(crate) fn new(
        config: ClientConfig,
        plugins: Vec<(Arc<dyn Plugin>, Value)>,
        jitter: Arc<dyn JitterSource>,
        clock: Arc<dyn Clock>,
    ) -> crate::Result<Self> {
        config.validate()?;
        let core = Self {
            breakers: CircuitBreakerRegistry::with_clock(
                config.circuit_breaker,
                Arc::clone(&clock),
            ),
            cache: ResponseCache::with_clock(config.cache.clone(), Arc::clone(&clock)),
            metrics: MetricsRegistry::new(config.metrics_sample_size),
            plugins: PluginPipeline::new(),
            config,
            jitter,
            clock,
            next_request_id: AtomicU64::new(1),
        };
        for (plugin, plugin_config) in plugins {
            core.plugins.register(plugin, &plugin_config)?;
        }
        Ok(core)
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub(crate) fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub(crate) fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub(crate) fn plugins(&self) -> &PluginPipeline {
        &self.plugins
    }

    pub(crate) fn start(&self, method: Method, url: &str, mut options: RequestOptions) -> Start {
        let parsed = match parse_request_url(url) {
            Ok(parsed) => parsed,
            Err(error) => return Start::Finished(Err(error)),
        };
        let host = host_key(&parsed);
        let redacted_uri = redact_uri_for_logs(parsed.as_str());
        let span = info_span!(
            "reqguard.request",
            method = %method,
            uri = %redacted_uri,
            host = %host
        );
        let entered = span.enter();
        let started_at = self.clock.now();
        let context = RequestContext::new(method.clone(), parsed.to_string(), host.clone())
            .with_id(self.next_request_id.fetch_add(1, Ordering::Relaxed));

        let lookup_key = (self.cache.is_enabled()
            && is_cacheable_method(&method)
            && !options.skips_cache())
        .then(|| cache_key(&method, &parsed, options.params()));
        if let Some(key) = &lookup_key
            && let Some(cached) = self.cache.get(key)
        {
            debug!("serving response from cache");
            self.metrics
                .record_cache_hit(&host, self.elapsed_since(started_at));
            let mut response = cached.mark_from_cache();
            self.plugins.run_post_request(&context, &mut response);
            return Start::Finished(Ok(response));
        }

        let permit = match self.breakers.allow_request(&host) {
            Ok(permit) => permit,
            Err(retry_after) => {
                debug!(
                    retry_after_ms = retry_after.as_millis() as u64,
                    "circuit breaker rejected request"
                );
                let error = Error::CircuitOpen {
                    host: host.clone(),
                    method,
                    uri: redacted_uri,
                    retry_after_ms: retry_after.as_millis(),
                };
                return Start::Finished(Err(self.fail(&context, error, started_at)));
            }
        };

        let params_before_hooks = options.params().to_vec();
        if let Err(error) = self.plugins.run_pre_request(&context, &mut options) {
            self.breakers.settle(permit, false);
            return Start::Finished(Err(self.fail(&context, error, started_at)));
        }
        let lookup_key = lookup_key.filter(|_| {
            let unchanged = options.params() == params_before_hooks.as_slice();
            if !unchanged {
                debug!("pre_request hooks changed the query; response will not be cached");
            }
            unchanged
        });

        let request = TransportRequest {
            method,
            url: parsed.to_string(),
            headers: merge_headers(self.config.http.base_headers(), options.headers()),
            params: options.params().to_vec(),
            body: options.body_bytes().cloned(),
            timeout: options
                .configured_timeout()
                .unwrap_or(self.config.http.configured_default_timeout()),
        };
        let cache_ttl = options
            .configured_cache_ttl()
            .unwrap_or(self.cache.policy().configured_default_ttl());
        drop(entered);

        Start::Run(RequestRun {
            context,
            request,
            redacted_uri,
            permit: Some(permit),
            cache_key: lookup_key,
            cache_ttl,
            attempt: 1,
            max_attempts: self.config.retry.configured_max_attempts(),
            started_at,
            span,
        })
    }

    /// Classifies the result of the current attempt.
    pub(crate) fn complete_attempt(&self, run: &mut RequestRun, result: TransportResult) -> Step {
        let span = run.span.clone();
        let _entered = span.enter();
        let retry_policy = &self.config.retry;
        let attempts_remain = run.attempt < run.max_attempts;

        match result {
            Err(error) => {
                let kind = error.kind();
                if attempts_remain && retry_policy.is_retryable_transport_error(kind) {
                    let delay = self.schedule_retry(run);
                    warn!(
                        attempt = run.attempt - 1,
                        max_attempts = run.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying request after transport error"
                    );
                    return Step::Retry(delay);
                }
                let error = Error::Transport {
                    kind,
                    method: run.context.method().clone(),
                    uri: run.redacted_uri.clone(),
                    source: error.into_source(),
                };
                Step::Finished(self.finish(run, Err(error)))
            }
            Ok(response) => {
                let status = response.status();
                if attempts_remain && retry_policy.is_retryable_status(status) {
                    let delay = self.schedule_retry(run);
                    warn!(
                        attempt = run.attempt - 1,
                        max_attempts = run.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        status = status.as_u16(),
                        "retrying request after retryable status"
                    );
                    return Step::Retry(delay);
                }
                let outcome = if status.is_success()
                    || self.config.http.configured_status_policy() == StatusPolicy::Response
                {
                    Ok(response)
                } else {
                    Err(Error::HttpStatus {
                        status: status.as_u16(),
                        method: run.context.method().clone(),
                        uri: run.redacted_uri.clone(),
                        body: truncate_body(response.body()),
                    })
                };
                Step::Finished(self.finish(run, outcome))
            }
        }
    }

    fn schedule_retry(&self, run: &mut RequestRun) -> Duration {
        if let Some(permit) = &run.permit {
            self.breakers.record_attempt_failure(permit);
        }
        self.metrics.record_retry(run.context.host());
        let delay = compute_delay(run.attempt, &self.config.retry, self.jitter.as_ref());
        run.attempt += 1;
        delay
    }

    fn finish(
        &self,
        run: &mut RequestRun,
        outcome: crate::Result<HttpResponse>,
    ) -> crate::Result<HttpResponse> {
        let breaker_success = match &outcome {
            Ok(response) => !self.counts_as_failure(response),
            Err(_) => false,
        };
        if let Some(permit) = run.permit.take() {
            self.breakers.settle(permit, breaker_success);
        }

        match outcome {
            Ok(mut response) => {
                if let Some(key) = &run.cache_key
                    && self.cache.put(key, &response, run.cache_ttl)
                {
                    debug!("stored response in cache");
                }
                let elapsed = self.elapsed_since(run.started_at);
                self.metrics.record_success(run.context.host(), elapsed);
                debug!(
                    status = response.status().as_u16(),
                    attempts = run.attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "request completed"
                );
                self.plugins.run_post_request(&run.context, &mut response);
                Ok(response)
            }
            Err(error) => Err(self.fail(&run.context, error, run.started_at)),
        }
    }

    /// Responses handed back under `StatusPolicy::Response` still trip the
    /// breaker when the server is failing.
    fn counts_as_failure(&self, response: &HttpResponse) -> bool {
        let status = response.status();
        status.is_server_error() || self.config.retry.is_retryable_status(status)
    }

    fn fail(&self, context: &RequestContext, error: Error, started_at: Instant) -> Error {
        self.metrics
            .record_error(context.host(), &error, self.elapsed_since(started_at));
        debug!(code = error.code().as_str(), error = %error, "request failed");
        self.plugins.run_on_error(context, error)
    }

    fn elapsed_since(&self, started_at: Instant) -> Duration {
        self.clock.now().saturating_duration_since(started_at)
    }

    pub(crate) fn shutdown(&self) {
        self.plugins.shutdown_all();
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        self.plugins.shutdown_all();
    }
}

impl std::fmt::Debug for ClientCore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientCore")
            .field("config", &self.config)
            .field("breakers", &self.breakers)
            .field("cache", &self.cache)
            .field("plugins", &self.plugins)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use http::{HeaderMap, Method, StatusCode};
    use serde_json::Value;

    use super::{ClientCore, Start, Step};
    use crate::config::{ClientConfig, HttpPolicy, StatusPolicy};
    use crate::error::Error;
    use crate::extensions::{SeededJitter, SystemClock};
    use crate::request::RequestOptions;
    use crate::response::HttpResponse;
    use crate::retry::{BackoffStrategy, RetryPolicy};
    use crate::transport::TransportError;

    fn core(config: ClientConfig) -> ClientCore {
        ClientCore::new(
            config,
            Vec::new(),
            Arc::new(SeededJitter::new(7)),
            Arc::new(SystemClock),
        )
        .expect("core should build")
    }

    fn response(status: StatusCode) -> HttpResponse {
        HttpResponse::new(status, HeaderMap::new(), "body")
    }

    #[test]
    fn retryable_status_schedules_retry_then_finishes() {
        let core = core(
            ClientConfig::new().with_retry(
                RetryPolicy::standard()
                    .max_attempts(2)
                    .backoff_strategy(BackoffStrategy::Fixed)
                    .backoff_factor(0.25)
                    .jitter(false),
            ),
        );
        let Start::Run(mut run) = core.start(
            Method::GET,
            "https://api.test/items",
            RequestOptions::new(),
        ) else {
            panic!("request should reach the transport");
        };

        match core.complete_attempt(&mut run, Ok(response(StatusCode::SERVICE_UNAVAILABLE))) {
            Step::Retry(delay) => assert_eq!(delay, Duration::from_millis(250)),
            Step::Finished(_) => panic!("first 503 should be retried"),
        }
        assert_eq!(run.attempt(), 2);

        match core.complete_attempt(&mut run, Ok(response(StatusCode::SERVICE_UNAVAILABLE))) {
            Step::Finished(Err(Error::HttpStatus { status, .. })) => assert_eq!(status, 503),
            Step::Finished(other) => panic!("unexpected result: {other:?}"),
            Step::Retry(_) => panic!("attempts are exhausted"),
        }
        let snapshot = core.metrics().snapshot();
        assert_eq!(snapshot.summary.total_retries, 1);
        assert_eq!(snapshot.summary.total_errors, 1);
    }

    #[test]
    fn non_retryable_transport_error_finishes_immediately() {
        let core = core(ClientConfig::new());
        let Start::Run(mut run) =
            core.start(Method::GET, "https://api.test/", RequestOptions::new())
        else {
            panic!("request should reach the transport");
        };
        match core.complete_attempt(&mut run, Err(TransportError::other("reset"))) {
            Step::Finished(Err(error)) => {
                assert_eq!(error.transport_error_kind(), Some(crate::TransportErrorKind::Other))
            }
            Step::Finished(Ok(_)) => panic!("transport error should fail"),
            Step::Retry(_) => panic!("other transport errors are not retried"),
        }
    }

    #[test]
    fn response_policy_returns_error_statuses() {
        let core = core(
            ClientConfig::new()
                .with_retry(RetryPolicy::disabled())
                .with_http(HttpPolicy::standard().status_policy(StatusPolicy::Response)),
        );
        let Start::Run(mut run) =
            core.start(Method::GET, "https://api.test/", RequestOptions::new())
        else {
            panic!("request should reach the transport");
        };
        match core.complete_attempt(&mut run, Ok(response(StatusCode::NOT_FOUND))) {
            Step::Finished(Ok(response)) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
            Step::Finished(Err(error)) => panic!("unexpected error variant: {error}"),
            Step::Retry(_) => panic!("retries are disabled"),
        }
    }

    #[test]
    fn invalid_url_is_rejected_before_any_state_changes() {
        let core = core(ClientConfig::new());
        match core.start(Method::GET, "not a url", RequestOptions::new()) {
            Start::Finished(Err(Error::InvalidUri { uri })) => assert_eq!(uri, "not a url"),
            Start::Finished(other) => panic!("unexpected result: {other:?}"),
            Start::Run(_) => panic!("invalid url must not reach the transport"),
        }
        assert!(core.metrics().snapshot().hosts.is_empty());
    }

    #[test]
    fn request_carries_merged_headers_and_timeout() {
        let core = core(
            ClientConfig::new().with_http(
                HttpPolicy::standard()
                    .try_base_header("x-client", "reqguard")
                    .expect("valid header")
                    .try_base_header("x-env", "base")
                    .expect("valid header")
                    .default_timeout(Duration::from_secs(5)),
            ),
        );
        let options = RequestOptions::new()
            .try_header("x-env", "request")
            .expect("valid header")
            .query_pair("page", "2");
        let Start::Run(run) = core.start(Method::POST, "https://api.test/items", options) else {
            panic!("request should reach the transport");
        };
        let request = run.request();
        assert_eq!(request.headers["x-client"], "reqguard");
        assert_eq!(request.headers["x-env"], "request");
        assert_eq!(request.timeout, Duration::from_secs(5));
        assert_eq!(request.params, [("page".to_owned(), "2".to_owned())]);
        assert_eq!(request.url, "https://api.test/items");
    }

    #[test]
    fn plugin_registration_errors_fail_construction() {
        let result = ClientCore::new(
            ClientConfig::new(),
            vec![
                (
                    Arc::new(crate::plugin::LoggingPlugin::new()) as Arc<dyn crate::plugin::Plugin>,
                    Value::Null,
                ),
                (
                    Arc::new(crate::plugin::LoggingPlugin::new()) as Arc<dyn crate::plugin::Plugin>,
                    Value::Null,
                ),
            ],
            Arc::new(SeededJitter::new(1)),
            Arc::new(SystemClock),
        );
        assert!(matches!(result, Err(Error::PluginRegistration { .. })));
    }
}
