//! `reqguard` wraps an outbound request transport with retry and backoff, a
//! per-host circuit breaker, an optional response cache and a plugin pipeline.
//!
//! The network itself is supplied by the caller as a [`Transport`] (blocking)
//! or [`AsyncTransport`] (tokio) implementation.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use reqguard::prelude::{
//!     BackoffStrategy, HttpClient, HttpResponse, RequestOptions, RetryPolicy, TransportRequest,
//!     TransportResult,
//! };
//!
//! fn send(request: &TransportRequest) -> TransportResult {
//!     // Hand the request to a real HTTP stack here.
//!     let _ = request;
//!     Ok(HttpResponse::new(http::StatusCode::OK, http::HeaderMap::new(), "{}"))
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpClient::builder(Arc::new(send))
//!         .retry_policy(
//!             RetryPolicy::standard()
//!                 .max_attempts(4)
//!                 .backoff_strategy(BackoffStrategy::Exponential)
//!                 .backoff_factor(0.2)
//!                 .max_delay(Duration::from_secs(5)),
//!         )
//!         .try_build()?;
//!
//!     let response = client.get("https://api.example.com/v1/items", RequestOptions::new())?;
//!     println!("status={}", response.status());
//!     Ok(())
//! }
//! ```
//!
//! # Request Lifecycle
//!
//! 1. A live cache entry for a `GET`/`HEAD` request is returned directly, even
//!    while the host's breaker is open.
//! 2. An open breaker rejects the request with [`Error::CircuitOpen`].
//! 3. `pre_request` hooks may rewrite the request or abort it.
//! 4. Attempts run until success, a non-retryable outcome or `max_attempts`.
//! 5. The final outcome updates the breaker, cache and metrics, then runs the
//!    `post_request` or `on_error` hooks.

pub mod backoff;
mod builder;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
mod error;
mod execution;
pub mod extensions;
pub mod metrics;
pub mod plugin;
mod request;
mod response;
pub mod retry;
pub mod transport;
mod util;

#[cfg(feature = "async")]
mod async_client;
#[cfg(feature = "blocking")]
mod blocking_client;

#[cfg(feature = "async")]
pub use crate::async_client::{AsyncHttpClient, AsyncHttpClientBuilder};
#[cfg(feature = "blocking")]
pub use crate::blocking_client::{HttpClient, HttpClientBuilder};
pub use crate::builder::ClientBuilder;
pub use crate::cache::{CachePolicy, ResponseCache};
pub use crate::circuit_breaker::{
    CircuitBreakerPolicy, CircuitBreakerRegistry, CircuitPermit, CircuitState,
};
pub use crate::config::{ClientConfig, HttpPolicy, StatusPolicy};
pub use crate::error::{BoxError, Error, ErrorCode, TransportErrorKind};
pub use crate::extensions::{Clock, JitterSource, SeededJitter, SystemClock, ThreadRngJitter};
pub use crate::metrics::{HostMetricsSnapshot, MetricsRegistry, MetricsSnapshot, MetricsSummary};
pub use crate::plugin::{LoggingPlugin, MetricsPlugin, Plugin, PluginPipeline, RateLimitPlugin};
pub use crate::request::{RequestContext, RequestOptions};
pub use crate::response::HttpResponse;
pub use crate::retry::{BackoffStrategy, RetryPolicy};
pub use crate::transport::{
    AsyncTransport, Transport, TransportError, TransportFuture, TransportRequest, TransportResult,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    #[cfg(feature = "async")]
    pub use crate::AsyncHttpClient;
    #[cfg(feature = "blocking")]
    pub use crate::HttpClient;
    pub use crate::{
        AsyncTransport, BackoffStrategy, CachePolicy, CircuitBreakerPolicy, CircuitState,
        ClientConfig, Error, ErrorCode, HttpPolicy, HttpResponse, MetricsSnapshot, Plugin,
        RequestContext, RequestOptions, RetryPolicy, StatusPolicy, Transport, TransportError,
        TransportErrorKind, TransportFuture, TransportRequest, TransportResult,
    };
}
