//! Request lifecycle hooks.
//!
//! A [`Plugin`] observes or rewrites requests before the first attempt,
//! annotates successful responses and may substitute errors. Plugins run in
//! ascending [`Plugin::priority`] order; plugins with equal priority run in
//! registration order.

mod logging;
mod metrics;
mod pipeline;
mod rate_limit;

pub use logging::LoggingPlugin;
pub use metrics::MetricsPlugin;
pub use pipeline::PluginPipeline;
pub use rate_limit::{RateLimitExceeded, RateLimitPlugin};

use serde_json::Value;

use crate::error::{BoxError, Error};
use crate::request::{RequestContext, RequestOptions};
use crate::response::HttpResponse;

pub trait Plugin: Send + Sync {
    /// Unique within one pipeline.
    fn name(&self) -> &str;

    /// Lower values run earlier.
    fn priority(&self) -> i32;

    /// Called once at registration, before the plugin can see any request.
    fn initialize(&self, _config: &Value) -> Result<(), BoxError> {
        Ok(())
    }

    /// Returning `Err` aborts the request without calling the transport.
    fn pre_request(
        &self,
        _context: &RequestContext,
        _options: &mut RequestOptions,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    fn post_request(&self, _context: &RequestContext, _response: &mut HttpResponse) {}

    /// The first plugin returning a replacement wins; later plugins are skipped.
    fn on_error(&self, _context: &RequestContext, _error: &Error) -> Option<Error> {
        None
    }

    /// Called at most once per registration, whether or not `initialize` ran.
    fn shutdown(&self) {}

    fn metrics(&self) -> Option<Value> {
        None
    }
}

pub(crate) fn config_u64(config: &Value, key: &str, default: u64) -> Result<u64, BoxError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .ok_or_else(|| format!("`{key}` must be a non-negative integer, got {value}").into()),
    }
}
