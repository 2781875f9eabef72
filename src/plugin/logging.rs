use std::sync::RwLock;

use serde_json::Value;
use tracing::Level;

use super::Plugin;
use crate::error::{BoxError, Error};
use crate::request::{RequestContext, RequestOptions};
use crate::response::HttpResponse;
use crate::util::{read_unpoisoned, redact_uri_for_logs, write_unpoisoned};

macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            Level::TRACE => tracing::trace!($($arg)+),
            Level::DEBUG => tracing::debug!($($arg)+),
            Level::INFO => tracing::info!($($arg)+),
            Level::WARN => tracing::warn!($($arg)+),
            _ => tracing::error!($($arg)+),
        }
    };
}

/// Logs request start, completion and failure through `tracing` at the level
/// given by the `log_level` config key (default `INFO`). Errors are always
/// logged at `WARN` or above.
#[derive(Debug)]
pub struct LoggingPlugin {
    level: RwLock<Level>,
}

impl LoggingPlugin {
    pub const NAME: &'static str = "logging";

    pub fn new() -> Self {
        Self {
            level: RwLock::new(Level::INFO),
        }
    }

    pub fn level(&self) -> Level {
        *read_unpoisoned(&self.level)
    }
}

impl Default for LoggingPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for LoggingPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        0
    }

    fn initialize(&self, config: &Value) -> Result<(), BoxError> {
        let Some(value) = config.get("log_level") else {
            return Ok(());
        };
        let text = value
            .as_str()
            .ok_or_else(|| format!("`log_level` must be a string, got {value}"))?;
        *write_unpoisoned(&self.level) = parse_level(text)?;
        Ok(())
    }

    fn pre_request(
        &self,
        context: &RequestContext,
        _options: &mut RequestOptions,
    ) -> Result<(), BoxError> {
        log_at!(
            self.level(),
            method = %context.method(),
            uri = %redact_uri_for_logs(context.url()),
            host = %context.host(),
            "request started"
        );
        Ok(())
    }

    fn post_request(&self, context: &RequestContext, response: &mut HttpResponse) {
        log_at!(
            self.level(),
            method = %context.method(),
            uri = %redact_uri_for_logs(context.url()),
            status = response.status().as_u16(),
            from_cache = response.is_from_cache(),
            "request completed"
        );
    }

    fn on_error(&self, context: &RequestContext, error: &Error) -> Option<Error> {
        let level = match self.level() {
            Level::ERROR => Level::ERROR,
            _ => Level::WARN,
        };
        log_at!(
            level,
            method = %context.method(),
            uri = %redact_uri_for_logs(context.url()),
            code = error.code().as_str(),
            error = %error,
            "request failed"
        );
        None
    }
}

fn parse_level(text: &str) -> Result<Level, BoxError> {
    match text.to_ascii_uppercase().as_str() {
        "TRACE" => Ok(Level::TRACE),
        "DEBUG" => Ok(Level::DEBUG),
        "INFO" => Ok(Level::INFO),
        "WARN" | "WARNING" => Ok(Level::WARN),
        "ERROR" | "CRITICAL" => Ok(Level::ERROR),
        other => Err(format!("unknown log level `{other}`").into()),
    }
}
