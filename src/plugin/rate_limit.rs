use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use thiserror::Error as ThisError;

use super::{Plugin, config_u64};
use crate::error::BoxError;
use crate::extensions::{Clock, SystemClock};
use crate::request::{RequestContext, RequestOptions};
use crate::util::lock_unpoisoned;

const DEFAULT_MAX_REQUESTS: u64 = 100;
const DEFAULT_WINDOW_SECONDS: u64 = 60;

/// Returned from `pre_request` when the window is full; surfaces to callers as
/// the source of a `PluginAbort` error.
#[derive(Debug, ThisError)]
#[error("rate limit of {max_requests} requests per {window:?} exceeded")]
pub struct RateLimitExceeded {
    pub max_requests: usize,
    pub window: Duration,
}

#[derive(Debug)]
struct WindowState {
    max_requests: usize,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl WindowState {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.admitted.front() {
            if now.saturating_duration_since(*oldest) < self.window {
                break;
            }
            self.admitted.pop_front();
        }
    }
}

/// Client-side sliding-window limiter. Admits at most `max_requests` requests
/// in any `window_seconds` span and aborts the rest before they reach the
/// transport.
pub struct RateLimitPlugin {
    clock: Arc<dyn Clock>,
    state: Mutex<WindowState>,
    rejected: AtomicU64,
}

impl RateLimitPlugin {
    pub const NAME: &'static str = "rate_limit";

    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(WindowState {
                max_requests: DEFAULT_MAX_REQUESTS as usize,
                window: Duration::from_secs(DEFAULT_WINDOW_SECONDS),
                admitted: VecDeque::new(),
            }),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn requests_in_window(&self) -> usize {
        let mut state = lock_unpoisoned(&self.state);
        state.prune(self.clock.now());
        state.admitted.len()
    }
}

impl Default for RateLimitPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitPlugin {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_unpoisoned(&self.state);
        formatter
            .debug_struct("RateLimitPlugin")
            .field("max_requests", &state.max_requests)
            .field("window", &state.window)
            .field("admitted", &state.admitted.len())
            .finish()
    }
}

impl Plugin for RateLimitPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        1
    }

    fn initialize(&self, config: &Value) -> Result<(), BoxError> {
        let max_requests = config_u64(config, "max_requests", DEFAULT_MAX_REQUESTS)?;
        let window_seconds = config_u64(config, "window_seconds", DEFAULT_WINDOW_SECONDS)?;
        if max_requests == 0 {
            return Err("`max_requests` must be at least 1".into());
        }
        if window_seconds == 0 {
            return Err("`window_seconds` must be at least 1".into());
        }
        let mut state = lock_unpoisoned(&self.state);
        state.max_requests = usize::try_from(max_requests).unwrap_or(usize::MAX);
        state.window = Duration::from_secs(window_seconds);
        Ok(())
    }

    fn pre_request(
        &self,
        _context: &RequestContext,
        _options: &mut RequestOptions,
    ) -> Result<(), BoxError> {
        let now = self.clock.now();
        let mut state = lock_unpoisoned(&self.state);
        state.prune(now);
        if state.admitted.len() >= state.max_requests {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Box::new(RateLimitExceeded {
                max_requests: state.max_requests,
                window: state.window,
            }));
        }
        state.admitted.push_back(now);
        Ok(())
    }

    fn metrics(&self) -> Option<Value> {
        let now = self.clock.now();
        let mut state = lock_unpoisoned(&self.state);
        state.prune(now);
        Some(json!({
            "rate_limit_metrics": {
                "requests_in_window": state.admitted.len(),
                "max_requests": state.max_requests,
                "window_seconds": state.window.as_secs(),
                "rejected_requests": self.rejected.load(Ordering::Relaxed),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use http::Method;
    use serde_json::json;

    use super::{RateLimitExceeded, RateLimitPlugin};
    use crate::extensions::Clock;
    use crate::plugin::Plugin;
    use crate::request::{RequestContext, RequestOptions};

    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn advance(&self, by: Duration) {
            *self.now.lock().expect("clock lock") += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().expect("clock lock")
        }
    }

    fn context() -> RequestContext {
        RequestContext::new(
            Method::GET,
            "https://api.test/".to_owned(),
            "api.test".to_owned(),
        )
    }

    #[test]
    fn window_admits_then_rejects_then_recovers() {
        let clock = Arc::new(ManualClock {
            now: Mutex::new(Instant::now()),
        });
        let plugin = RateLimitPlugin::with_clock(clock.clone());
        plugin
            .initialize(&json!({ "max_requests": 2, "window_seconds": 10 }))
            .expect("config should parse");

        let mut options = RequestOptions::new();
        plugin
            .pre_request(&context(), &mut options)
            .expect("first request admitted");
        clock.advance(Duration::from_secs(4));
        plugin
            .pre_request(&context(), &mut options)
            .expect("second request admitted");

        let error = plugin
            .pre_request(&context(), &mut options)
            .expect_err("third request rejected");
        assert!(error.downcast_ref::<RateLimitExceeded>().is_some());
        assert_eq!(plugin.requests_in_window(), 2);

        clock.advance(Duration::from_secs(6));
        assert_eq!(plugin.requests_in_window(), 1);
        plugin
            .pre_request(&context(), &mut options)
            .expect("slot freed after the window slides");

        let metrics = plugin.metrics().expect("rate limiter reports metrics");
        assert_eq!(metrics["rate_limit_metrics"]["requests_in_window"], 2);
        assert_eq!(metrics["rate_limit_metrics"]["rejected_requests"], 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let plugin = RateLimitPlugin::new();
        assert!(plugin.initialize(&json!({ "max_requests": 0 })).is_err());
        assert!(plugin.initialize(&json!({ "window_seconds": "soon" })).is_err());
    }
}
