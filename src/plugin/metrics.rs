use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use super::{Plugin, config_u64};
use crate::error::{BoxError, Error};
use crate::extensions::{Clock, SystemClock};
use crate::request::{RequestContext, RequestOptions};
use crate::response::HttpResponse;
use crate::util::lock_unpoisoned;

const DEFAULT_MAX_RESPONSE_TIMES: u64 = 1000;
const DEFAULT_MAX_IN_FLIGHT: u64 = 10_000;

#[derive(Debug, Default)]
struct Counters {
    max_response_times: usize,
    max_in_flight: usize,
    requests: u64,
    responses: u64,
    errors: u64,
    status_codes: BTreeMap<u16, u64>,
    error_codes: BTreeMap<&'static str, u64>,
    response_times: VecDeque<Duration>,
    started: BTreeMap<u64, Instant>,
}

impl Counters {
    fn start(&mut self, request_id: u64, now: Instant) {
        self.started.insert(request_id, now);
        // Requests whose hooks never finish (cancelled, or an earlier plugin
        // replaced the error) are dropped oldest first.
        while self.started.len() > self.max_in_flight {
            self.started.pop_first();
        }
    }

    fn finish(&mut self, request_id: u64, now: Instant) {
        let Some(start) = self.started.remove(&request_id) else {
            return;
        };
        while self.response_times.len() >= self.max_response_times {
            self.response_times.pop_front();
        }
        self.response_times
            .push_back(now.saturating_duration_since(start));
    }
}

/// Counts requests seen by the pipeline, responses per status and errors per
/// code, and keeps the most recent `max_response_times` response times.
///
/// Response times are measured from `pre_request` to the `post_request` or
/// `on_error` of the same request. Cache hits skip `pre_request` and record no
/// time. At most `max_in_flight` unfinished requests are tracked.
pub struct MetricsPlugin {
    clock: Arc<dyn Clock>,
    counters: Mutex<Counters>,
}

impl MetricsPlugin {
    pub const NAME: &'static str = "metrics";

    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            counters: Mutex::new(Counters {
                max_response_times: DEFAULT_MAX_RESPONSE_TIMES as usize,
                max_in_flight: DEFAULT_MAX_IN_FLIGHT as usize,
                ..Counters::default()
            }),
        }
    }
}

impl Default for MetricsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsPlugin {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MetricsPlugin")
            .field("counters", &*lock_unpoisoned(&self.counters))
            .finish()
    }
}

impl Plugin for MetricsPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        10
    }

    fn initialize(&self, config: &Value) -> Result<(), BoxError> {
        let max_response_times =
            config_u64(config, "max_response_times", DEFAULT_MAX_RESPONSE_TIMES)?;
        if max_response_times == 0 {
            return Err("`max_response_times` must be at least 1".into());
        }
        let max_in_flight = config_u64(config, "max_in_flight", DEFAULT_MAX_IN_FLIGHT)?;
        if max_in_flight == 0 {
            return Err("`max_in_flight` must be at least 1".into());
        }
        let mut counters = lock_unpoisoned(&self.counters);
        counters.max_response_times = usize::try_from(max_response_times).unwrap_or(usize::MAX);
        counters.max_in_flight = usize::try_from(max_in_flight).unwrap_or(usize::MAX);
        Ok(())
    }

    fn pre_request(
        &self,
        context: &RequestContext,
        _options: &mut RequestOptions,
    ) -> Result<(), BoxError> {
        let now = self.clock.now();
        let mut counters = lock_unpoisoned(&self.counters);
        counters.requests += 1;
        counters.start(context.id(), now);
        Ok(())
    }

    fn post_request(&self, context: &RequestContext, response: &mut HttpResponse) {
        let now = self.clock.now();
        let mut counters = lock_unpoisoned(&self.counters);
        counters.responses += 1;
        *counters
            .status_codes
            .entry(response.status().as_u16())
            .or_insert(0) += 1;
        counters.finish(context.id(), now);
    }

    fn on_error(&self, context: &RequestContext, error: &Error) -> Option<Error> {
        let now = self.clock.now();
        let mut counters = lock_unpoisoned(&self.counters);
        counters.errors += 1;
        *counters
            .error_codes
            .entry(error.code().as_str())
            .or_insert(0) += 1;
        counters.finish(context.id(), now);
        None
    }

    fn metrics(&self) -> Option<Value> {
        let counters = lock_unpoisoned(&self.counters);
        let average = if counters.response_times.is_empty() {
            0.0
        } else {
            counters
                .response_times
                .iter()
                .map(Duration::as_secs_f64)
                .sum::<f64>()
                / counters.response_times.len() as f64
        };
        let status_codes = counters
            .status_codes
            .iter()
            .map(|(status, count)| (status.to_string(), json!(count)))
            .collect::<serde_json::Map<_, _>>();
        Some(json!({
            "request_metrics": {
                "total_requests": counters.requests,
                "total_responses": counters.responses,
                "total_errors": counters.errors,
                "status_codes": status_codes,
                "error_codes": counters.error_codes,
                "average_response_time": average,
                "recorded_response_times": counters.response_times.len(),
                "in_flight_requests": counters.started.len(),
            }
        }))
    }
}
