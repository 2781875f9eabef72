use std::time::Duration;

use crate::extensions::JitterSource;
use crate::retry::{BackoffStrategy, RetryPolicy};

/// Delay to wait after `attempt` (1-based) failed, before the next attempt.
pub fn compute_delay(attempt: usize, policy: &RetryPolicy, jitter: &dyn JitterSource) -> Duration {
    let raw = raw_delay(attempt, policy);
    if !policy.jitter_enabled() || raw.is_zero() {
        return raw;
    }
    let factor = jitter.jitter_factor().clamp(0.5, 1.5);
    seconds_to_duration(raw.as_secs_f64() * factor)
}

/// Delay before jitter, capped by the policy's `max_delay`.
pub fn raw_delay(attempt: usize, policy: &RetryPolicy) -> Duration {
    let attempt = attempt.max(1);
    let factor = policy.configured_backoff_factor();
    let seconds = match policy.configured_backoff_strategy() {
        BackoffStrategy::Fixed => factor,
        BackoffStrategy::Linear => factor * attempt as f64,
        BackoffStrategy::Exponential => {
            let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
            factor * 2_f64.powi(exponent)
        }
    };
    let delay = seconds_to_duration(seconds);
    match policy.configured_max_delay() {
        Some(max_delay) => delay.min(max_delay),
        None => delay,
    }
}

fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}
