//! Per-host circuit breakers.
//!
//! ```text
//! Closed   -> Open      consecutive_failures reaches failure_threshold
//! Open     -> HalfOpen  first request after recovery_timeout (admitted as a trial)
//! HalfOpen -> Closed    consecutive_successes reaches success_threshold
//! HalfOpen -> Open      any failure
//! ```
//!
//! Every transition bumps the breaker's generation. A permit remembers the
//! generation it was issued in, and its outcome is ignored once the breaker
//! has moved on, so a request admitted before the breaker opened can never
//! count as a half-open trial.
//!
//! Each host owns its own lock. The registry map is only locked to look up or
//! lazily insert a host's breaker, never while a request is in flight.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::extensions::{Clock, SystemClock};
use crate::util::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitBreakerPolicy {
    failure_threshold: usize,
    recovery_timeout: Duration,
    success_threshold: usize,
    half_open_max_requests: Option<usize>,
}

impl CircuitBreakerPolicy {
    pub const fn standard() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 1,
            half_open_max_requests: None,
        }
    }

    pub const fn failure_threshold(mut self, failure_threshold: usize) -> Self {
        self.failure_threshold = failure_threshold;
        self
    }

    pub const fn recovery_timeout(mut self, recovery_timeout: Duration) -> Self {
        self.recovery_timeout = recovery_timeout;
        self
    }

    pub const fn success_threshold(mut self, success_threshold: usize) -> Self {
        self.success_threshold = success_threshold;
        self
    }

    /// Concurrent trial requests admitted while half-open. Defaults to
    /// `success_threshold`.
    pub const fn half_open_max_requests(mut self, half_open_max_requests: usize) -> Self {
        self.half_open_max_requests = Some(half_open_max_requests);
        self
    }

    pub const fn configured_failure_threshold(self) -> usize {
        self.failure_threshold
    }

    pub const fn configured_recovery_timeout(self) -> Duration {
        self.recovery_timeout
    }

    pub const fn configured_success_threshold(self) -> usize {
        self.success_threshold
    }

    pub fn configured_half_open_max_requests(self) -> usize {
        self.half_open_max_requests
            .unwrap_or(self.success_threshold)
            .max(1)
    }

    pub(crate) fn validate(self) -> crate::Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::InvalidConfig {
                field: "circuit_breaker.failure_threshold",
                message: "failure_threshold must be >= 1".to_owned(),
            });
        }
        if self.success_threshold == 0 {
            return Err(Error::InvalidConfig {
                field: "circuit_breaker.success_threshold",
                message: "success_threshold must be >= 1".to_owned(),
            });
        }
        if self.half_open_max_requests == Some(0) {
            return Err(Error::InvalidConfig {
                field: "circuit_breaker.half_open_max_requests",
                message: "half_open_max_requests must be >= 1".to_owned(),
            });
        }
        Ok(())
    }
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        };
        formatter.write_str(text)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    last_transition_at: Instant,
    trials_in_flight: usize,
    generation: u64,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        self.last_transition_at = now;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.trials_in_flight = 0;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Who reports an outcome: a permit issued in `generation` (and whether it
/// holds a trial slot), or a direct call through the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reporter {
    Permit { generation: u64, trial: bool },
    Direct,
}

#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    host: String,
    policy: CircuitBreakerPolicy,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    fn new(host: String, policy: CircuitBreakerPolicy, now: Instant) -> Self {
        Self {
            host,
            policy,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_transition_at: now,
                trials_in_flight: 0,
                generation: 0,
            }),
        }
    }

    fn state(&self) -> CircuitState {
        lock_unpoisoned(&self.state).state
    }

    fn try_acquire(self: &Arc<Self>, now: Instant) -> Result<CircuitPermit, Duration> {
        let mut state = lock_unpoisoned(&self.state);
        match state.state {
            CircuitState::Closed => Ok(CircuitPermit::new(
                Arc::clone(self),
                state.generation,
                false,
            )),
            CircuitState::Open => {
                let elapsed = now.saturating_duration_since(state.last_transition_at);
                let recovery_timeout = self.policy.configured_recovery_timeout();
                if elapsed < recovery_timeout {
                    return Err(recovery_timeout - elapsed);
                }
                state.transition(CircuitState::HalfOpen, now);
                state.trials_in_flight = 1;
                info!(host = %self.host, "circuit breaker half-open; admitting trial request");
                Ok(CircuitPermit::new(Arc::clone(self), state.generation, true))
            }
            CircuitState::HalfOpen => {
                if state.trials_in_flight >= self.policy.configured_half_open_max_requests() {
                    return Err(Duration::ZERO);
                }
                state.trials_in_flight = state.trials_in_flight.saturating_add(1);
                Ok(CircuitPermit::new(Arc::clone(self), state.generation, true))
            }
        }
    }

    fn record_success(&self, now: Instant, reporter: Reporter) {
        let mut state = lock_unpoisoned(&self.state);
        if !self.accepts(&state, reporter) {
            return;
        }
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                if let Reporter::Permit { trial: true, .. } = reporter {
                    state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
                }
                state.consecutive_successes = state.consecutive_successes.saturating_add(1);
                if state.consecutive_successes >= self.policy.configured_success_threshold() {
                    state.transition(CircuitState::Closed, now);
                    info!(host = %self.host, "circuit breaker closed after successful trials");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, now: Instant, reporter: Reporter) {
        let mut state = lock_unpoisoned(&self.state);
        if !self.accepts(&state, reporter) {
            return;
        }
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.consecutive_failures >= self.policy.configured_failure_threshold() {
                    warn!(
                        host = %self.host,
                        consecutive_failures = state.consecutive_failures,
                        "circuit breaker opened"
                    );
                    state.transition(CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(host = %self.host, "circuit breaker trial failed; reopening");
                state.transition(CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
    }

    fn accepts(&self, state: &BreakerState, reporter: Reporter) -> bool {
        match reporter {
            Reporter::Direct => true,
            Reporter::Permit { generation, .. } if generation == state.generation => true,
            Reporter::Permit { generation, trial } => {
                debug!(
                    host = %self.host,
                    permit_generation = generation,
                    current_generation = state.generation,
                    trial,
                    "ignoring outcome of a permit issued before the last transition"
                );
                false
            }
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut state = lock_unpoisoned(&self.state);
        if state.state == CircuitState::HalfOpen && state.generation == generation {
            state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
        }
    }
}

/// Admission ticket handed out by [`CircuitBreakerRegistry::allow_request`].
///
/// Dropping a permit without recording an outcome gives back a held half-open
/// trial slot and counts nothing.
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CircuitPermit {
    fn new(breaker: Arc<CircuitBreaker>, generation: u64, trial: bool) -> Self {
        Self {
            breaker,
            generation,
            trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    fn reporter(&self) -> Reporter {
        Reporter::Permit {
            generation: self.generation,
            trial: self.trial,
        }
    }

    pub fn host(&self) -> &str {
        &self.breaker.host
    }
}

impl std::fmt::Debug for CircuitPermit {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CircuitPermit")
            .field("host", &self.breaker.host)
            .field("generation", &self.generation)
            .field("trial", &self.trial)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}

pub struct CircuitBreakerRegistry {
    policy: CircuitBreakerPolicy,
    clock: Arc<dyn Clock>,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(policy: CircuitBreakerPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: CircuitBreakerPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            breakers: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn policy(&self) -> CircuitBreakerPolicy {
        self.policy
    }

    /// Admits or rejects a request to `host`. On rejection the error carries
    /// the time left until the breaker will consider a trial request.
    pub fn allow_request(&self, host: &str) -> Result<CircuitPermit, Duration> {
        let breaker = self.breaker_for(host);
        breaker.try_acquire(self.clock.now())
    }

    /// Applies a success to the host's current state, whatever admitted it.
    pub fn record_success(&self, host: &str) {
        self.breaker_for(host)
            .record_success(self.clock.now(), Reporter::Direct);
    }

    /// Applies a failure to the host's current state, whatever admitted it.
    pub fn record_failure(&self, host: &str) {
        self.breaker_for(host)
            .record_failure(self.clock.now(), Reporter::Direct);
    }

    /// Records a failed attempt of a request that will be retried. The permit
    /// stays open for the final outcome.
    pub fn record_attempt_failure(&self, permit: &CircuitPermit) {
        permit
            .breaker
            .record_failure(self.clock.now(), permit.reporter());
    }

    /// Records the final outcome carried by `permit`. Outcomes of permits
    /// issued before the breaker's last transition are ignored.
    pub fn settle(&self, mut permit: CircuitPermit, success: bool) {
        permit.settled = true;
        let now = self.clock.now();
        if success {
            permit.breaker.record_success(now, permit.reporter());
        } else {
            permit.breaker.record_failure(now, permit.reporter());
        }
    }

    /// Current state without triggering any transition. Hosts never seen are
    /// reported as closed.
    pub fn state(&self, host: &str) -> CircuitState {
        read_unpoisoned(&self.breakers)
            .get(host)
            .map(|breaker| breaker.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        read_unpoisoned(&self.breakers)
            .iter()
            .map(|(host, breaker)| (host.clone(), breaker.state()))
            .collect()
    }

    pub fn reset(&self, host: &str) {
        write_unpoisoned(&self.breakers).remove(host);
    }

    pub fn reset_all(&self) {
        write_unpoisoned(&self.breakers).clear();
    }

    fn breaker_for(&self, host: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = read_unpoisoned(&self.breakers).get(host) {
            return Arc::clone(breaker);
        }
        let mut breakers = write_unpoisoned(&self.breakers);
        let breaker = breakers.entry(host.to_owned()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                host.to_owned(),
                self.policy,
                self.clock.now(),
            ))
        });
        Arc::clone(breaker)
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CircuitBreakerRegistry")
            .field("policy", &self.policy)
            .field("states", &self.states())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{CircuitBreakerPolicy, CircuitBreakerRegistry, CircuitState};
    use crate::extensions::Clock;

    struct ManualClock {
        origin: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                origin: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            })
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock().expect("lock clock") += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.origin + *self.offset.lock().expect("lock clock")
        }
    }

    fn registry(policy: CircuitBreakerPolicy) -> (CircuitBreakerRegistry, Arc<ManualClock>) {
        let clock = ManualClock::new();
        (
            CircuitBreakerRegistry::with_clock(policy, clock.clone()),
            clock,
        )
    }

    #[test]
    fn opens_only_when_consecutive_failures_reach_threshold() {
        let (breakers, _clock) =
            registry(CircuitBreakerPolicy::standard().failure_threshold(3));

        breakers.record_failure("a.test");
        breakers.record_failure("a.test");
        assert_eq!(breakers.state("a.test"), CircuitState::Closed);

        breakers.record_success("a.test");
        breakers.record_failure("a.test");
        breakers.record_failure("a.test");
        assert_eq!(
            breakers.state("a.test"),
            CircuitState::Closed,
            "a success must reset the consecutive failure count"
        );

        breakers.record_failure("a.test");
        assert_eq!(breakers.state("a.test"), CircuitState::Open);
        assert!(breakers.allow_request("a.test").is_err());
    }

    #[test]
    fn open_breaker_reports_remaining_recovery_time() {
        let (breakers, clock) = registry(
            CircuitBreakerPolicy::standard()
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(10)),
        );
        breakers.record_failure("a.test");
        clock.advance(Duration::from_secs(4));

        let retry_after = breakers
            .allow_request("a.test")
            .expect_err("breaker should still be open");
        assert_eq!(retry_after, Duration::from_secs(6));
    }

    #[test]
    fn moves_to_half_open_only_after_recovery_timeout() {
        let (breakers, clock) = registry(
            CircuitBreakerPolicy::standard()
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(5)),
        );
        breakers.record_failure("a.test");
        clock.advance(Duration::from_millis(4_999));
        assert!(breakers.allow_request("a.test").is_err());
        assert_eq!(breakers.state("a.test"), CircuitState::Open);

        clock.advance(Duration::from_millis(1));
        let permit = breakers
            .allow_request("a.test")
            .expect("trial request should be admitted");
        assert!(permit.is_trial());
        assert_eq!(breakers.state("a.test"), CircuitState::HalfOpen);
        breakers.settle(permit, true);
        assert_eq!(breakers.state("a.test"), CircuitState::Closed);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let (breakers, clock) = registry(
            CircuitBreakerPolicy::standard()
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(1))
                .success_threshold(2),
        );
        breakers.record_failure("a.test");
        clock.advance(Duration::from_secs(1));

        let first = breakers.allow_request("a.test").expect("first trial");
        let second = breakers.allow_request("a.test").expect("second trial");
        assert!(
            breakers.allow_request("a.test").is_err(),
            "trial admission is limited to success_threshold by default"
        );

        breakers.settle(first, true);
        assert_eq!(breakers.state("a.test"), CircuitState::HalfOpen);
        breakers.settle(second, true);
        assert_eq!(breakers.state("a.test"), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_and_restarts_recovery_timer() {
        let (breakers, clock) = registry(
            CircuitBreakerPolicy::standard()
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(2)),
        );
        breakers.record_failure("a.test");
        clock.advance(Duration::from_secs(2));

        let trial = breakers.allow_request("a.test").expect("trial request");
        clock.advance(Duration::from_secs(1));
        breakers.settle(trial, false);
        assert_eq!(breakers.state("a.test"), CircuitState::Open);

        clock.advance(Duration::from_secs(1));
        assert_eq!(
            breakers.allow_request("a.test").expect_err("timer restarted"),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn dropped_trial_permit_releases_its_slot() {
        let (breakers, clock) = registry(
            CircuitBreakerPolicy::standard()
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(1))
                .half_open_max_requests(1),
        );
        breakers.record_failure("a.test");
        clock.advance(Duration::from_secs(1));

        let trial = breakers.allow_request("a.test").expect("trial request");
        assert!(breakers.allow_request("a.test").is_err());
        drop(trial);

        assert_eq!(breakers.state("a.test"), CircuitState::HalfOpen);
        let retry = breakers
            .allow_request("a.test")
            .expect("released slot should admit another trial");
        breakers.settle(retry, true);
        assert_eq!(breakers.state("a.test"), CircuitState::Closed);
    }

    #[test]
    fn success_admitted_before_opening_does_not_close_half_open_breaker() {
        let (breakers, clock) = registry(
            CircuitBreakerPolicy::standard()
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(1)),
        );
        let slow = breakers.allow_request("a.test").expect("closed admits");
        breakers.record_failure("a.test");
        clock.advance(Duration::from_secs(1));
        let trial = breakers.allow_request("a.test").expect("trial request");

        breakers.settle(slow, true);
        assert_eq!(
            breakers.state("a.test"),
            CircuitState::HalfOpen,
            "only the trial may close the breaker"
        );

        breakers.settle(trial, true);
        assert_eq!(breakers.state("a.test"), CircuitState::Closed);
    }

    #[test]
    fn outcome_admitted_before_opening_does_not_free_a_trial_slot() {
        let (breakers, clock) = registry(
            CircuitBreakerPolicy::standard()
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(1))
                .success_threshold(2)
                .half_open_max_requests(1),
        );
        let slow = breakers.allow_request("a.test").expect("closed admits");
        breakers.record_failure("a.test");
        clock.advance(Duration::from_secs(1));
        let _trial = breakers.allow_request("a.test").expect("trial request");

        breakers.settle(slow, true);
        assert!(
            breakers.allow_request("a.test").is_err(),
            "half_open_max_requests must still hold"
        );
    }

    #[test]
    fn failure_admitted_before_opening_does_not_reopen_half_open_breaker() {
        let (breakers, clock) = registry(
            CircuitBreakerPolicy::standard()
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(1)),
        );
        let slow = breakers.allow_request("a.test").expect("closed admits");
        breakers.record_failure("a.test");
        clock.advance(Duration::from_secs(1));
        let trial = breakers.allow_request("a.test").expect("trial request");

        breakers.record_attempt_failure(&slow);
        breakers.settle(slow, false);
        assert_eq!(breakers.state("a.test"), CircuitState::HalfOpen);
        breakers.settle(trial, true);
        assert_eq!(breakers.state("a.test"), CircuitState::Closed);
    }

    #[test]
    fn hosts_are_isolated_and_resettable() {
        let (breakers, _clock) =
            registry(CircuitBreakerPolicy::standard().failure_threshold(1));
        breakers.record_failure("a.test");
        assert_eq!(breakers.state("a.test"), CircuitState::Open);
        assert_eq!(breakers.state("b.test"), CircuitState::Closed);
        assert!(breakers.allow_request("b.test").is_ok());

        breakers.reset("a.test");
        assert_eq!(breakers.state("a.test"), CircuitState::Closed);
        assert!(breakers.allow_request("a.test").is_ok());
    }

    #[test]
    fn concurrent_failures_open_shared_breaker() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerPolicy::standard()
                .failure_threshold(50)
                .recovery_timeout(Duration::from_secs(60)),
        ));
        let handles = (0..8)
            .map(|_| {
                let breakers = Arc::clone(&breakers);
                thread::spawn(move || {
                    for _ in 0..25 {
                        breakers.record_failure("shared.test");
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("worker thread should finish");
        }
        assert_eq!(breakers.state("shared.test"), CircuitState::Open);
        assert_eq!(breakers.state("other.test"), CircuitState::Closed);
    }
}
