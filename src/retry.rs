use std::collections::BTreeSet;
use std::time::Duration;

use http::StatusCode;

use crate::error::{Error, TransportErrorKind};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Fixed => "fixed",
            Self::Linear => "linear",
            Self::Exponential => "exponential",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff_strategy: BackoffStrategy,
    backoff_factor: f64,
    max_delay: Option<Duration>,
    jitter: bool,
    retry_on_status_codes: BTreeSet<u16>,
    retry_on_transport_errors: BTreeSet<TransportErrorKind>,
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_factor: 0.5,
            max_delay: Some(Duration::from_secs(30)),
            jitter: true,
            retry_on_status_codes: default_retryable_status_codes(),
            retry_on_transport_errors: default_retryable_transport_errors(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            jitter: false,
            ..Self::standard()
        }
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn backoff_strategy(mut self, backoff_strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = backoff_strategy;
        self
    }

    /// Base delay in seconds fed into the backoff strategy.
    pub fn backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn no_max_delay(mut self) -> Self {
        self.max_delay = None;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn retry_on_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retry_on_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retry_on_transport_errors(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retry_on_transport_errors = kinds.into_iter().collect();
        self
    }

    pub fn configured_max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn configured_backoff_strategy(&self) -> BackoffStrategy {
        self.backoff_strategy
    }

    pub fn configured_backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn configured_max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    pub fn jitter_enabled(&self) -> bool {
        self.jitter
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retry_on_status_codes.contains(&status.as_u16())
    }

    pub fn is_retryable_transport_error(&self, kind: TransportErrorKind) -> bool {
        self.retry_on_transport_errors.contains(&kind)
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig {
                field: "retry.max_attempts",
                message: "max_attempts must be >= 1".to_owned(),
            });
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 0.0 {
            return Err(Error::InvalidConfig {
                field: "retry.backoff_factor",
                message: format!(
                    "backoff_factor must be a finite value >= 0, got {}",
                    self.backoff_factor
                ),
            });
        }
        if let Some(code) = self
            .retry_on_status_codes
            .iter()
            .find(|code| StatusCode::from_u16(**code).is_err())
        {
            return Err(Error::InvalidConfig {
                field: "retry.retry_on_status_codes",
                message: format!("{code} is not a valid http status code"),
            });
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [429_u16, 500, 502, 503, 504].into_iter().collect()
}

fn default_retryable_transport_errors() -> BTreeSet<TransportErrorKind> {
    [TransportErrorKind::Connect, TransportErrorKind::Timeout]
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::RetryPolicy;
    use crate::error::{Error, TransportErrorKind};

    #[test]
    fn standard_policy_retries_throttling_and_server_errors() {
        let policy = RetryPolicy::standard();
        assert!(policy.is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(policy.is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!policy.is_retryable_status(StatusCode::NOT_FOUND));
        assert!(policy.is_retryable_transport_error(TransportErrorKind::Connect));
        assert!(policy.is_retryable_transport_error(TransportErrorKind::Timeout));
        assert!(!policy.is_retryable_transport_error(TransportErrorKind::Other));
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        let error = RetryPolicy::standard()
            .max_attempts(0)
            .validate()
            .expect_err("zero attempts must be rejected");
        match error {
            Error::InvalidConfig { field, .. } => assert_eq!(field, "retry.max_attempts"),
            other => panic!("unexpected error variant: {other}"),
        }
    }

    #[test]
    fn negative_or_nan_backoff_factor_is_rejected() {
        assert!(RetryPolicy::standard().backoff_factor(-0.1).validate().is_err());
        assert!(RetryPolicy::standard().backoff_factor(f64::NAN).validate().is_err());
        assert!(RetryPolicy::standard().backoff_factor(0.0).validate().is_ok());
    }

    #[test]
    fn invalid_status_code_is_rejected() {
        assert!(
            RetryPolicy::standard()
                .retry_on_status_codes([42])
                .validate()
                .is_err()
        );
    }
}
