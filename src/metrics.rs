use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::error::Error;
use crate::util::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};

pub const DEFAULT_SAMPLE_SIZE: usize = 100;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub summary: MetricsSummary,
    /// Keyed `host_<host>`.
    pub hosts: BTreeMap<String, HostMetricsSnapshot>,
}

impl MetricsSnapshot {
    pub fn host(&self, host: &str) -> Option<&HostMetricsSnapshot> {
        self.hosts.get(&format!("host_{host}"))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub total_errors: u64,
    pub total_cache_hits: u64,
    pub total_retries: u64,
    pub success_rate_percent: f64,
    pub average_duration_seconds: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HostMetricsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub retries: u64,
    pub success_rate_percent: f64,
    /// Mean of the retained duration samples, in seconds.
    pub average_duration: f64,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Debug)]
struct HostMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    retries: AtomicU64,
    durations: Mutex<VecDeque<Duration>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

impl HostMetrics {
    fn new(sample_size: usize) -> Self {
        Self {
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            durations: Mutex::new(VecDeque::with_capacity(sample_size)),
            error_counts: Mutex::new(BTreeMap::new()),
        }
    }

    fn push_duration(&self, sample_size: usize, duration: Duration) {
        let mut durations = lock_unpoisoned(&self.durations);
        while durations.len() >= sample_size {
            durations.pop_front();
        }
        durations.push_back(duration);
    }

    fn snapshot(&self) -> (HostMetricsSnapshot, Duration, usize) {
        let requests = self.requests.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let (total, samples) = {
            let durations = lock_unpoisoned(&self.durations);
            (durations.iter().sum::<Duration>(), durations.len())
        };
        let snapshot = HostMetricsSnapshot {
            requests,
            errors,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            success_rate_percent: success_rate_percent(requests, errors),
            average_duration: average_seconds(total, samples),
            error_counts: lock_unpoisoned(&self.error_counts).clone(),
        };
        (snapshot, total, samples)
    }
}

/// Per-host request accounting owned by one client.
#[derive(Debug)]
pub struct MetricsRegistry {
    sample_size: usize,
    hosts: RwLock<BTreeMap<String, Arc<HostMetrics>>>,
}

impl MetricsRegistry {
    pub fn new(sample_size: usize) -> Self {
        Self {
            sample_size: sample_size.max(1),
            hosts: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn record_success(&self, host: &str, duration: Duration) {
        let metrics = self.host_metrics(host);
        metrics.requests.fetch_add(1, Ordering::Relaxed);
        metrics.push_duration(self.sample_size, duration);
    }

    pub fn record_error(&self, host: &str, error: &Error, duration: Duration) {
        let metrics = self.host_metrics(host);
        metrics.requests.fetch_add(1, Ordering::Relaxed);
        metrics.errors.fetch_add(1, Ordering::Relaxed);
        metrics.push_duration(self.sample_size, duration);
        let key = match error {
            Error::Transport { kind, .. } => format!("transport:{kind}"),
            Error::HttpStatus { status, .. } => format!("http_status:{status}"),
            other => other.code().as_str().to_owned(),
        };
        *lock_unpoisoned(&metrics.error_counts).entry(key).or_insert(0) += 1;
    }

    /// A response served from the cache counts as a successful request.
    pub fn record_cache_hit(&self, host: &str, duration: Duration) {
        let metrics = self.host_metrics(host);
        metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
        metrics.requests.fetch_add(1, Ordering::Relaxed);
        metrics.push_duration(self.sample_size, duration);
    }

    pub fn record_retry(&self, host: &str) {
        self.host_metrics(host)
            .retries
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hosts = read_unpoisoned(&self.hosts)
            .iter()
            .map(|(host, metrics)| (host.clone(), Arc::clone(metrics)))
            .collect::<Vec<_>>();

        let mut summary = MetricsSummary::default();
        let mut total_duration = Duration::ZERO;
        let mut total_samples = 0_usize;
        let mut snapshots = BTreeMap::new();
        for (host, metrics) in hosts {
            let (snapshot, duration, samples) = metrics.snapshot();
            summary.total_requests += snapshot.requests;
            summary.total_errors += snapshot.errors;
            summary.total_cache_hits += snapshot.cache_hits;
            summary.total_retries += snapshot.retries;
            total_duration += duration;
            total_samples += samples;
            snapshots.insert(format!("host_{host}"), snapshot);
        }
        summary.success_rate_percent =
            success_rate_percent(summary.total_requests, summary.total_errors);
        summary.average_duration_seconds = average_seconds(total_duration, total_samples);

        MetricsSnapshot {
            summary,
            hosts: snapshots,
        }
    }

    pub fn reset(&self) {
        write_unpoisoned(&self.hosts).clear();
    }

    fn host_metrics(&self, host: &str) -> Arc<HostMetrics> {
        if let Some(metrics) = read_unpoisoned(&self.hosts).get(host) {
            return Arc::clone(metrics);
        }
        let mut hosts = write_unpoisoned(&self.hosts);
        let metrics = hosts
            .entry(host.to_owned())
            .or_insert_with(|| Arc::new(HostMetrics::new(self.sample_size)));
        Arc::clone(metrics)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_SIZE)
    }
}

fn success_rate_percent(requests: u64, errors: u64) -> f64 {
    if requests == 0 {
        return 0.0;
    }
    requests.saturating_sub(errors) as f64 / requests as f64 * 100.0
}

fn average_seconds(total: Duration, samples: usize) -> f64 {
    if samples == 0 {
        return 0.0;
    }
    total.as_secs_f64() / samples as f64
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use http::Method;

    use super::MetricsRegistry;
    use crate::error::{Error, TransportErrorKind};

    fn transport_error() -> Error {
        Error::Transport {
            kind: TransportErrorKind::Connect,
            method: Method::GET,
            uri: "https://a.test/".to_owned(),
            source: "refused".into(),
        }
    }

    #[test]
    fn empty_registry_reports_zeroes() {
        let snapshot = MetricsRegistry::default().snapshot();
        assert_eq!(snapshot.summary.total_requests, 0);
        assert_eq!(snapshot.summary.success_rate_percent, 0.0);
        assert_eq!(snapshot.summary.average_duration_seconds, 0.0);
        assert!(snapshot.hosts.is_empty());
    }

    #[test]
    fn success_rate_and_average_duration_per_host() {
        let metrics = MetricsRegistry::new(10);
        metrics.record_success("a.test", Duration::from_millis(100));
        metrics.record_success("a.test", Duration::from_millis(300));
        metrics.record_success("a.test", Duration::from_millis(200));
        metrics.record_error("a.test", &transport_error(), Duration::from_millis(400));

        let snapshot = metrics.snapshot();
        let host = snapshot.host("a.test").expect("host metrics exist");
        assert_eq!(host.requests, 4);
        assert_eq!(host.errors, 1);
        assert_eq!(host.success_rate_percent, 75.0);
        assert!((host.average_duration - 0.25).abs() < 1e-9);
        assert_eq!(host.error_counts.get("transport:connect"), Some(&1));
        assert!(snapshot.hosts.contains_key("host_a.test"));
    }

    #[test]
    fn duration_samples_are_bounded_to_most_recent() {
        let metrics = MetricsRegistry::new(2);
        metrics.record_success("a.test", Duration::from_secs(10));
        metrics.record_success("a.test", Duration::from_secs(1));
        metrics.record_success("a.test", Duration::from_secs(3));

        let snapshot = metrics.snapshot();
        let host = snapshot.host("a.test").expect("host metrics exist");
        assert_eq!(host.requests, 3);
        assert!((host.average_duration - 2.0).abs() < 1e-9);
    }

    #[test]
    fn summary_aggregates_hosts() {
        let metrics = MetricsRegistry::default();
        metrics.record_success("a.test", Duration::from_secs(1));
        metrics.record_cache_hit("b.test", Duration::from_secs(0));
        metrics.record_retry("b.test");
        metrics.record_error("b.test", &transport_error(), Duration::from_secs(2));

        let summary = metrics.snapshot().summary;
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.total_errors, 1);
        assert_eq!(summary.total_cache_hits, 1);
        assert_eq!(summary.total_retries, 1);
        assert!((summary.average_duration_seconds - 1.0).abs() < 1e-9);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let metrics = Arc::new(MetricsRegistry::new(16));
        let handles = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..500 {
                        metrics.record_success("shared.test", Duration::from_millis(1));
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("worker thread should finish");
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.summary.total_requests, 4_000);
    }

    #[test]
    fn snapshot_serializes_to_expected_shape() {
        let metrics = MetricsRegistry::default();
        metrics.record_success("a.test", Duration::from_millis(500));
        let value = serde_json::to_value(metrics.snapshot()).expect("snapshot serializes");
        assert_eq!(value["summary"]["total_requests"], 1);
        assert_eq!(value["hosts"]["host_a.test"]["requests"], 1);
        assert_eq!(value["hosts"]["host_a.test"]["average_duration"], 0.5);
    }
}
