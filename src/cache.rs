//! Bounded response cache with lazy TTL expiry and LRU eviction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http::{Method, StatusCode};
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::extensions::{Clock, SystemClock};
use crate::response::HttpResponse;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachePolicy {
    enabled: bool,
    max_size: usize,
    default_ttl: Duration,
    cacheable_status_codes: Option<BTreeSet<u16>>,
}

impl CachePolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_size: 1000,
            default_ttl: Duration::from_secs(300),
            cacheable_status_codes: None,
        }
    }

    pub fn standard() -> Self {
        Self {
            enabled: true,
            ..Self::disabled()
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn default_ttl(mut self, default_ttl: Duration) -> Self {
        self.default_ttl = default_ttl;
        self
    }

    /// Replaces the default "any 2xx" rule with an explicit status allow-list.
    pub fn cacheable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.cacheable_status_codes = Some(codes.into_iter().collect());
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn configured_max_size(&self) -> usize {
        self.max_size
    }

    pub fn configured_default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn is_cacheable_status(&self, status: StatusCode) -> bool {
        match &self.cacheable_status_codes {
            Some(codes) => codes.contains(&status.as_u16()),
            None => status.is_success(),
        }
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_size == 0 {
            return Err(Error::InvalidConfig {
                field: "cache.max_size",
                message: "max_size must be >= 1 when caching is enabled".to_owned(),
            });
        }
        if self.default_ttl.is_zero() {
            return Err(Error::InvalidConfig {
                field: "cache.default_ttl",
                message: "default_ttl must be greater than zero".to_owned(),
            });
        }
        Ok(())
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

pub fn is_cacheable_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD)
}

/// Normalized request identity: upper-case method, the url as parsed (scheme
/// and host lower-cased, fragment dropped) and every query pair, from the url
/// and from `params`, sorted.
pub fn cache_key(method: &Method, url: &Url, params: &[(String, String)]) -> String {
    let mut pairs = url
        .query_pairs()
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .chain(params.iter().cloned())
        .collect::<Vec<_>>();
    pairs.sort();

    let mut base = url.clone();
    base.set_query(None);
    base.set_fragment(None);

    let mut key = format!("{} {}", method.as_str().to_ascii_uppercase(), base);
    if !pairs.is_empty() {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in &pairs {
            serializer.append_pair(name, value);
        }
        key.push('?');
        key.push_str(&serializer.finish());
    }
    key
}

#[derive(Debug)]
struct CacheEntry {
    response: HttpResponse,
    inserted_at: Instant,
    ttl: Duration,
    recency: u64,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        match self.inserted_at.checked_add(self.ttl) {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: BTreeMap<String, CacheEntry>,
    by_recency: BTreeMap<u64, String>,
    next_recency: u64,
}

impl CacheState {
    fn touch(&mut self, key: &str) {
        let recency = self.next_recency;
        self.next_recency = self.next_recency.wrapping_add(1);
        if let Some(entry) = self.entries.get_mut(key) {
            self.by_recency.remove(&entry.recency);
            entry.recency = recency;
            self.by_recency.insert(recency, key.to_owned());
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.by_recency.remove(&entry.recency);
        Some(entry)
    }

    fn evict_least_recently_used(&mut self) -> Option<String> {
        let (_, key) = self.by_recency.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// One short-held lock guards the entry map and recency index together so
/// eviction order stays exact; it is never held across a transport call.
pub struct ResponseCache {
    policy: CachePolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
}

impl ResponseCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: CachePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.is_enabled()
    }

    pub fn get(&self, key: &str) -> Option<HttpResponse> {
        if !self.policy.is_enabled() {
            return None;
        }
        let now = self.clock.now();
        let mut state = lock_unpoisoned(&self.state);
        let live = state.entries.get(key)?.is_live(now);
        if !live {
            state.remove(key);
            debug!(key, "cache entry expired");
            return None;
        }
        state.touch(key);
        state.entries.get(key).map(|entry| entry.response.clone())
    }

    /// Stores a snapshot of `response` when caching is enabled and its status
    /// is cacheable. Returns whether the entry was stored.
    pub fn put(&self, key: &str, response: &HttpResponse, ttl: Duration) -> bool {
        if !self.policy.is_enabled()
            || ttl.is_zero()
            || !self.policy.is_cacheable_status(response.status())
        {
            return false;
        }
        let max_size = self.policy.configured_max_size().max(1);
        let now = self.clock.now();
        let mut state = lock_unpoisoned(&self.state);
        state.remove(key);
        while state.entries.len() >= max_size {
            match state.evict_least_recently_used() {
                Some(evicted) => debug!(key = %evicted, "evicted least recently used cache entry"),
                None => break,
            }
        }
        let recency = state.next_recency;
        state.next_recency = state.next_recency.wrapping_add(1);
        state.entries.insert(
            key.to_owned(),
            CacheEntry {
                response: response.clone(),
                inserted_at: now,
                ttl,
                recency,
            },
        );
        state.by_recency.insert(recency, key.to_owned());
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        lock_unpoisoned(&self.state).remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.entries.clear();
        state.by_recency.clear();
    }

    /// Number of stored entries, including expired ones not yet touched.
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ResponseCache")
            .field("policy", &self.policy)
            .field("len", &self.len())
            .finish()
    }
}
