//! Time-bounded negative cache of endpoints that recently failed.
//!
//! Each entry maps an endpoint to the monotonic time at which it may be tried
//! again. Entries at or past that time are logically absent even before they
//! are physically removed. The lookup path is lock-free; cleanup happens in
//! occasional sweeps that at most one thread runs at a time.
//!
//! # Renewal
//!
//! A caller that finds a past-due entry claims it with [`FailedEndpointCache::try_renew`],
//! an atomic compare-and-remove on the exact timestamp it observed. When two
//! callers race, one removes the entry and the other sees its timestamp no
//! longer matches, re-reads, and finds the cleared state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::clock::{Clock, MonotonicClock};
use crate::config::FailedEndpointConfig;
use crate::endpoint::{Endpoint, EndpointKey};

/// Counters for the failed-endpoint cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailedCacheStats {
    /// Calls to `mark_failed`.
    pub failures_recorded: u64,
    /// Entries removed by a successful `try_renew`.
    pub renewals: u64,
    /// Sweeps that ran.
    pub sweeps: u64,
    /// Past-due entries removed by sweeps.
    pub entries_swept: u64,
    /// Entries at snapshot time.
    pub entries: usize,
}

/// Shared memory of endpoints that recently failed.
pub struct FailedEndpointCache {
    entries: DashMap<EndpointKey, u64>,
    clock: Arc<dyn Clock>,
    config: FailedEndpointConfig,
    last_sweep: AtomicU64,
    sweeping: AtomicBool,
    failures_recorded: AtomicU64,
    renewals: AtomicU64,
    sweeps: AtomicU64,
    entries_swept: AtomicU64,
}

impl FailedEndpointCache {
    /// Creates an empty cache reading time from `clock`.
    pub fn new(config: FailedEndpointConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            entries: DashMap::new(),
            clock,
            config,
            last_sweep: AtomicU64::new(now),
            sweeping: AtomicBool::new(false),
            failures_recorded: AtomicU64::new(0),
            renewals: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
            entries_swept: AtomicU64::new(0),
        }
    }

    /// When `endpoint` becomes usable again, or `None` if it is usable now.
    ///
    /// A past-due entry is cleared on the way out. If another caller changes
    /// the entry first, whatever it left recorded is returned as is.
    pub fn renew_ticks(&self, endpoint: &Endpoint) -> Option<u64> {
        let renew_at = self.recorded(endpoint.key())?;
        let now = self.clock.now_millis();
        if renew_at > now {
            return Some(renew_at);
        }

        if self.try_renew(endpoint, renew_at) {
            return None;
        }

        // Lost the race to a concurrent renew or failure; report what is there now.
        self.recorded(endpoint.key())
    }

    /// Records a failure, making `endpoint` unusable for the configured cooldown.
    pub fn mark_failed(&self, endpoint: &Endpoint) {
        let now = self.clock.now_millis();
        let renew_at = now.saturating_add(self.config.cooldown_ms);
        self.entries.insert(endpoint.key().clone(), renew_at);
        self.failures_recorded.fetch_add(1, Ordering::Relaxed);
        debug!(endpoint = %endpoint, renew_at, "endpoint marked failed");

        self.sweep_if_due(now);
    }

    /// Removes the entry for `endpoint` only if it still records `expected`.
    pub fn try_renew(&self, endpoint: &Endpoint, expected: u64) -> bool {
        let renewed = self
            .entries
            .remove_if(endpoint.key(), |_, renew_at| *renew_at == expected)
            .is_some();
        if renewed {
            self.renewals.fetch_add(1, Ordering::Relaxed);
            trace!(endpoint = %endpoint, expected, "failed endpoint renewed");
        }
        renewed
    }

    /// True if `endpoint` is currently inside its cooldown.
    pub fn is_failed(&self, endpoint: &Endpoint) -> bool {
        self.recorded(endpoint.key())
            .is_some_and(|renew_at| renew_at > self.clock.now_millis())
    }

    /// Physical entry count, including past-due entries not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no endpoint is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets every failure.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// The tuning this cache was built with.
    pub fn config(&self) -> &FailedEndpointConfig {
        &self.config
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> FailedCacheStats {
        FailedCacheStats {
            failures_recorded: self.failures_recorded.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            entries_swept: self.entries_swept.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    fn recorded(&self, key: &EndpointKey) -> Option<u64> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    fn sweep_if_due(&self, now: u64) {
        if self.entries.len() <= self.config.sweep_threshold {
            return;
        }
        let last = self.last_sweep.load(Ordering::Acquire);
        if now.saturating_sub(last) <= self.config.sweep_interval_ms {
            return;
        }
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // Another sweeper may have finished between the checks above and the claim.
        if self.last_sweep.load(Ordering::Acquire) == last {
            let before = self.entries.len();
            self.entries.retain(|_, renew_at| *renew_at > now);
            let swept = before.saturating_sub(self.entries.len()) as u64;

            self.last_sweep.store(now, Ordering::Release);
            self.sweeps.fetch_add(1, Ordering::Relaxed);
            self.entries_swept.fetch_add(swept, Ordering::Relaxed);
            debug!(swept, remaining = self.entries.len(), "swept failed endpoints");
        }

        self.sweeping.store(false, Ordering::Release);
    }
}

impl Default for FailedEndpointCache {
    fn default() -> Self {
        Self::new(
            FailedEndpointConfig::default(),
            Arc::new(MonotonicClock::new()),
        )
    }
}

impl std::fmt::Debug for FailedEndpointCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailedEndpointCache")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::thread;
    use std::time::Duration;

    const MINUTE: Duration = Duration::from_secs(60);

    fn cache_with_clock() -> (FailedEndpointCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = FailedEndpointCache::new(FailedEndpointConfig::default(), clock.clone());
        (cache, clock)
    }

    fn ep(s: &str) -> Endpoint {
        Endpoint::parse(s).unwrap()
    }

    #[test]
    fn test_unknown_endpoint_is_usable() {
        let (cache, _) = cache_with_clock();
        assert_eq!(cache.renew_ticks(&ep("http://p1:8080")), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_failed_endpoint_blocked_for_cooldown() {
        let (cache, clock) = cache_with_clock();
        let p1 = ep("http://p1:8080");
        cache.mark_failed(&p1);

        assert_eq!(cache.renew_ticks(&p1), Some(1_000 + 30 * 60 * 1000));
        assert!(cache.is_failed(&p1));

        clock.advance(29 * MINUTE);
        assert!(cache.renew_ticks(&p1).is_some());

        clock.advance(MINUTE);
        assert_eq!(cache.renew_ticks(&p1), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().renewals, 1);
    }

    #[test]
    fn test_mark_failed_overwrites() {
        let (cache, clock) = cache_with_clock();
        let p1 = ep("http://p1:8080");
        cache.mark_failed(&p1);
        clock.advance(10 * MINUTE);
        cache.mark_failed(&p1);
        assert_eq!(cache.renew_ticks(&p1), Some(1_000 + 40 * 60 * 1000));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_try_renew_requires_exact_timestamp() {
        let (cache, _) = cache_with_clock();
        let p1 = ep("http://p1:8080");
        cache.mark_failed(&p1);
        let renew_at = cache.renew_ticks(&p1).unwrap();

        assert!(!cache.try_renew(&p1, renew_at - 1));
        assert!(cache.try_renew(&p1, renew_at));
        assert!(!cache.try_renew(&p1, renew_at));
        assert_eq!(cache.renew_ticks(&p1), None);
    }

    #[test]
    fn test_try_renew_contention_single_winner() {
        let (cache, _) = cache_with_clock();
        let cache = Arc::new(cache);
        let p1 = ep("http://p1:8080");
        cache.mark_failed(&p1);
        let renew_at = cache.renew_ticks(&p1).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let p1 = p1.clone();
                thread::spawn(move || cache.try_renew(&p1, renew_at))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(cache.renew_ticks(&p1), None);
    }

    #[test]
    fn test_renew_ticks_contention_renews_once() {
        let (cache, clock) = cache_with_clock();
        let cache = Arc::new(cache);
        let p1 = ep("http://p1:8080");
        cache.mark_failed(&p1);
        clock.advance(31 * MINUTE);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let p1 = p1.clone();
                thread::spawn(move || cache.renew_ticks(&p1))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), None);
        }
        assert_eq!(cache.stats().renewals, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_endpoint_identity_ignores_path() {
        let (cache, _) = cache_with_clock();
        cache.mark_failed(&ep("http://p1:8080/a"));
        assert!(cache.is_failed(&ep("http://P1:8080/b")));
        assert!(!cache.is_failed(&ep("http://p1:8081")));
    }

    #[test]
    fn test_sweep_requires_threshold_and_interval() {
        let (cache, clock) = cache_with_clock();
        for i in 0..9 {
            cache.mark_failed(&ep(&format!("http://p{i}:8080")));
        }
        // Over threshold but interval not elapsed.
        assert_eq!(cache.stats().sweeps, 0);

        clock.advance(31 * MINUTE);
        cache.mark_failed(&ep("http://fresh:8080"));
        let stats = cache.stats();
        assert_eq!(stats.sweeps, 1);
        assert_eq!(stats.entries_swept, 9);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_no_sweep_below_threshold() {
        let (cache, clock) = cache_with_clock();
        for i in 0..8 {
            cache.mark_failed(&ep(&format!("http://p{i}:8080")));
        }
        clock.advance(60 * MINUTE);
        cache.mark_failed(&ep("http://p0:8080"));
        assert_eq!(cache.stats().sweeps, 0);
        assert_eq!(cache.len(), 8);
    }
}
