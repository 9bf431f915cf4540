//! In-memory counting backend.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::{CountingBackend, Strategy};
use super::counter::{MovingWindow, WindowCounter};
use super::item::RateLimitItem;
use crate::error::Result;

/// Storage option naming how many counters are held before expired ones are purged.
pub const OPTION_PURGE_THRESHOLD: &str = "purge_threshold";

const DEFAULT_PURGE_THRESHOLD: usize = 10_000;

/// A process-local counting backend.
///
/// This struct is thread-safe and can be shared across multiple tasks. Each
/// hit holds the counter's map entry while it is updated.
///
/// Expired counters and emptied moving windows are purged when a new key is
/// inserted, the backend holds at least `purge_threshold` entries and at
/// least one of them is known to have expired.
pub struct MemoryBackend {
    strategy: Strategy,
    /// Fixed window counters indexed by storage key
    counters: DashMap<String, WindowCounter>,
    /// Moving window logs indexed by storage key
    windows: DashMap<String, MovingWindow>,
    purge_threshold: usize,
    /// Earliest instant at which some entry may have expired
    next_expiry: Mutex<Option<Instant>>,
}

impl MemoryBackend {
    /// Create a new in-memory backend using `strategy`.
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            counters: DashMap::new(),
            windows: DashMap::new(),
            purge_threshold: DEFAULT_PURGE_THRESHOLD,
            next_expiry: Mutex::new(None),
        }
    }

    /// Create a backend from storage options.
    ///
    /// Unknown options are ignored.
    pub fn with_options(strategy: Strategy, options: &HashMap<String, String>) -> Self {
        let mut backend = Self::new(strategy);
        for (name, value) in options {
            match (name.as_str(), value.parse::<usize>()) {
                (OPTION_PURGE_THRESHOLD, Ok(threshold)) => backend.purge_threshold = threshold,
                _ => debug!(option = %name, value = %value, "Ignoring memory storage option"),
            }
        }
        backend
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Hits currently recorded for `key` within `scope` under `limit`.
    pub fn get_count(&self, limit: &RateLimitItem, key: &str, scope: &str) -> u64 {
        let storage_key = limit.counter_key(key, scope);
        match self.strategy {
            Strategy::MovingWindow => self
                .windows
                .get_mut(&storage_key)
                .map(|mut w| w.current_count())
                .unwrap_or(0),
            _ => self
                .counters
                .get(&storage_key)
                .map(|c| c.current_count())
                .unwrap_or(0),
        }
    }

    /// Number of live counters.
    pub fn counter_count(&self) -> usize {
        self.counters.len() + self.windows.len()
    }

    /// Note a newly inserted entry expiring at `expires_at` and purge if due.
    ///
    /// Must not be called while holding a map entry.
    fn inserted(&self, expires_at: Instant) {
        let mut next_expiry = self.next_expiry.lock();
        let due = next_expiry.map_or(expires_at, |next| next.min(expires_at));
        *next_expiry = Some(due);

        if due <= Instant::now() && self.counter_count() >= self.purge_threshold {
            *next_expiry = self.purge_expired();
        }
    }

    /// Drop expired counters and empty moving windows.
    ///
    /// Returns the earliest expiry among the entries that remain.
    fn purge_expired(&self) -> Option<Instant> {
        let before = self.counter_count();
        let mut next: Option<Instant> = None;
        let mut track = |expires_at: Instant| {
            next = Some(next.map_or(expires_at, |n| n.min(expires_at)));
        };

        self.counters.retain(|_, counter| {
            if counter.is_expired() {
                return false;
            }
            track(counter.expires_at());
            true
        });
        self.windows.retain(|_, window| match window.expires_at() {
            Some(expires_at) => {
                track(expires_at);
                true
            }
            None => false,
        });

        trace!(
            removed = before.saturating_sub(self.counter_count()),
            "Purged expired counters"
        );
        next
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Strategy::default())
    }
}

#[async_trait]
impl CountingBackend for MemoryBackend {
    async fn hit(&self, limit: &RateLimitItem, key: &str, scope: &str) -> Result<bool> {
        let storage_key = limit.counter_key(key, scope);
        let period = limit.period();

        // The entry guard is dropped before any purge runs.
        let (allowed, inserted) = match self.strategy {
            Strategy::MovingWindow => match self.windows.entry(storage_key) {
                Entry::Occupied(mut entry) => (entry.get_mut().acquire(limit.amount), None),
                Entry::Vacant(entry) => {
                    let mut window = entry.insert(MovingWindow::new(period));
                    let allowed = window.acquire(limit.amount);
                    (allowed, window.expires_at())
                }
            },
            Strategy::FixedWindow | Strategy::FixedWindowElasticExpiry => {
                let elastic = self.strategy == Strategy::FixedWindowElasticExpiry;
                match self.counters.entry(storage_key) {
                    Entry::Occupied(mut entry) => {
                        (entry.get_mut().increment(limit.amount, period, elastic), None)
                    }
                    Entry::Vacant(entry) => {
                        let mut counter = entry.insert(WindowCounter::new(period));
                        let allowed = counter.increment(limit.amount, period, elastic);
                        (allowed, Some(counter.expires_at()))
                    }
                }
            }
        };

        if let Some(expires_at) = inserted {
            self.inserted(expires_at);
        }
        Ok(allowed)
    }

    async fn reset(&self) -> Result<()> {
        self.counters.clear();
        self.windows.clear();
        *self.next_expiry.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn limit(text: &str) -> RateLimitItem {
        text.parse().unwrap()
    }

    #[tokio::test]
    async fn test_backend_creation() {
        let backend = MemoryBackend::default();
        assert_eq!(backend.strategy(), Strategy::FixedWindow);
        assert_eq!(backend.counter_count(), 0);
    }

    #[tokio::test]
    async fn test_fixed_window_hit() {
        let backend = MemoryBackend::new(Strategy::FixedWindow);
        let item = limit("2/minute");

        assert!(backend.hit(&item, "a", "scope").await.unwrap());
        assert!(backend.hit(&item, "a", "scope").await.unwrap());
        assert!(!backend.hit(&item, "a", "scope").await.unwrap());
        assert_eq!(backend.get_count(&item, "a", "scope"), 3);
    }

    #[tokio::test]
    async fn test_keys_and_scopes_are_independent() {
        let backend = MemoryBackend::new(Strategy::FixedWindow);
        let item = limit("1/minute");

        assert!(backend.hit(&item, "a", "one").await.unwrap());
        assert!(backend.hit(&item, "b", "one").await.unwrap());
        assert!(backend.hit(&item, "a", "two").await.unwrap());
        assert!(!backend.hit(&item, "a", "one").await.unwrap());
        assert_eq!(backend.counter_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_expires() {
        let backend = MemoryBackend::new(Strategy::FixedWindow);
        let item = limit("1/second");

        assert!(backend.hit(&item, "a", "s").await.unwrap());
        assert!(!backend.hit(&item, "a", "s").await.unwrap());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(backend.hit(&item, "a", "s").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_moving_window_strategy() {
        let backend = MemoryBackend::new(Strategy::MovingWindow);
        let item = limit("1/second");

        assert!(backend.hit(&item, "a", "s").await.unwrap());
        assert!(!backend.hit(&item, "a", "s").await.unwrap());
        assert_eq!(backend.get_count(&item, "a", "s"), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(backend.hit(&item, "a", "s").await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_clears_counters() {
        let backend = MemoryBackend::new(Strategy::FixedWindow);
        let item = limit("1/hour");

        backend.hit(&item, "a", "s").await.unwrap();
        assert_eq!(backend.counter_count(), 1);

        backend.reset().await.unwrap();
        assert_eq!(backend.counter_count(), 0);
        assert!(backend.hit(&item, "a", "s").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_threshold_option() {
        let mut options = HashMap::new();
        options.insert(OPTION_PURGE_THRESHOLD.to_string(), "2".to_string());
        options.insert("unrelated".to_string(), "x".to_string());
        let backend = MemoryBackend::with_options(Strategy::FixedWindow, &options);
        let item = limit("1/second");

        backend.hit(&item, "a", "s").await.unwrap();
        backend.hit(&item, "b", "s").await.unwrap();
        assert_eq!(backend.counter_count(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        backend.hit(&item, "c", "s").await.unwrap();
        assert_eq!(backend.counter_count(), 1);
    }

    fn with_threshold(strategy: Strategy, threshold: usize) -> MemoryBackend {
        let mut options = HashMap::new();
        options.insert(OPTION_PURGE_THRESHOLD.to_string(), threshold.to_string());
        MemoryBackend::with_options(strategy, &options)
    }

    #[tokio::test(start_paused = true)]
    async fn test_moving_windows_are_purged() {
        let backend = with_threshold(Strategy::MovingWindow, 2);
        let item = limit("1/minute");

        for i in 0..1000 {
            backend.hit(&item, &format!("client-{}", i), "s").await.unwrap();
        }
        assert_eq!(backend.counter_count(), 1000);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(backend.hit(&item, "late", "s").await.unwrap());
        assert_eq!(backend.counter_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_runs_on_insert_once_due() {
        let backend = with_threshold(Strategy::FixedWindow, 2);
        let short = limit("1/second");
        let long = limit("5/minute");
        let start = Instant::now();

        backend.hit(&short, "a", "s").await.unwrap();
        backend.hit(&long, "b", "s").await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        // Hits on existing keys never purge.
        backend.hit(&long, "b", "s").await.unwrap();
        assert_eq!(backend.counter_count(), 2);

        backend.hit(&long, "c", "s").await.unwrap();
        assert_eq!(backend.counter_count(), 2);
        assert_eq!(*backend.next_expiry.lock(), Some(start + Duration::from_secs(60)));

        // Everything is live, so the next insert only records its expiry.
        backend.hit(&long, "d", "s").await.unwrap();
        assert_eq!(backend.counter_count(), 3);
        assert_eq!(*backend.next_expiry.lock(), Some(start + Duration::from_secs(60)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_hits_on_one_key() {
        for strategy in [Strategy::FixedWindow, Strategy::MovingWindow] {
            let backend = Arc::new(MemoryBackend::new(strategy));
            let item = limit("100/hour");

            let tasks: Vec<_> = (0..250)
                .map(|_| {
                    let backend = backend.clone();
                    tokio::spawn(async move { backend.hit(&item, "shared", "s").await.unwrap() })
                })
                .collect();

            let mut allowed = 0;
            for task in tasks {
                if task.await.unwrap() {
                    allowed += 1;
                }
            }
            assert_eq!(allowed, 100, "strategy {}", strategy);
            assert_eq!(backend.counter_count(), 1);
        }
    }
}
