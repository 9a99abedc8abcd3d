//! Per-client bucket registry.

use lru::LruCache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::bucket::TokenBucket;
use super::clock::Clock;
use crate::error::Result;

/// Default cap on tracked client keys.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;
/// Largest cap accepted from configuration.
pub const MAX_ENTRIES_LIMIT: usize = 1_000_000;

/// What happens when a new key arrives at a full registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the least recently used entry to make room
    #[default]
    EvictLru,
    /// Refuse to track the new key
    Reject,
}

/// Sizing and eviction settings for a [`BucketRegistry`].
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryOptions {
    /// Maximum number of tracked keys; 0 selects [`DEFAULT_MAX_ENTRIES`]
    pub max_entries: usize,
    pub overflow: OverflowPolicy,
    /// Entries idle for longer than this are removed by [`BucketRegistry::sweep_idle`]
    pub idle_ttl: Option<Duration>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            overflow: OverflowPolicy::default(),
            idle_ttl: None,
        }
    }
}

struct Entry {
    bucket: Arc<TokenBucket>,
    last_access: Instant,
}

/// Lazily populated map from client key to token bucket.
///
/// Lookup and insertion happen under a single lock, so concurrent first
/// requests for a key always share one bucket. The map is an LRU with a hard
/// size cap; keys are attacker-controlled and must not grow it without bound.
/// Recency order doubles as idle order, which keeps sweeps proportional to the
/// number of entries removed.
pub struct BucketRegistry {
    /// Capacity of each bucket created
    capacity: u64,
    /// Refill rate of each bucket created
    rate: f64,
    overflow: OverflowPolicy,
    idle_ttl: Option<Duration>,
    max_entries: usize,
    clock: Arc<dyn Clock>,
    entries: Mutex<LruCache<String, Entry>>,
    evicted: AtomicU64,
    rejected: AtomicU64,
}

impl BucketRegistry {
    /// Create an empty registry whose buckets hold `capacity` tokens refilled
    /// at `rate` per second.
    pub fn new(
        capacity: u64,
        rate: f64,
        options: RegistryOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        TokenBucket::validate(capacity, rate)?;

        let max_entries = match options.max_entries {
            0 => DEFAULT_MAX_ENTRIES,
            n => n,
        };

        Ok(Self {
            capacity,
            rate,
            overflow: options.overflow,
            idle_ttl: options.idle_ttl,
            max_entries,
            clock,
            // The cap is enforced on insert; nothing is allocated up front
            entries: Mutex::new(LruCache::unbounded()),
            evicted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Return the bucket for `key`, creating a full one if absent.
    ///
    /// Returns `None` only when the registry is full and configured with
    /// [`OverflowPolicy::Reject`].
    pub fn get_or_create(&self, key: &str) -> Option<Arc<TokenBucket>> {
        let mut entries = self.entries.lock();
        // Read under the lock so recency order matches `last_access` order
        let now = self.clock.now();

        if let Some(entry) = entries.get_mut(key) {
            entry.last_access = now;
            return Some(entry.bucket.clone());
        }

        if entries.len() >= self.max_entries {
            match self.overflow {
                OverflowPolicy::Reject => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                OverflowPolicy::EvictLru => {
                    if entries.pop_lru().is_some() {
                        self.evicted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        let bucket = Arc::new(
            TokenBucket::with_clock(self.capacity, self.rate, self.clock.clone()).ok()?,
        );

        entries.put(
            key.to_string(),
            Entry {
                bucket: bucket.clone(),
                last_access: now,
            },
        );

        Some(bucket)
    }

    /// Remove entries idle for longer than the configured TTL.
    ///
    /// Returns the number of entries removed; always 0 without a TTL.
    pub fn sweep_idle(&self) -> usize {
        match self.idle_ttl {
            Some(ttl) => self.evict_idle(ttl),
            None => 0,
        }
    }

    /// Remove entries that have not been accessed for longer than `ttl`.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let mut entries = self.entries.lock();
        let now = self.clock.now();
        let mut removed = 0;

        loop {
            let idle = match entries.peek_lru() {
                Some((_, entry)) => now.saturating_duration_since(entry.last_access) > ttl,
                None => false,
            };
            if !idle {
                break;
            }
            entries.pop_lru();
            removed += 1;
        }

        self.evicted.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Start a background task that calls [`BucketRegistry::sweep_idle`]
    /// every `interval`.
    ///
    /// The task only holds a weak reference and stops once the registry is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let interval = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };

                let removed = registry.sweep_idle();
                if removed > 0 {
                    debug!(
                        removed = removed,
                        remaining = registry.len(),
                        "Evicted idle client buckets"
                    );
                }
            }
        })
    }

    /// Whether `key` is currently tracked. Does not affect recency.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains(key)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of tracked keys.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Entries removed so far by LRU replacement or idle sweeps.
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// New keys refused so far because the registry was full.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Drop every tracked key.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl std::fmt::Debug for BucketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketRegistry")
            .field("capacity", &self.capacity)
            .field("rate", &self.rate)
            .field("overflow", &self.overflow)
            .field("idle_ttl", &self.idle_ttl)
            .field("max_entries", &self.max_entries)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use std::sync::Barrier;

    fn registry(options: RegistryOptions) -> (BucketRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let registry = BucketRegistry::new(2, 1.0, options, clock.clone()).unwrap();
        (registry, clock)
    }

    fn bounded(max_entries: usize, overflow: OverflowPolicy) -> RegistryOptions {
        RegistryOptions {
            max_entries,
            overflow,
            idle_ttl: None,
        }
    }

    #[test]
    fn test_registry_creation() {
        let (registry, _) = registry(RegistryOptions::default());
        assert!(registry.is_empty());
        assert_eq!(registry.max_entries(), DEFAULT_MAX_ENTRIES);
    }

    #[test]
    fn test_zero_max_entries_uses_default() {
        let (registry, _) = registry(bounded(0, OverflowPolicy::EvictLru));
        assert_eq!(registry.max_entries(), DEFAULT_MAX_ENTRIES);
    }

    #[test]
    fn test_huge_max_entries_allocates_lazily() {
        let (registry, _) = registry(bounded(usize::MAX, OverflowPolicy::EvictLru));
        assert_eq!(registry.max_entries(), usize::MAX);
        assert!(registry.get_or_create("a").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_bucket_parameters_rejected() {
        let clock = Arc::new(ManualClock::new());
        assert!(BucketRegistry::new(0, 1.0, RegistryOptions::default(), clock.clone()).is_err());
        assert!(BucketRegistry::new(1, 0.0, RegistryOptions::default(), clock).is_err());
    }

    #[test]
    fn test_same_key_returns_same_bucket() {
        let (registry, _) = registry(RegistryOptions::default());
        let a = registry.get_or_create("client").unwrap();
        let b = registry.get_or_create("client").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_different_keys_have_separate_buckets() {
        let (registry, _) = registry(RegistryOptions::default());
        let a = registry.get_or_create("a").unwrap();
        let b = registry.get_or_create("b").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        assert!(a.try_take(2));
        assert!(!a.try_take(1));
        assert!(b.try_take(2));
    }

    #[test]
    fn test_concurrent_first_lookup_creates_one_bucket() {
        let (registry, _) = registry(RegistryOptions::default());
        let registry = Arc::new(registry);
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.get_or_create("shared").unwrap()
                })
            })
            .collect();

        let buckets: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for bucket in &buckets[1..] {
            assert!(Arc::ptr_eq(&buckets[0], bucket));
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lru_eviction_past_capacity() {
        let (registry, _) = registry(bounded(2, OverflowPolicy::EvictLru));

        let a = registry.get_or_create("a").unwrap();
        assert!(a.try_take(2));
        registry.get_or_create("b").unwrap();
        // Touch "a" so "b" becomes least recently used
        registry.get_or_create("a").unwrap();
        registry.get_or_create("c").unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("a"));
        assert!(!registry.contains("b"));
        assert!(registry.contains("c"));
        assert_eq!(registry.evicted_count(), 1);

        // "a" kept its drained state
        assert!(!registry.get_or_create("a").unwrap().try_take(1));
    }

    #[test]
    fn test_evicted_key_starts_with_fresh_bucket() {
        let (registry, _) = registry(bounded(1, OverflowPolicy::EvictLru));

        let first = registry.get_or_create("a").unwrap();
        assert!(first.try_take(2));
        registry.get_or_create("b").unwrap();
        assert!(!registry.contains("a"));

        let second = registry.get_or_create("a").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.available(), 2.0);
    }

    #[test]
    fn test_reject_policy_refuses_new_keys_when_full() {
        let (registry, _) = registry(bounded(2, OverflowPolicy::Reject));

        assert!(registry.get_or_create("a").is_some());
        assert!(registry.get_or_create("b").is_some());
        assert!(registry.get_or_create("c").is_none());
        // Existing keys still resolve
        assert!(registry.get_or_create("a").is_some());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.rejected_count(), 1);
    }

    #[test]
    fn test_evict_idle_removes_only_stale_entries() {
        let (registry, clock) = registry(RegistryOptions::default());

        registry.get_or_create("old").unwrap();
        clock.advance(Duration::from_secs(30));
        registry.get_or_create("fresh").unwrap();
        clock.advance(Duration::from_secs(31));

        assert_eq!(registry.evict_idle(Duration::from_secs(60)), 1);
        assert!(!registry.contains("old"));
        assert!(registry.contains("fresh"));
    }

    #[test]
    fn test_access_refreshes_idle_timer() {
        let (registry, clock) = registry(RegistryOptions::default());

        registry.get_or_create("a").unwrap();
        clock.advance(Duration::from_secs(50));
        registry.get_or_create("a").unwrap();
        clock.advance(Duration::from_secs(50));

        assert_eq!(registry.evict_idle(Duration::from_secs(60)), 0);
        assert!(registry.contains("a"));
    }

    #[test]
    fn test_sweep_idle_without_ttl_is_noop() {
        let (registry, clock) = registry(RegistryOptions::default());
        registry.get_or_create("a").unwrap();
        clock.advance(Duration::from_secs(3600));
        assert_eq!(registry.sweep_idle(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_task_evicts_idle_entries() {
        let (registry, clock) = registry(RegistryOptions {
            idle_ttl: Some(Duration::from_secs(10)),
            ..RegistryOptions::default()
        });
        let registry = Arc::new(registry);

        registry.get_or_create("a").unwrap();
        let handle = registry.spawn_sweeper(Duration::from_millis(5));

        clock.advance(Duration::from_secs(11));
        for _ in 0..200 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(registry.is_empty());

        handle.abort();
    }

    #[tokio::test]
    async fn test_sweeper_task_stops_when_registry_dropped() {
        let (registry, _) = registry(RegistryOptions::default());
        let registry = Arc::new(registry);
        let handle = registry.spawn_sweeper(Duration::from_millis(5));

        drop(registry);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
