//! Admission control: per-name rate limiting and dedupe keys.

use crate::config::{BrokerConfig, LimiterKind};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use task_queue_core::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

/// Gate on admissions per task name.
pub trait AdmissionLimiter: Send + Sync {
    /// Count one admission for `name` if the window allows it
    fn check(&self, name: &str) -> RateDecision;

    /// Drop bookkeeping for names that have gone quiet
    fn purge(&self);
}

pub fn build_limiter(config: &BrokerConfig) -> Box<dyn AdmissionLimiter> {
    let limit = config.admission.rate_limit.max(1);
    let window = config.rate_window();
    match config.admission.limiter {
        LimiterKind::FixedWindow => Box::new(FixedWindowLimiter::new(limit, window)),
        LimiterKind::Smooth => Box::new(SmoothLimiter::new(limit, window)),
    }
}

struct Window {
    started: Instant,
    count: u32,
}

/// At most `limit` admissions per name inside each window.
pub struct FixedWindowLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, Window>,
}

impl FixedWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        FixedWindowLimiter {
            limit,
            window,
            windows: DashMap::new(),
        }
    }
}

impl AdmissionLimiter for FixedWindowLimiter {
    fn check(&self, name: &str) -> RateDecision {
        let now = Instant::now();
        let mut window = self.windows.entry(name.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        let elapsed = now.duration_since(window.started);
        if elapsed >= self.window {
            window.started = now;
            window.count = 0;
        }

        if window.count < self.limit {
            window.count += 1;
            RateDecision::Allowed
        } else {
            RateDecision::Limited {
                retry_after: self.window.saturating_sub(now.duration_since(window.started)),
            }
        }
    }

    fn purge(&self) {
        let now = Instant::now();
        self.windows
            .retain(|_, w| now.duration_since(w.started) < self.window);
    }
}

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// GCRA limiter: bursts up to `limit`, then one admission per `window / limit`.
pub struct SmoothLimiter {
    limiter: KeyedLimiter,
    clock: DefaultClock,
}

impl SmoothLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        let burst = NonZeroU32::new(limit).unwrap_or(NonZeroU32::MIN);
        let period = window / burst.get();
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);
        SmoothLimiter {
            limiter: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
        }
    }
}

impl AdmissionLimiter for SmoothLimiter {
    fn check(&self, name: &str) -> RateDecision {
        match self.limiter.check_key(&name.to_string()) {
            Ok(()) => RateDecision::Allowed,
            Err(not_until) => RateDecision::Limited {
                retry_after: not_until.wait_time_from(self.clock.now()),
            },
        }
    }

    fn purge(&self) {
        self.limiter.retain_recent();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    Registered,
    Duplicate(TaskId),
}

struct DedupEntry {
    task_id: TaskId,
    /// Set once the owning task is terminal; the key frees up a grace period later
    released_at: Option<Instant>,
}

/// Maps dedupe keys to the task that holds them.
pub struct Deduplicator {
    keys: DashMap<String, DedupEntry>,
    grace: Duration,
}

impl Deduplicator {
    pub fn new(grace: Duration) -> Self {
        Deduplicator {
            keys: DashMap::new(),
            grace,
        }
    }

    fn is_expired(&self, entry: &DedupEntry, now: Instant) -> bool {
        entry
            .released_at
            .is_some_and(|at| now.duration_since(at) >= self.grace)
    }

    /// Claim `key` for `task_id` unless another task holds it.
    /// Check and claim happen under one shard lock.
    pub fn try_register(&self, key: &str, task_id: TaskId) -> DedupOutcome {
        let now = Instant::now();
        match self.keys.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if self.is_expired(occupied.get(), now) {
                    occupied.insert(DedupEntry {
                        task_id,
                        released_at: None,
                    });
                    DedupOutcome::Registered
                } else {
                    DedupOutcome::Duplicate(occupied.get().task_id)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DedupEntry {
                    task_id,
                    released_at: None,
                });
                DedupOutcome::Registered
            }
        }
    }

    /// The owning task reached a terminal state; start the grace period
    pub fn release(&self, key: &str, task_id: TaskId) {
        if let Some(mut entry) = self.keys.get_mut(key) {
            if entry.task_id == task_id && entry.released_at.is_none() {
                entry.released_at = Some(Instant::now());
            }
        }
    }

    /// Free a key immediately
    pub fn expire(&self, key: &str) -> bool {
        self.keys.remove(key).is_some()
    }

    pub fn holder(&self, key: &str) -> Option<TaskId> {
        let now = Instant::now();
        self.keys
            .get(key)
            .filter(|e| !self.is_expired(e, now))
            .map(|e| e.task_id)
    }

    /// Drop keys whose grace period has passed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.keys.len();
        self.keys.retain(|_, e| !self.is_expired(e, now));
        before.saturating_sub(self.keys.len())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_fixed_window_limits_per_name() {
        let limiter = FixedWindowLimiter::new(2, Duration::from_secs(60));
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        match limiter.check("a") {
            RateDecision::Limited { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
                assert!(retry_after > Duration::from_secs(55));
            }
            other => panic!("expected Limited, got {:?}", other),
        }
        // Other names have their own window
        assert_eq!(limiter.check("b"), RateDecision::Allowed);
    }

    #[test]
    fn test_fixed_window_resets() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_millis(50));
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert!(matches!(limiter.check("a"), RateDecision::Limited { .. }));

        std::thread::sleep(Duration::from_millis(60));
        limiter.purge();
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
    }

    #[test]
    fn test_smooth_limiter_allows_burst_then_limits() {
        let limiter = SmoothLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert_eq!(limiter.check("job"), RateDecision::Allowed);
        }
        match limiter.check("job") {
            RateDecision::Limited { retry_after } => {
                assert!(retry_after <= Duration::from_secs(20));
            }
            other => panic!("expected Limited, got {:?}", other),
        }
        assert_eq!(limiter.check("other"), RateDecision::Allowed);
    }

    #[test]
    fn test_build_limiter_honours_kind() {
        let mut config = BrokerConfig::default();
        config.admission.rate_limit = 1;
        config.admission.limiter = LimiterKind::Smooth;
        let limiter = build_limiter(&config);
        assert_eq!(limiter.check("x"), RateDecision::Allowed);
        assert!(matches!(limiter.check("x"), RateDecision::Limited { .. }));
    }

    #[test]
    fn test_dedupe_blocks_until_grace_expires() {
        let dedup = Deduplicator::new(Duration::from_millis(50));
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(dedup.try_register("k", first), DedupOutcome::Registered);
        assert_eq!(dedup.try_register("k", second), DedupOutcome::Duplicate(first));

        dedup.release("k", first);
        // Still inside the grace period
        assert_eq!(dedup.try_register("k", second), DedupOutcome::Duplicate(first));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(dedup.holder("k"), None);
        assert_eq!(dedup.try_register("k", second), DedupOutcome::Registered);
        assert_eq!(dedup.holder("k"), Some(second));
    }

    #[test]
    fn test_dedupe_expire() {
        let dedup = Deduplicator::new(Duration::from_secs(5));
        let owner = Uuid::new_v4();
        dedup.try_register("k", owner);

        // Only the owner can start the grace period
        dedup.release("k", Uuid::new_v4());
        assert_eq!(dedup.holder("k"), Some(owner));

        assert!(dedup.expire("k"));
        assert!(dedup.is_empty());
        assert!(!dedup.expire("k"));
    }

    #[test]
    fn test_purge_expired() {
        let dedup = Deduplicator::new(Duration::ZERO);
        let a = Uuid::new_v4();
        dedup.try_register("a", a);
        dedup.try_register("b", Uuid::new_v4());
        dedup.release("a", a);

        assert_eq!(dedup.purge_expired(), 1);
        assert_eq!(dedup.len(), 1);
    }
}
