use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::interval;

use crate::metrics::TRACKED_KEYS;

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: u32,
    pub window: Duration,
    pub block: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            limit: 12,
            window: Duration::from_secs(60),
            block: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_seconds: u64,
    /// Epoch millis the block lifts at, only set while blocked
    pub blocked_until: Option<u64>,
}

// Rate limit entry - request timestamps (ascending) plus an optional block
#[derive(Debug, Default)]
pub struct RateLimitEntry {
    pub timestamps: VecDeque<u64>,
    pub blocked_until: Option<u64>,
}

impl RateLimitEntry {
    // drops an expired block and every timestamp that fell out of the window
    fn prune(&mut self, now: u64, window_ms: u64) {
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
        }
        let Some(cutoff) = now.checked_sub(window_ms) else {
            return;
        };
        while self.timestamps.front().is_some_and(|&ts| ts <= cutoff) {
            self.timestamps.pop_front();
        }
    }

    fn is_idle(&self) -> bool {
        self.timestamps.is_empty() && self.blocked_until.is_none()
    }
}

/// Rate-limit state behind an interface so a shared store can stand in
/// for the in-process table when the gateway runs as several instances.
pub trait RateLimitStore: Send + Sync {
    fn check(&self, key: &str) -> RateDecision;
    /// Removes idle records and returns how many were dropped.
    fn sweep(&self) -> usize;
    fn len(&self) -> usize;
    fn policy(&self) -> RateLimitPolicy;
}

pub struct SlidingWindowLimiter {
    entries: DashMap<String, RateLimitEntry>,
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
            clock,
        }
    }

    fn window_ms(&self) -> u64 {
        self.policy.window.as_millis() as u64
    }
}

fn ceil_seconds(millis: u64) -> u64 {
    millis.div_ceil(1000)
}

impl RateLimitStore for SlidingWindowLimiter {
    fn check(&self, key: &str) -> RateDecision {
        let now = self.clock.now_millis();
        let limit = self.policy.limit;
        let window_ms = self.window_ms();

        // the shard lock is held for the whole evaluation
        let mut entry = self.entries.entry(key.to_string()).or_default();

        if let Some(until) = entry.blocked_until.filter(|&until| until > now) {
            return RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_seconds: ceil_seconds(until - now),
                blocked_until: Some(until),
            };
        }

        entry.prune(now, window_ms);

        if entry.timestamps.len() >= limit as usize {
            let block_ms = self.policy.block.as_millis() as u64;
            let until = now + block_ms;
            entry.blocked_until = Some(until);
            entry.timestamps.clear();
            tracing::warn!(key, until, "rate limit exceeded, blocking");
            return RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_seconds: ceil_seconds(block_ms),
                blocked_until: Some(until),
            };
        }

        entry.timestamps.push_back(now);
        let count = entry.timestamps.len() as u32;
        let oldest = entry.timestamps.front().copied().unwrap_or(now);

        RateDecision {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(count),
            reset_seconds: ceil_seconds((oldest + window_ms).saturating_sub(now)),
            blocked_until: None,
        }
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let window_ms = self.window_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.prune(now, window_ms);
            !entry.is_idle()
        });
        before.saturating_sub(self.entries.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn policy(&self) -> RateLimitPolicy {
        self.policy
    }
}

// Sweep loop - runs every `every` and drops idle client records
pub async fn sweeper(limiters: Vec<Arc<dyn RateLimitStore>>, every: Duration) {
    let mut interval = interval(every);

    tracing::info!(?every, "rate limit sweeper started");

    loop {
        interval.tick().await;

        let mut removed = 0;
        let mut tracked = 0;
        for limiter in &limiters {
            removed += limiter.sweep();
            tracked += limiter.len();
        }
        TRACKED_KEYS.set(tracked as f64);

        if removed > 0 {
            tracing::debug!(removed, tracked, "swept idle rate limit records");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    pub(crate) struct ManualClock(AtomicU64);

    impl ManualClock {
        pub(crate) fn set_secs(&self, secs: u64) {
            self.0.store(secs * 1000, Ordering::SeqCst);
        }

        pub(crate) fn set_millis(&self, millis: u64) {
            self.0.store(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn limiter() -> (Arc<ManualClock>, SlidingWindowLimiter) {
        let clock = Arc::new(ManualClock::default());
        let limiter = SlidingWindowLimiter::with_clock(RateLimitPolicy::default(), clock.clone());
        (clock, limiter)
    }

    #[test]
    fn thirteenth_request_in_window_blocks_for_an_hour() {
        let (clock, limiter) = limiter();
        for i in 0..12 {
            let decision = limiter.check("10.0.0.1");
            assert!(decision.allowed, "request {i} should pass");
            assert_eq!(decision.remaining, 11 - i);
        }

        clock.set_secs(1);
        let decision = limiter.check("10.0.0.1");
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_seconds, 3600);
        assert_eq!(decision.blocked_until, Some(3_601_000));
    }

    #[test]
    fn blocked_client_stays_blocked_then_starts_fresh() {
        let (clock, limiter) = limiter();
        for _ in 0..13 {
            limiter.check("a");
        }

        clock.set_secs(1800);
        let decision = limiter.check("a");
        assert!(!decision.allowed);
        assert_eq!(decision.reset_seconds, 1800);

        clock.set_millis(3_599_500);
        assert_eq!(limiter.check("a").reset_seconds, 1);

        clock.set_secs(3600);
        let decision = limiter.check("a");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 11);
        assert_eq!(decision.blocked_until, None);
    }

    #[test]
    fn window_slides_instead_of_resetting() {
        let (clock, limiter) = limiter();
        for _ in 0..6 {
            limiter.check("a");
        }
        clock.set_secs(30);
        for _ in 0..6 {
            assert!(limiter.check("a").allowed);
        }

        // the first six fall out of the window, the last six still count
        clock.set_secs(61);
        let decision = limiter.check("a");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
        assert_eq!(decision.reset_seconds, 29);
    }

    #[test]
    fn reset_follows_the_oldest_timestamp() {
        let (clock, limiter) = limiter();
        clock.set_secs(10);
        assert_eq!(limiter.check("a").reset_seconds, 60);
        clock.set_millis(25_500);
        assert_eq!(limiter.check("a").reset_seconds, 45);
    }

    #[test]
    fn keys_are_independent() {
        let (_clock, limiter) = limiter();
        for _ in 0..13 {
            limiter.check("a");
        }
        assert!(!limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
    }

    #[test]
    fn sweep_removes_only_idle_records() {
        let (clock, limiter) = limiter();
        limiter.check("old");
        for _ in 0..13 {
            limiter.check("blocked");
        }
        clock.set_secs(90);
        limiter.check("fresh");

        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.len(), 2);

        clock.set_secs(4000);
        assert_eq!(limiter.sweep(), 2);
        assert_eq!(limiter.len(), 0);
    }
}
