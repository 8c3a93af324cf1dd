//! Request throttling.
//!
//! Two layers: a process-wide token bucket in front of every route, and a
//! chain of fixed-window counters on the post-creation endpoint, keyed by
//! client IP and by post key at minute and day granularity.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RateLimitConfig;
use crate::error::{ServiceError, ServiceResult};

// -- Global bucket --

/// Refills at `per_minute / 60` tokens a second with a burst of `per_minute`.
pub struct GlobalLimiter {
    limiter: DefaultDirectRateLimiter,
}

impl GlobalLimiter {
    /// `None` when the limit is 0, i.e. disabled.
    pub fn per_minute(per_minute: u32) -> Option<Self> {
        let burst = NonZeroU32::new(per_minute)?;
        Some(Self {
            limiter: RateLimiter::direct(Quota::per_minute(burst)),
        })
    }

    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

// -- Fixed windows --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Ip,
    PostKey,
}

impl Dimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Ip => "ip",
            Dimension::PostKey => "post_key",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Minute,
    Day,
}

impl Window {
    pub fn as_str(self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Day => "day",
        }
    }

    pub fn secs(self) -> u64 {
        match self {
            Window::Minute => 60,
            Window::Day => 86_400,
        }
    }

    pub fn start(self, now_secs: u64) -> u64 {
        now_secs / self.secs() * self.secs()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub dimension: Dimension,
    pub window: Window,
    pub limit: u32,
}

impl Rule {
    fn key(&self, value: &str) -> String {
        format!("{}:{}:{}", self.dimension.as_str(), self.window.as_str(), value)
    }
}

/// What to do when the counter backend itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Let the request through and log the fault.
    #[default]
    Open,
    /// Reject the request with an internal error.
    Closed,
}

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("counter backend unavailable: {0}")]
    Backend(String),
}

/// Storage for fixed-window counters.
pub trait CounterStore: Send + Sync {
    /// Increments the counter for `key` in the window containing `now_secs`
    /// unless it already sits at `limit`. Returns whether it was incremented.
    /// Check and increment must be atomic per key.
    fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
        now_secs: u64,
    ) -> Result<bool, LimiterError>;

    /// Undoes one successful `try_acquire` made with the same arguments.
    fn release(&self, key: &str, window_secs: u64, now_secs: u64) -> Result<(), LimiterError>;

    /// Drops counters whose window has closed. Returns how many were dropped.
    fn purge(&self, now_secs: u64) -> usize;
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    window_start: u64,
    window_secs: u64,
    count: u32,
}

/// Process-local counters. Each key lives in one shard of the map and its
/// check-and-increment runs under that shard's lock only.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, WindowCounter>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Current count for `key`, if any window is open for it.
    pub fn count(&self, key: &str) -> Option<u32> {
        self.counters.get(key).map(|c| c.count)
    }
}

impl CounterStore for MemoryCounterStore {
    fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
        now_secs: u64,
    ) -> Result<bool, LimiterError> {
        let window_start = now_secs / window_secs * window_secs;
        let mut counter = self.counters.entry(key.to_string()).or_insert(WindowCounter {
            window_start,
            window_secs,
            count: 0,
        });

        if counter.window_start != window_start {
            counter.window_start = window_start;
            counter.window_secs = window_secs;
            counter.count = 0;
        }
        if counter.count >= limit {
            return Ok(false);
        }
        counter.count += 1;
        Ok(true)
    }

    fn release(&self, key: &str, window_secs: u64, now_secs: u64) -> Result<(), LimiterError> {
        let window_start = now_secs / window_secs * window_secs;
        if let Some(mut counter) = self.counters.get_mut(key) {
            if counter.window_start == window_start && counter.count > 0 {
                counter.count -= 1;
            }
        }
        Ok(())
    }

    fn purge(&self, now_secs: u64) -> usize {
        let before = self.counters.len();
        self.counters
            .retain(|_, c| c.window_start + c.window_secs > now_secs);
        before.saturating_sub(self.counters.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Limited { dimension: Dimension, window: Window },
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allowed => f.write_str("allowed"),
            Verdict::Limited { dimension, window } => {
                write!(f, "{} per {} limit exceeded", dimension.as_str(), window.as_str())
            }
        }
    }
}

/// Ordered fixed-window rules evaluated for every post creation.
pub struct RateLimitChain {
    store: Arc<dyn CounterStore>,
    rules: Vec<Rule>,
    policy: FailurePolicy,
}

impl RateLimitChain {
    /// Rules with a limit of 0 are left out.
    pub fn new(store: Arc<dyn CounterStore>, rules: Vec<Rule>, policy: FailurePolicy) -> Self {
        let rules = rules.into_iter().filter(|r| r.limit > 0).collect();
        Self {
            store,
            rules,
            policy,
        }
    }

    /// IP per minute, IP per day, post key per minute, post key per day.
    pub fn from_config(config: &RateLimitConfig, store: Arc<dyn CounterStore>) -> Self {
        let rule = |dimension, window, limit| Rule {
            dimension,
            window,
            limit,
        };
        Self::new(
            store,
            vec![
                rule(Dimension::Ip, Window::Minute, config.ip_per_minute),
                rule(Dimension::Ip, Window::Day, config.ip_per_day),
                rule(Dimension::PostKey, Window::Minute, config.post_key_per_minute),
                rule(Dimension::PostKey, Window::Day, config.post_key_per_day),
            ],
            config.failure_policy,
        )
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn check(&self, client_ip: &str, post_key: &str) -> ServiceResult<Verdict> {
        self.check_at(client_ip, post_key, unix_now())
    }

    /// Acquires every rule in order. The first rejection rolls back what this
    /// request already acquired, so a limited request leaves no trace.
    pub fn check_at(&self, client_ip: &str, post_key: &str, now_secs: u64) -> ServiceResult<Verdict> {
        let mut acquired: Vec<(String, u64)> = Vec::with_capacity(self.rules.len());

        for rule in &self.rules {
            let value = match rule.dimension {
                Dimension::Ip => client_ip,
                Dimension::PostKey => post_key,
            };
            let key = rule.key(value);
            let window_secs = rule.window.secs();

            match self.store.try_acquire(&key, rule.limit, window_secs, now_secs) {
                Ok(true) => acquired.push((key, window_secs)),
                Ok(false) => {
                    self.rollback(&acquired, now_secs);
                    let verdict = Verdict::Limited {
                        dimension: rule.dimension,
                        window: rule.window,
                    };
                    warn!(
                        dimension = rule.dimension.as_str(),
                        window = rule.window.as_str(),
                        limit = rule.limit,
                        client_ip,
                        post_key,
                        "rate limit exceeded: {}",
                        verdict
                    );
                    return Ok(verdict);
                }
                Err(e) => match self.policy {
                    FailurePolicy::Open => {
                        error!(key = %key, "rate limiter backend failed, allowing request: {}", e);
                    }
                    FailurePolicy::Closed => {
                        self.rollback(&acquired, now_secs);
                        return Err(ServiceError::internal(format!(
                            "rate limiter backend failed on {}: {}",
                            key, e
                        )));
                    }
                },
            }
        }

        Ok(Verdict::Allowed)
    }

    fn rollback(&self, acquired: &[(String, u64)], now_secs: u64) {
        for (key, window_secs) in acquired {
            if let Err(e) = self.store.release(key, *window_secs, now_secs) {
                error!(key = %key, "failed to release rate limit counter: {}", e);
            }
        }
    }

    pub fn purge(&self) -> usize {
        self.store.purge(unix_now())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Background task that drops closed windows until `shutdown` fires.
pub async fn run_purge_loop(chain: Arc<RateLimitChain>, interval_secs: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => {
                debug!("Rate limit purge loop stopped");
                return;
            }
        }

        let purged = chain.purge();
        if purged > 0 {
            info!("Rate limiter: purged {} stale counters", purged);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::error::ErrorCode;

    const T0: u64 = 1_700_000_040; // 40s into a minute

    fn chain(ip_min: u32, ip_day: u32, key_min: u32, key_day: u32) -> (Arc<MemoryCounterStore>, RateLimitChain) {
        let store = Arc::new(MemoryCounterStore::new());
        let config = RateLimitConfig {
            ip_per_minute: ip_min,
            ip_per_day: ip_day,
            post_key_per_minute: key_min,
            post_key_per_day: key_day,
            ..RateLimitConfig::default()
        };
        let chain = RateLimitChain::from_config(&config, store.clone());
        (store, chain)
    }

    #[test]
    fn n_plus_one_is_rejected_and_next_window_accepted() {
        let (_, chain) = chain(3, 0, 0, 0);
        for _ in 0..3 {
            assert_eq!(chain.check_at("1.2.3.4", "k", T0).unwrap(), Verdict::Allowed);
        }
        assert_eq!(
            chain.check_at("1.2.3.4", "k", T0 + 5).unwrap(),
            Verdict::Limited {
                dimension: Dimension::Ip,
                window: Window::Minute
            }
        );
        let next_minute = Window::Minute.start(T0) + 60;
        assert_eq!(chain.check_at("1.2.3.4", "k", next_minute).unwrap(), Verdict::Allowed);
    }

    #[test]
    fn ip_and_post_key_namespaces_do_not_collide() {
        let (store, chain) = chain(1, 0, 3, 0);
        // An IP string equal to a post key must not share a counter with it.
        assert_eq!(chain.check_at("same", "same", T0).unwrap(), Verdict::Allowed);
        assert_eq!(store.count("ip:minute:same"), Some(1));
        assert_eq!(store.count("post_key:minute:same"), Some(1));
        assert_eq!(store.len(), 2);

        // Exhausting the IP leaves the key's own budget untouched.
        assert_eq!(
            chain.check_at("same", "same", T0).unwrap(),
            Verdict::Limited {
                dimension: Dimension::Ip,
                window: Window::Minute
            }
        );
        assert_eq!(store.count("post_key:minute:same"), Some(1));

        assert_eq!(chain.check_at("10.0.0.2", "same", T0).unwrap(), Verdict::Allowed);
        assert_eq!(chain.check_at("10.0.0.3", "same", T0).unwrap(), Verdict::Allowed);
        assert_eq!(
            chain.check_at("10.0.0.4", "same", T0).unwrap(),
            Verdict::Limited {
                dimension: Dimension::PostKey,
                window: Window::Minute
            }
        );
        assert_eq!(store.count("post_key:minute:same"), Some(3));
        assert_eq!(store.count("ip:minute:10.0.0.4"), Some(0));
    }

    #[test]
    fn rejected_request_leaves_no_increments() {
        let (store, chain) = chain(10, 10, 1, 10);
        assert_eq!(chain.check_at("ip", "key", T0).unwrap(), Verdict::Allowed);

        let verdict = chain.check_at("ip", "key", T0).unwrap();
        assert_eq!(
            verdict,
            Verdict::Limited {
                dimension: Dimension::PostKey,
                window: Window::Minute
            }
        );
        assert_eq!(store.count("ip:minute:ip"), Some(1));
        assert_eq!(store.count("ip:day:ip"), Some(1));
        assert_eq!(store.count("post_key:minute:key"), Some(1));
        assert_eq!(store.count("post_key:day:key"), Some(1));
    }

    #[test]
    fn zero_limit_disables_a_rule() {
        let (store, one_rule) = chain(0, 0, 2, 0);
        assert_eq!(one_rule.rules().len(), 1);
        one_rule.check_at("ip", "key", T0).unwrap();
        assert_eq!(store.count("ip:minute:ip"), None);

        let (_, disabled) = chain(0, 0, 0, 0);
        for _ in 0..100 {
            assert_eq!(disabled.check_at("x", "y", T0).unwrap(), Verdict::Allowed);
        }
    }

    #[test]
    fn concurrent_callers_never_exceed_the_limit() {
        let (_, chain) = chain(25, 0, 0, 0);
        let chain = Arc::new(chain);
        let allowed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let chain = chain.clone();
                let allowed = allowed.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        if chain.check_at("10.0.0.1", "k", T0).unwrap() == Verdict::Allowed {
                            allowed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(allowed.load(Ordering::SeqCst), 25);
    }

    #[test]
    fn purge_drops_closed_windows_only() {
        let store = MemoryCounterStore::new();
        store.try_acquire("ip:minute:a", 5, 60, T0).unwrap();
        store.try_acquire("ip:day:a", 5, 86_400, T0).unwrap();

        assert_eq!(store.purge(T0 + 60), 1);
        assert_eq!(store.count("ip:minute:a"), None);
        assert_eq!(store.count("ip:day:a"), Some(1));
    }

    struct BrokenStore;

    impl CounterStore for BrokenStore {
        fn try_acquire(&self, _: &str, _: u32, _: u64, _: u64) -> Result<bool, LimiterError> {
            Err(LimiterError::Backend("connection refused".into()))
        }

        fn release(&self, _: &str, _: u64, _: u64) -> Result<(), LimiterError> {
            Ok(())
        }

        fn purge(&self, _: u64) -> usize {
            0
        }
    }

    #[test]
    fn backend_failure_follows_the_policy() {
        let rules = vec![Rule {
            dimension: Dimension::Ip,
            window: Window::Minute,
            limit: 1,
        }];

        let open = RateLimitChain::new(Arc::new(BrokenStore), rules.clone(), FailurePolicy::Open);
        assert_eq!(open.check_at("ip", "key", T0).unwrap(), Verdict::Allowed);

        let closed = RateLimitChain::new(Arc::new(BrokenStore), rules, FailurePolicy::Closed);
        let err = closed.check_at("ip", "key", T0).unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
    }

    #[test]
    fn global_bucket_allows_burst_then_refuses() {
        assert!(GlobalLimiter::per_minute(0).is_none());
        let limiter = GlobalLimiter::per_minute(3).unwrap();
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }
}
