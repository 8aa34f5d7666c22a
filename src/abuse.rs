//! Per-IP abuse tracking: a sliding connection-rate window, violation
//! counting, and temporary blocks with a periodic eviction loop.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{
    ABUSE_CLEANUP_INTERVAL, BLOCK_DURATION, CONNECTION_RATE_WINDOW, MAX_CONNECTIONS_PER_MINUTE,
    RATE_LIMIT_VIOLATIONS_MAX,
};

/// Called with the offending IP whenever a block is applied. Must be
/// idempotent; it is invoked outside the tracker's lock.
pub type BlockCallback = Box<dyn Fn(IpAddr) + Send + Sync>;

#[derive(derive_more::Debug)]
pub struct AbuseTracker {
    state: Arc<Mutex<AbuseState>>,
    total_blocked: AtomicU64,
    total_rate_limited: AtomicU64,
    #[debug(skip)]
    on_block: OnceLock<BlockCallback>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

#[derive(Debug, Default)]
struct AbuseState {
    connection_times: HashMap<IpAddr, Vec<Instant>>,
    blocked: HashMap<IpAddr, Instant>,
    violations: HashMap<IpAddr, u32>,
}

impl AbuseTracker {
    /// Creates a tracker and spawns its eviction loop.
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(AbuseState::default()));
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(cleanup_loop(state.clone(), shutdown.clone()));
        Self {
            state,
            total_blocked: AtomicU64::new(0),
            total_rate_limited: AtomicU64::new(0),
            on_block: OnceLock::new(),
            shutdown,
            tasks,
        }
    }

    /// Sets the callback fired when an IP is blocked. May be set once.
    pub fn set_on_block(&self, callback: BlockCallback) {
        let _ = self.on_block.set(callback);
    }

    /// Returns the block expiry for `ip` only if it lies in the future; an
    /// expired entry reads as "not blocked" (the eviction loop reaps it).
    pub fn block_expiry(&self, ip: IpAddr) -> Option<Instant> {
        let state = self.state.lock().unwrap();
        state
            .blocked
            .get(&ip)
            .copied()
            .filter(|expiry| *expiry > Instant::now())
    }

    /// Blocks `ip` for the configured duration and fires the callback.
    pub fn block(&self, ip: IpAddr) {
        {
            let mut state = self.state.lock().unwrap();
            state.blocked.insert(ip, Instant::now() + BLOCK_DURATION);
        }
        self.total_blocked.fetch_add(1, Ordering::Relaxed);
        self.fire_on_block(ip);
    }

    /// Admits or denies a new connection from `ip` against the sliding
    /// window, counting violations and auto-blocking repeat offenders.
    pub fn check_connection_rate(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let blocked = {
            let mut state = self.state.lock().unwrap();

            let times = state.connection_times.entry(ip).or_default();
            times.retain(|t| now.duration_since(*t) < CONNECTION_RATE_WINDOW);
            if times.len() < MAX_CONNECTIONS_PER_MINUTE {
                times.push(now);
                return true;
            }

            let violations = state.violations.entry(ip).or_insert(0);
            *violations += 1;
            if *violations >= RATE_LIMIT_VIOLATIONS_MAX {
                state.violations.remove(&ip);
                state.blocked.insert(ip, now + BLOCK_DURATION);
                true
            } else {
                false
            }
        };

        self.total_rate_limited.fetch_add(1, Ordering::Relaxed);
        if blocked {
            self.total_blocked.fetch_add(1, Ordering::Relaxed);
            self.fire_on_block(ip);
        }
        false
    }

    /// Snapshot of (active blocks, total blocked, total rate limited).
    pub fn stats(&self) -> (usize, u64, u64) {
        let now = Instant::now();
        let active_blocks = {
            let state = self.state.lock().unwrap();
            state.blocked.values().filter(|e| **e > now).count()
        };
        (
            active_blocks,
            self.total_blocked.load(Ordering::Relaxed),
            self.total_rate_limited.load(Ordering::Relaxed),
        )
    }

    /// Stops the eviction loop and waits for it to drain.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    fn fire_on_block(&self, ip: IpAddr) {
        if let Some(callback) = self.on_block.get() {
            callback(ip);
        }
    }

    #[cfg(test)]
    fn evict_now(&self) {
        evict(&self.state);
    }
}

impl Default for AbuseTracker {
    fn default() -> Self {
        Self::new()
    }
}

async fn cleanup_loop(state: Arc<Mutex<AbuseState>>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(ABUSE_CLEANUP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => evict(&state),
        }
    }
}

/// One eviction pass: prune windows, drop IPs whose newest timestamp fell
/// far outside the window, drop expired blocks, and drop violation counts
/// for IPs with no activity and no active block.
fn evict(state: &Mutex<AbuseState>) {
    let now = Instant::now();
    let mut state = state.lock().unwrap();

    state.connection_times.retain(|_, times| {
        times.retain(|t| now.duration_since(*t) < CONNECTION_RATE_WINDOW);
        match times.last() {
            None => false,
            Some(newest) => now.duration_since(*newest) < 2 * CONNECTION_RATE_WINDOW,
        }
    });
    state.blocked.retain(|_, expiry| *expiry > now);

    let connection_times = std::mem::take(&mut state.connection_times);
    let blocked = std::mem::take(&mut state.blocked);
    state
        .violations
        .retain(|ip, _| connection_times.contains_key(ip) || blocked.contains_key(ip));
    state.connection_times = connection_times;
    state.blocked = blocked;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn window_admits_up_to_the_limit() {
        let tracker = AbuseTracker::new();
        let addr = ip("198.51.100.9");
        for i in 0..MAX_CONNECTIONS_PER_MINUTE {
            assert!(tracker.check_connection_rate(addr), "connection {i} denied");
        }
        assert!(!tracker.check_connection_rate(addr));
        let (_, _, rate_limited) = tracker.stats();
        assert_eq!(rate_limited, 1);
        tracker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let tracker = AbuseTracker::new();
        let addr = ip("198.51.100.9");
        for _ in 0..MAX_CONNECTIONS_PER_MINUTE {
            assert!(tracker.check_connection_rate(addr));
        }
        assert!(!tracker.check_connection_rate(addr));
        tokio::time::advance(CONNECTION_RATE_WINDOW + Duration::from_secs(1)).await;
        assert!(tracker.check_connection_rate(addr));
        tracker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_violations_block_the_ip() {
        let tracker = AbuseTracker::new();
        let blocks = Arc::new(AtomicUsize::new(0));
        let seen = blocks.clone();
        tracker.set_on_block(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let addr = ip("203.0.113.50");
        for _ in 0..MAX_CONNECTIONS_PER_MINUTE {
            assert!(tracker.check_connection_rate(addr));
        }
        for _ in 0..RATE_LIMIT_VIOLATIONS_MAX {
            assert!(!tracker.check_connection_rate(addr));
        }
        assert!(tracker.block_expiry(addr).is_some());
        assert_eq!(blocks.load(Ordering::SeqCst), 1);
        let (active, total_blocked, _) = tracker.stats();
        assert_eq!(active, 1);
        assert_eq!(total_blocked, 1);
        tracker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_expire() {
        let tracker = AbuseTracker::new();
        let addr = ip("203.0.113.50");
        tracker.block(addr);
        assert!(tracker.block_expiry(addr).is_some());
        tokio::time::advance(BLOCK_DURATION + Duration::from_secs(1)).await;
        assert!(tracker.block_expiry(addr).is_none());
        tracker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_reaps_stale_entries() {
        let tracker = AbuseTracker::new();
        let active = ip("203.0.113.1");
        let stale = ip("203.0.113.2");
        assert!(tracker.check_connection_rate(stale));
        tracker.block(stale);

        tokio::time::advance(BLOCK_DURATION + Duration::from_secs(1)).await;
        assert!(tracker.check_connection_rate(active));
        tracker.evict_now();

        let state = tracker.state.lock().unwrap();
        assert!(!state.connection_times.contains_key(&stale));
        assert!(!state.blocked.contains_key(&stale));
        assert!(!state.violations.contains_key(&stale));
        assert!(state.connection_times.contains_key(&active));
        drop(state);
        tracker.stop().await;
    }
}
