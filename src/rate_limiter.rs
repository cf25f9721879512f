// ===============================
// src/rate_limiter.rs
// ===============================
//
// Three sliding windows per key (1s / 1h / 1d). Timestamps are appended in
// non-decreasing order so pruning is a pop_front loop, never a scan.
// `allow` never blocks; `acquire` is the caller-side poll with backoff.
//
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::config::RateCfg;
use crate::engine::StopFlag;
use crate::metrics::RATE_LIMIT_WAITS;

pub const BACKOFF: std::time::Duration = std::time::Duration::from_millis(200);

/// Time source. Injected so windows can be tested without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// Hand-cranked clock for tests and backtests.
#[derive(Debug, Clone)]
pub struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self { Self(Arc::new(Mutex::new(start))) }
    pub fn set(&self, ts: DateTime<Utc>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = ts;
    }
    pub fn advance(&self, by: Duration) {
        let mut g = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *g += by;
    }
}
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> { *self.0.lock().unwrap_or_else(|e| e.into_inner()) }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("rate-limit wait for {0} cancelled by stop request")]
pub struct Cancelled(pub String);

#[derive(Debug, Default)]
struct KeyWindows {
    second: VecDeque<DateTime<Utc>>,
    hour: VecDeque<DateTime<Utc>>,
    day: VecDeque<DateTime<Utc>>,
}

fn prune(hits: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) {
    let cutoff = now - window;
    while let Some(front) = hits.front() {
        if *front <= cutoff { hits.pop_front(); } else { break; }
    }
}

pub struct RateLimiter {
    cfg: RateCfg,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, KeyWindows>>,
}

impl RateLimiter {
    pub fn new(cfg: RateCfg) -> Self {
        Self::with_clock(cfg, Arc::new(SystemClock))
    }

    pub fn with_clock(cfg: RateCfg, clock: Arc<dyn Clock>) -> Self {
        Self { cfg, clock, windows: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, KeyWindows>> {
        // a panic while holding the lock cannot leave the queues half-updated
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit one call for `key` iff all three windows have room, recording it
    /// in all three under the same lock. Denied calls leave no trace.
    pub fn allow(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut map = self.lock();
        let w = map.entry(key.to_string()).or_default();

        prune(&mut w.second, now, Duration::seconds(1));
        prune(&mut w.hour, now, Duration::hours(1));
        prune(&mut w.day, now, Duration::days(1));

        if w.second.len() >= self.cfg.per_second
            || w.hour.len() >= self.cfg.per_hour
            || w.day.len() >= self.cfg.per_day
        {
            return false;
        }

        w.second.push_back(now);
        w.hour.push_back(now);
        w.day.push_back(now);
        true
    }

    /// Poll `allow` with a fixed backoff until admitted or `stop` fires.
    pub async fn acquire(&self, key: &str, stop: &StopFlag) -> Result<(), Cancelled> {
        loop {
            if stop.is_set() {
                return Err(Cancelled(key.to_string()));
            }
            if self.allow(key) {
                return Ok(());
            }
            RATE_LIMIT_WAITS.with_label_values(&[key]).inc();
            debug!(key, backoff_ms = BACKOFF.as_millis() as u64, "rate limit reached, backing off");
            sleep(BACKOFF).await;
        }
    }

    /// (second, hour, day) populations for `key` as of the last call.
    pub fn usage(&self, key: &str) -> (usize, usize, usize) {
        let map = self.lock();
        map.get(key).map(|w| (w.second.len(), w.hour.len(), w.day.len())).unwrap_or((0, 0, 0))
    }

    pub fn reset(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn limiter(per_second: usize, per_hour: usize, per_day: usize) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(Utc.timestamp_opt(1_000, 0).unwrap());
        let rl = RateLimiter::with_clock(RateCfg { per_second, per_hour, per_day }, Arc::new(clock.clone()));
        (rl, clock)
    }

    #[test]
    fn allows_within_per_second_then_blocks() {
        let (rl, _) = limiter(2, 100, 1000);
        assert!(rl.allow("u1"));
        assert!(rl.allow("u1"));
        assert!(!rl.allow("u1"));
        assert_eq!(rl.usage("u1"), (2, 2, 2));
    }

    #[test]
    fn allows_again_after_second_window_passes() {
        let (rl, clock) = limiter(1, 100, 1000);
        assert!(rl.allow("u1"));
        assert!(!rl.allow("u1"));
        clock.advance(Duration::milliseconds(1010));
        assert!(rl.allow("u1"));
    }

    #[test]
    fn entry_exactly_one_window_old_is_evicted() {
        let (rl, clock) = limiter(1, 100, 1000);
        assert!(rl.allow("u1"));
        clock.advance(Duration::seconds(1));
        assert!(rl.allow("u1"));
    }

    #[test]
    fn separate_keys_are_independent() {
        let (rl, _) = limiter(1, 100, 1000);
        assert!(rl.allow("a"));
        assert!(!rl.allow("a"));
        assert!(rl.allow("b"));
    }

    #[test]
    fn hour_limit_blocks_and_denials_are_not_recorded() {
        let (rl, clock) = limiter(10, 2, 1000);
        assert!(rl.allow("u1"));
        clock.advance(Duration::seconds(2));
        assert!(rl.allow("u1"));
        clock.advance(Duration::seconds(2));
        assert!(!rl.allow("u1"));
        assert!(!rl.allow("u1"));
        assert_eq!(rl.usage("u1").1, 2);
        clock.advance(Duration::hours(1));
        assert!(rl.allow("u1"));
    }

    #[test]
    fn day_limit_blocks_until_day_rolls() {
        let (rl, clock) = limiter(10, 100, 3);
        for _ in 0..3 {
            assert!(rl.allow("d"));
            clock.advance(Duration::hours(2));
        }
        assert!(!rl.allow("d"));
        clock.advance(Duration::hours(20));
        assert!(rl.allow("d"));
    }

    #[test]
    fn queues_never_exceed_capacity() {
        let (rl, clock) = limiter(3, 5, 7);
        for _ in 0..50 {
            rl.allow("k");
            clock.advance(Duration::milliseconds(300));
            let (s, h, d) = rl.usage("k");
            assert!(s <= 3 && h <= 5 && d <= 7);
        }
    }

    #[tokio::test]
    async fn acquire_returns_cancelled_when_stopped() {
        let (rl, _) = limiter(1, 100, 1000);
        let stop = StopFlag::new();
        assert!(rl.acquire("k", &stop).await.is_ok());
        stop.trigger();
        assert_eq!(rl.acquire("k", &stop).await, Err(Cancelled("k".into())));
    }
}
