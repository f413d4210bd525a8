//! Vigil rate limiter: cooldown gate keyed by (limiter name, identity key).

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use vigil_core::Clock;

fn default_max_keys() -> usize {
    std::env::var("VIGIL_LIMITER_MAX_KEYS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(100_000)
}

/// Cooldown gate shared by all trigger instances in a process. Constructed
/// once and injected, never a hidden global; tests pass a fake clock.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    max_keys: usize,
    last_fired: Mutex<FxHashMap<(String, String), i64>>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_max_keys(clock, default_max_keys())
    }

    /// Bound the key space; when full, the oldest-inactive key is evicted.
    pub fn with_max_keys(clock: Arc<dyn Clock>, max_keys: usize) -> Self {
        Self {
            clock,
            max_keys: max_keys.max(1),
            last_fired: Mutex::new(FxHashMap::default()),
        }
    }

    /// Atomic check-and-set: grants (recording now as last-fired) iff no
    /// grant was recorded for `(limiter, key)` within the last
    /// `window_secs`. Suppressed calls leave the recorded timestamp intact.
    pub fn mark_and_test(&self, limiter: &str, key: &str, window_secs: i64) -> bool {
        let now = self.clock.now_secs();
        let mut map = self.last_fired.lock().unwrap();
        let entry = (limiter.to_string(), key.to_string());
        if let Some(&last) = map.get(&entry) {
            if now < last {
                // Clock went backwards; keep the literal grant condition and
                // report the anomaly instead of guessing a reset policy.
                warn!(limiter, key, last, now, "rate limiter clock skew");
                counter!("limiter_clock_skew_total", 1u64);
                return false;
            }
            if now - last < window_secs {
                debug!(limiter, key, elapsed = now - last, window_secs, "suppressed");
                counter!("limiter_suppressed_total", 1u64);
                return false;
            }
        } else if map.len() >= self.max_keys {
            self.evict_oldest(&mut map);
        }
        map.insert(entry, now);
        counter!("limiter_granted_total", 1u64);
        true
    }

    fn evict_oldest(&self, map: &mut FxHashMap<(String, String), i64>) {
        // Linear scan; the cap is an operational guard, not a hot path.
        if let Some(oldest) = map
            .iter()
            .min_by_key(|(_, &ts)| ts)
            .map(|(k, _)| k.clone())
        {
            map.remove(&oldest);
            counter!("limiter_evicted_total", 1u64);
        }
    }

    #[cfg(test)]
    fn key_count(&self) -> usize {
        self.last_fired.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct FakeClock(AtomicI64);

    impl FakeClock {
        fn at(t: i64) -> Arc<Self> {
            Arc::new(Self(AtomicI64::new(t)))
        }
        fn set(&self, t: i64) {
            self.0.store(t, Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now_secs(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn greedy_window_grants() {
        let clock = FakeClock::at(0);
        let rl = RateLimiter::new(clock.clone());
        // Calls at t = 0, 10, 60, 100, 120 with a 60s window:
        // grants at 0, 60, 120 (greedy from the first grant).
        let mut grants = Vec::new();
        for t in [0, 10, 60, 100, 120] {
            clock.set(t);
            if rl.mark_and_test("crash-loop", "prod:web", 60) {
                grants.push(t);
            }
        }
        assert_eq!(grants, vec![0, 60, 120]);
    }

    #[test]
    fn suppressed_call_does_not_extend_the_window() {
        let clock = FakeClock::at(0);
        let rl = RateLimiter::new(clock.clone());
        assert!(rl.mark_and_test("t", "k", 60));
        clock.set(59);
        assert!(!rl.mark_and_test("t", "k", 60));
        // A grant at 60 proves the suppressed call at 59 left state alone.
        clock.set(60);
        assert!(rl.mark_and_test("t", "k", 60));
    }

    #[test]
    fn distinct_keys_are_independent() {
        let clock = FakeClock::at(0);
        let rl = RateLimiter::new(clock);
        assert!(rl.mark_and_test("t", "prod:web", 60));
        assert!(rl.mark_and_test("t", "prod:api", 60));
        assert!(rl.mark_and_test("other", "prod:web", 60));
        assert!(!rl.mark_and_test("t", "prod:web", 60));
    }

    #[test]
    fn concurrent_same_instant_grants_exactly_once() {
        let clock = FakeClock::at(100);
        let rl = Arc::new(RateLimiter::new(clock));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let rl = Arc::clone(&rl);
            handles.push(std::thread::spawn(move || {
                rl.mark_and_test("t", "same", 3600)
            }));
        }
        let grants = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|g| *g)
            .count();
        assert_eq!(grants, 1);
    }

    #[test]
    fn clock_skew_is_suppressed() {
        let clock = FakeClock::at(1000);
        let rl = RateLimiter::new(clock.clone());
        assert!(rl.mark_and_test("t", "k", 60));
        clock.set(900);
        assert!(!rl.mark_and_test("t", "k", 60));
    }

    #[test]
    fn key_cap_evicts_oldest_inactive() {
        let clock = FakeClock::at(0);
        let rl = RateLimiter::with_max_keys(clock.clone(), 2);
        assert!(rl.mark_and_test("t", "a", 10));
        clock.set(1);
        assert!(rl.mark_and_test("t", "b", 10));
        clock.set(2);
        assert!(rl.mark_and_test("t", "c", 10));
        assert_eq!(rl.key_count(), 2);
        // "a" was evicted, so it is granted again immediately.
        clock.set(3);
        assert!(rl.mark_and_test("t", "a", 10));
    }
}
