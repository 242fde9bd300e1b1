// Sliding-Window Rate Limiting
//
// Per-key sliding window split into aligned sub-windows. Sub-windows that
// partially overlap the window contribute an overlap-weighted share of
// their count, so the admitted rate tracks the true window instead of
// stepping at fixed-window boundaries.

use crate::clock::SharedClock;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum admitted events per window.
    pub limit: u32,
    pub window_ms: u64,
    /// Number of sub-window slices per window.
    pub sub_window_count: u32,
    /// Tracked-key cap; least-recently-accessed keys are evicted above it.
    pub max_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 60,
            window_ms: 60_000,
            sub_window_count: 6,
            max_keys: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SubWindow {
    /// Aligned to a sub-window boundary.
    start: u64,
    count: u64,
}

#[derive(Debug, Clone, Default)]
struct KeyWindow {
    sub_windows: Vec<SubWindow>,
    last_access: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub current_count: u64,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the oldest sub-window leaves the window; zero when allowed.
    pub retry_after_ms: u64,
}

pub struct RateLimitSlidingWindow {
    keys: DashMap<String, KeyWindow>,
    config: RateLimitConfig,
    clock: SharedClock,
}

impl RateLimitSlidingWindow {
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            keys: DashMap::new(),
            config,
            clock,
        }
    }

    fn sub_window_ms(&self) -> u64 {
        (self.config.window_ms / self.config.sub_window_count.max(1) as u64).max(1)
    }

    /// Admission check. Counts the event when allowed; linearizable per key
    /// through the per-entry lock.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.check_with_limit(key, self.config.limit)
    }

    /// Admission check with a per-key limit override (group defaults).
    pub fn check_with_limit(&self, key: &str, limit: u32) -> RateLimitDecision {
        let now = self.clock.now_ms();
        let sub_ms = self.sub_window_ms();
        let window_start = now.saturating_sub(self.config.window_ms);

        let decision = {
            let mut entry = self.keys.entry(key.to_string()).or_default();
            entry.last_access = now;
            prune(&mut entry.sub_windows, window_start, sub_ms);

            let current = weighted_count(&entry.sub_windows, window_start, sub_ms);
            if current >= limit as u64 {
                let retry_after_ms = entry
                    .sub_windows
                    .iter()
                    .map(|sw| (sw.start + sub_ms + self.config.window_ms).saturating_sub(now))
                    .min()
                    .unwrap_or(self.config.window_ms);
                RateLimitDecision {
                    allowed: false,
                    current_count: current,
                    limit,
                    remaining: 0,
                    retry_after_ms: retry_after_ms.max(1),
                }
            } else {
                let slot = now / sub_ms * sub_ms;
                match entry.sub_windows.iter().position(|sw| sw.start == slot) {
                    Some(i) => entry.sub_windows[i].count += 1,
                    None => entry.sub_windows.push(SubWindow { start: slot, count: 1 }),
                }
                RateLimitDecision {
                    allowed: true,
                    current_count: current + 1,
                    limit,
                    remaining: (limit as u64).saturating_sub(current + 1) as u32,
                    retry_after_ms: 0,
                }
            }
        };

        if !decision.allowed {
            debug!(key, current = decision.current_count, limit, "rate limited");
        }
        self.evict_over_capacity();
        decision
    }

    /// Same computation as `check`, with no mutation.
    pub fn peek(&self, key: &str) -> RateLimitDecision {
        let now = self.clock.now_ms();
        let sub_ms = self.sub_window_ms();
        let window_start = now.saturating_sub(self.config.window_ms);
        let limit = self.config.limit;

        let live: Vec<SubWindow> = self
            .keys
            .get(key)
            .map(|entry| {
                entry
                    .sub_windows
                    .iter()
                    .filter(|sw| sw.start + sub_ms > window_start)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        let current = weighted_count(&live, window_start, sub_ms);
        if current >= limit as u64 {
            let retry_after_ms = live
                .iter()
                .map(|sw| (sw.start + sub_ms + self.config.window_ms).saturating_sub(now))
                .min()
                .unwrap_or(self.config.window_ms);
            RateLimitDecision {
                allowed: false,
                current_count: current,
                limit,
                remaining: 0,
                retry_after_ms: retry_after_ms.max(1),
            }
        } else {
            RateLimitDecision {
                allowed: true,
                current_count: current,
                limit,
                remaining: (limit as u64).saturating_sub(current) as u32,
                retry_after_ms: 0,
            }
        }
    }

    /// Drop all state for a key.
    pub fn reset(&self, key: &str) {
        self.keys.remove(key);
    }

    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }

    fn evict_over_capacity(&self) {
        while self.keys.len() > self.config.max_keys {
            let oldest = self
                .keys
                .iter()
                .min_by_key(|e| e.value().last_access)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.keys.remove(&key);
                }
                None => break,
            }
        }
    }
}

fn prune(sub_windows: &mut Vec<SubWindow>, window_start: u64, sub_ms: u64) {
    sub_windows.retain(|sw| sw.start + sub_ms > window_start);
}

// Sub-windows entirely inside the window count fully; the one straddling
// the window start counts proportionally to its remaining overlap.
fn weighted_count(sub_windows: &[SubWindow], window_start: u64, sub_ms: u64) -> u64 {
    let mut total = 0u64;
    for sw in sub_windows {
        if sw.start >= window_start {
            total += sw.count;
        } else {
            let overlap_ms = (sw.start + sub_ms).saturating_sub(window_start);
            let weighted = (sw.count as f64 * overlap_ms as f64 / sub_ms as f64).ceil() as u64;
            total += weighted;
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn limiter(limit: u32, window_ms: u64, sub_windows: u32) -> (RateLimitSlidingWindow, Arc<ManualClock>) {
        let clock = ManualClock::shared(1_000_000);
        let config = RateLimitConfig {
            limit,
            window_ms,
            sub_window_count: sub_windows,
            max_keys: 100,
        };
        (RateLimitSlidingWindow::new(config, clock.clone()), clock)
    }

    #[test]
    fn test_allows_up_to_limit() {
        let (rl, _) = limiter(3, 1_000, 6);
        assert!(rl.check("k").allowed);
        assert!(rl.check("k").allowed);
        assert!(rl.check("k").allowed);
        let denied = rl.check("k");
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0 && denied.retry_after_ms <= 1_000 + 1_000);
    }

    #[test]
    fn test_scenario_sliding_window() {
        // Limit 3 per 1s with 6 sub-windows: 3 at t=0 pass, t=+500ms is
        // denied with a bounded retry hint, t=+1100ms passes again.
        let (rl, clock) = limiter(3, 1_000, 6);
        for _ in 0..3 {
            assert!(rl.check("k").allowed);
        }
        clock.advance(500);
        let denied = rl.check("k");
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0 && denied.retry_after_ms <= 1_000);

        clock.advance(600); // t = +1100ms, the t=0 sub-window has left
        assert!(rl.check("k").allowed);
    }

    #[test]
    fn test_keys_are_independent() {
        let (rl, _) = limiter(1, 1_000, 4);
        assert!(rl.check("a").allowed);
        assert!(rl.check("b").allowed);
        assert!(!rl.check("a").allowed);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (rl, _) = limiter(2, 1_000, 4);
        assert!(rl.peek("k").allowed);
        assert!(rl.peek("k").allowed);
        assert!(rl.check("k").allowed);
        assert_eq!(rl.peek("k").current_count, 1);
        assert!(rl.check("k").allowed);
        assert!(!rl.peek("k").allowed);
        assert!(!rl.check("k").allowed);
    }

    #[test]
    fn test_overlap_weighting_decays() {
        // One event per sub-window; as the window slides, the oldest
        // sub-window's contribution shrinks instead of dropping at once.
        let (rl, clock) = limiter(10, 1_000, 4);
        for _ in 0..4 {
            rl.check("k");
            clock.advance(250);
        }
        // t=+1000: the first sub-window is exactly at the boundary.
        let decision = rl.peek("k");
        assert!(decision.current_count <= 4);
        clock.advance(250);
        let later = rl.peek("k");
        assert!(later.current_count < 4);
    }

    #[test]
    fn test_limit_override() {
        let (rl, _) = limiter(1, 1_000, 4);
        assert!(rl.check_with_limit("k", 3).allowed);
        assert!(rl.check_with_limit("k", 3).allowed);
        assert!(rl.check_with_limit("k", 3).allowed);
        assert!(!rl.check_with_limit("k", 3).allowed);
    }

    #[test]
    fn test_lru_eviction_of_tracked_keys() {
        let clock = ManualClock::shared(1_000_000);
        let config = RateLimitConfig {
            limit: 10,
            window_ms: 1_000,
            sub_window_count: 4,
            max_keys: 2,
        };
        let rl = RateLimitSlidingWindow::new(config, clock.clone());
        rl.check("a");
        clock.advance(10);
        rl.check("b");
        clock.advance(10);
        rl.check("c");
        assert_eq!(rl.tracked_keys(), 2);
        // "a" was the least recently accessed.
        assert_eq!(rl.peek("a").current_count, 0);
    }

    #[test]
    fn test_reset() {
        let (rl, _) = limiter(1, 1_000, 4);
        rl.check("k");
        assert!(!rl.check("k").allowed);
        rl.reset("k");
        assert!(rl.check("k").allowed);
    }
}
