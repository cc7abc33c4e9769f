// =============================================================================
// Rate-Limit Tracker — monitors exchange REST usage to avoid 429s
// =============================================================================
//
// The futures REST API enforces request-weight and order-rate limits. The
// tracker reads the `X-MBX-USED-WEIGHT-1M` response header after every
// request and keeps atomic counters any task may query lock-free.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 2000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 1600;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    order_count_10s: AtomicU32,
    order_count_1d: AtomicU32,
}

/// Immutable snapshot of the current rate-limit state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub order_count_10s: u32,
    pub order_count_1d: u32,
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
            order_count_1d: AtomicU32::new(0),
        }
    }

    /// Update internal counters from the HTTP response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(val) = headers.get("X-MBX-USED-WEIGHT-1M") {
            if let Ok(s) = val.to_str() {
                if let Ok(w) = s.parse::<u32>() {
                    let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
                    if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
                        warn!(used_weight = w, hard_limit = WEIGHT_HARD_LIMIT, "rate-limit weight crossed warning threshold");
                    }
                    debug!(used_weight_1m = w, "rate-limit weight updated from header");
                }
            }
        }
        if let Some(val) = headers.get("X-MBX-ORDER-COUNT-10S") {
            if let Ok(s) = val.to_str() {
                if let Ok(c) = s.parse::<u32>() {
                    self.order_count_10s.store(c, Ordering::Relaxed);
                }
            }
        }
        if let Some(val) = headers.get("X-MBX-ORDER-COUNT-1D") {
            if let Ok(s) = val.to_str() {
                if let Ok(c) = s.parse::<u32>() {
                    self.order_count_1d.store(c, Ordering::Relaxed);
                }
            }
        }
    }

    /// Return `true` if we can afford to spend `weight` more request weight.
    pub fn can_spend(&self, weight: u32) -> bool {
        self.used_weight_1m.load(Ordering::Relaxed) + weight < WEIGHT_HARD_LIMIT
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            order_count_10s: self.order_count_10s.load(Ordering::Relaxed),
            order_count_1d: self.order_count_1d.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_can_spend() {
        let t = RateLimitTracker::new();
        assert!(t.can_spend(500));
    }

    #[test]
    fn snapshot_starts_zeroed() {
        let t = RateLimitTracker::new();
        let s = t.snapshot();
        assert_eq!(s.used_weight_1m, 0);
        assert_eq!(s.order_count_10s, 0);
    }
}
