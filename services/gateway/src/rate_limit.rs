//! Per-user token buckets with lazy refill.
//!
//! Buckets are created full on first sight, refilled proportionally to the
//! elapsed time on every check, and swept once idle for longer than the
//! configured window.  Uses `tokio::time::Instant` so tests can drive the
//! clock with `start_paused`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_tokens: u32,
    pub refill_per_sec: f64,
    /// Buckets untouched for this long are evicted by [`RateLimiter::sweep_idle`].
    pub idle_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 50,
            refill_per_sec: 5.0,
            idle_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Denied { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    cfg: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or deny one action for `key`.
    pub fn check(&self, key: &str) -> RateDecision {
        let now = Instant::now();
        let max = f64::from(self.cfg.max_tokens);
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(key.to_owned()).or_insert(Bucket {
            tokens: max,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.cfg.refill_per_sec).min(max);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateDecision::Allowed {
                remaining: bucket.tokens.floor().max(0.0) as u32,
            }
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_secs = if self.cfg.refill_per_sec > 0.0 {
                (deficit / self.cfg.refill_per_sec).ceil().max(1.0) as u64
            } else {
                self.cfg.idle_window.as_secs().max(1)
            };
            RateDecision::Denied { retry_after_secs }
        }
    }

    /// Evict buckets idle for longer than the window.  Returns how many
    /// were removed.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let window = self.cfg.idle_window;
        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.last_refill) < window);
        before - buckets.len()
    }

    pub fn tracked_users(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}
