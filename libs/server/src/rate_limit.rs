//! Per-client token bucket.
//!
//! Linear refill at `rpm/60` tokens per second, capacity clamped to
//! `burst + rpm/60` (one second of headroom above burst). The effective
//! RPM is the caller's token override when present. Buckets idle for five
//! minutes are pruned on the next pass.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const STALE_AFTER: Duration = Duration::from_secs(300);
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RateLimiterOptions {
    pub default_rpm: u32,
    pub burst: u32,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            default_rpm: 60,
            burst: 10,
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    options: RateLimiterOptions,
    buckets: Mutex<BucketMap>,
}

struct BucketMap {
    buckets: HashMap<String, Bucket>,
    last_prune: Instant,
}

impl RateLimiter {
    pub fn new(options: RateLimiterOptions) -> Self {
        Self {
            options,
            buckets: Mutex::new(BucketMap {
                buckets: HashMap::new(),
                last_prune: Instant::now(),
            }),
        }
    }

    /// Admit or reject one request. On rejection returns the retry-after
    /// hint in seconds.
    pub fn check(&self, client: &str, rpm_override: Option<u32>) -> Result<(), u64> {
        self.check_at(client, rpm_override, Instant::now())
    }

    fn check_at(&self, client: &str, rpm_override: Option<u32>, now: Instant) -> Result<(), u64> {
        let rpm = rpm_override.unwrap_or(self.options.default_rpm).max(1);
        let per_second = f64::from(rpm) / 60.0;
        let capacity = f64::from(self.options.burst) + per_second;

        let Ok(mut map) = self.buckets.lock() else {
            return Ok(());
        };

        if now.duration_since(map.last_prune) >= PRUNE_INTERVAL {
            map.buckets
                .retain(|_, bucket| now.duration_since(bucket.last_refill) < STALE_AFTER);
            map.last_prune = now;
        }

        let bucket = map.buckets.entry(client.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * per_second).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err((60.0 / f64::from(rpm)).ceil() as u64)
        }
    }
}
