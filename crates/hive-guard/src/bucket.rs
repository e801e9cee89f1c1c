// Per-agent token buckets guarding the submit paths.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Interval between polls of the blocking helper.
const ACQUIRE_POLL: Duration = Duration::from_millis(10);

/// Senders idle for this long are dropped from the tracking map.
const AGENT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum tokens an agent can accumulate.
    pub capacity: f64,
    /// Tokens restored per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_per_sec: 10.0,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

/// Token-bucket rate limiter keyed by agent ID.
///
/// Buckets live in process memory; a restart starts every agent from a full
/// bucket again.
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take one token for `agent`. Non-blocking.
    pub fn allow(&self, agent: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");

        let bucket = buckets.entry(agent.to_string()).or_insert_with(|| Bucket {
            tokens: self.config.capacity,
            last_refill: now,
            last_access: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * self.config.refill_per_sec).min(self.config.capacity);
        bucket.last_refill = now;
        bucket.last_access = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            tracing::debug!(agent, "rate limiter exhausted");
            false
        }
    }

    /// Wait up to `timeout` for a token, polling every few milliseconds.
    /// Returns false if the timeout elapses without a token becoming free.
    pub async fn acquire(&self, agent: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.allow(agent) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(ACQUIRE_POLL).await;
        }
    }

    /// Remaining tokens for an agent, for diagnostics.
    pub fn remaining(&self, agent: &str) -> f64 {
        let buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        buckets
            .get(agent)
            .map(|b| b.tokens)
            .unwrap_or(self.config.capacity)
    }

    /// Drop buckets nobody has touched recently.
    pub fn sweep_idle(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        buckets.retain(|_, b| now.duration_since(b.last_access) < AGENT_TIMEOUT);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_bounds_burst() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 3.0,
            refill_per_sec: 0.0,
        });
        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        // Other agents are tracked independently.
        assert!(limiter.allow("b"));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 1.0,
            refill_per_sec: 1000.0,
        });
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.allow("a"));
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 1.0,
            refill_per_sec: 100.0,
        });
        assert!(limiter.allow("a"));
        assert!(limiter.acquire("a", Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn acquire_times_out_without_refill() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 1.0,
            refill_per_sec: 0.0,
        });
        assert!(limiter.allow("a"));
        assert!(!limiter.acquire("a", Duration::from_millis(30)).await);
    }
}
