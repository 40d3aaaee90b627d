//! Per-user request rate gate.
//!
//! A token bucket per user id behind one mutex: refill is
//! `max_requests_per_minute / 60` tokens per second, burst capacity is the
//! full per-minute allowance. Mutating operations charge tokens before they
//! touch storage; the gate is a no-op when request limits are disabled.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::config::MemexConfig;
use crate::error::{Error, Result};

pub struct RateGate {
    buckets: Mutex<HashMap<String, Bucket>>,
    capacity: f64,
    refill_per_sec: f64,
    enabled: bool,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateGate {
    pub fn new(config: &MemexConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity: config.max_requests_per_minute as f64,
            refill_per_sec: config.max_requests_per_minute as f64 / 60.0,
            enabled: config.enable_request_limits,
        }
    }

    /// Charge `cost` tokens against `user_id`'s bucket.
    pub fn check(&self, user_id: &str, cost: u32) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate gate mutex poisoned");
        let bucket = buckets.entry(user_id.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= cost as f64 {
            bucket.tokens -= cost as f64;
            Ok(())
        } else {
            tracing::debug!(user = user_id, cost, "rate limited");
            Err(Error::RateLimited(user_id.to_string()))
        }
    }
}
