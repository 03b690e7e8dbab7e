//! Per-client request rate limiting
//!
//! Two fixed windows per client key: the main window (default 10 requests per
//! 60 s) and a 1 s burst window (default 15). A request is admitted only when
//! both windows have capacity.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{BridgeError, BridgeResult};

const BURST_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
            burst: 15,
        }
    }
}

#[derive(Debug, Clone)]
struct RateLimitRecord {
    count: u32,
    window_reset: Instant,
    burst_count: u32,
    burst_window_start: Instant,
}

impl RateLimitRecord {
    fn fresh(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            window_reset: now + window,
            burst_count: 0,
            burst_window_start: now,
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    records: Mutex<HashMap<String, RateLimitRecord>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject a request from `key` at `now`
    pub async fn check_at(&self, key: &str, now: Instant) -> BridgeResult<()> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::fresh(now, self.config.window));

        if now >= record.window_reset {
            record.count = 0;
            record.window_reset = now + self.config.window;
        }
        if now.saturating_duration_since(record.burst_window_start) >= BURST_WINDOW {
            record.burst_count = 0;
            record.burst_window_start = now;
        }

        if record.count >= self.config.max_requests {
            let retry_after = record.window_reset.saturating_duration_since(now);
            debug!(key, retry_after_ms = retry_after.as_millis() as u64, "Rate window exhausted");
            return Err(BridgeError::RateLimited {
                retry_after_ms: retry_after.as_millis() as u64,
            });
        }
        if record.burst_count >= self.config.burst {
            let retry_after =
                (record.burst_window_start + BURST_WINDOW).saturating_duration_since(now);
            debug!(key, "Burst window exhausted");
            return Err(BridgeError::RateLimited {
                retry_after_ms: retry_after.as_millis() as u64,
            });
        }

        record.count += 1;
        record.burst_count += 1;
        Ok(())
    }

    pub async fn check(&self, key: &str) -> BridgeResult<()> {
        self.check_at(key, Instant::now()).await
    }

    /// Drop records whose main and burst windows have both lapsed.
    /// Returns the number of records removed.
    pub async fn purge_expired_at(&self, now: Instant) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| {
            now < r.window_reset
                || now.saturating_duration_since(r.burst_window_start) < BURST_WINDOW
        });
        before - records.len()
    }

    pub async fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now()).await
    }

    pub async fn tracked_clients(&self) -> usize {
        self.records.lock().await.len()
    }
}
