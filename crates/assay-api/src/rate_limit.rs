use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;

/// Window map size above which expired windows are dropped on the next check.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Clone)]
pub struct EndpointRateLimiter {
    state: Arc<Mutex<HashMap<String, RateWindow>>>,
    window: Duration,
    sync_limit: u32,
    mark_ready_limit: u32,
    metrics: Arc<RateLimitMetrics>,
}

#[derive(Clone, Copy)]
pub enum ProtectedEndpoint {
    SyncPull,
    SyncPush,
    MarkReady,
}

#[derive(Default)]
struct RateLimitMetrics {
    pull_allowed: AtomicU64,
    pull_limited: AtomicU64,
    push_allowed: AtomicU64,
    push_limited: AtomicU64,
    mark_ready_allowed: AtomicU64,
    mark_ready_limited: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub pull_allowed: u64,
    pub pull_limited: u64,
    pub push_allowed: u64,
    pub push_limited: u64,
    pub mark_ready_allowed: u64,
    pub mark_ready_limited: u64,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

impl EndpointRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit_window,
            config.sync_rate_limit_per_window,
            config.mark_ready_rate_limit_per_window,
        )
    }

    fn new(window: Duration, sync_limit: u32, mark_ready_limit: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            window,
            sync_limit,
            mark_ready_limit,
            metrics: Arc::new(RateLimitMetrics::default()),
        }
    }

    pub async fn check(&self, endpoint: ProtectedEndpoint, caller: &str) -> Result<(), AppError> {
        let limit = match endpoint {
            ProtectedEndpoint::SyncPull | ProtectedEndpoint::SyncPush => self.sync_limit,
            ProtectedEndpoint::MarkReady => self.mark_ready_limit,
        };

        let key = format!("{}:{caller}", endpoint.label());
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        if guard.len() >= PRUNE_THRESHOLD {
            guard.retain(|_, window| now.duration_since(window.started_at) < self.window);
        }
        let entry = guard.entry(key).or_insert(RateWindow {
            started_at: now,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        if entry.count >= limit {
            let retry_after_secs = self
                .window
                .saturating_sub(now.duration_since(entry.started_at))
                .as_secs();
            self.counters(endpoint).1.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                endpoint = endpoint.label(),
                caller = caller_fingerprint(caller),
                retry_after_secs,
                "Rate limit exceeded"
            );
            return Err(AppError::too_many_requests(
                "Rate limit exceeded for protected endpoint",
                retry_after_secs,
            ));
        }

        entry.count += 1;
        self.counters(endpoint).0.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        let metrics = &self.metrics;
        RateLimitMetricsSnapshot {
            pull_allowed: metrics.pull_allowed.load(Ordering::Relaxed),
            pull_limited: metrics.pull_limited.load(Ordering::Relaxed),
            push_allowed: metrics.push_allowed.load(Ordering::Relaxed),
            push_limited: metrics.push_limited.load(Ordering::Relaxed),
            mark_ready_allowed: metrics.mark_ready_allowed.load(Ordering::Relaxed),
            mark_ready_limited: metrics.mark_ready_limited.load(Ordering::Relaxed),
        }
    }

    /// `(allowed, limited)` counters for an endpoint.
    fn counters(&self, endpoint: ProtectedEndpoint) -> (&AtomicU64, &AtomicU64) {
        let metrics = &self.metrics;
        match endpoint {
            ProtectedEndpoint::SyncPull => (&metrics.pull_allowed, &metrics.pull_limited),
            ProtectedEndpoint::SyncPush => (&metrics.push_allowed, &metrics.push_limited),
            ProtectedEndpoint::MarkReady => {
                (&metrics.mark_ready_allowed, &metrics.mark_ready_limited)
            }
        }
    }
}

impl ProtectedEndpoint {
    pub const fn label(self) -> &'static str {
        match self {
            Self::SyncPull => "sync_pull",
            Self::SyncPush => "sync_push",
            Self::MarkReady => "mark_ready",
        }
    }
}

fn caller_fingerprint(caller: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    caller.hash(&mut hasher);
    hasher.finish()
}
