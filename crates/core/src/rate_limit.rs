//! Per-scope admission control using the token bucket algorithm.
//!
//! One bucket per named scope (typically an agent name). Refill is computed
//! lazily on admission, so idle scopes cost nothing. There is no blocking
//! variant here: callers decide whether to fail, queue, or retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::Mutex;

/// Rate limit configuration for one scope.
#[derive(Debug, Clone)]
pub struct RateLimit {
    /// Maximum tokens the bucket can hold.
    pub capacity: u64,
    /// Refill rate in tokens per second.
    pub refill_rate: f64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            capacity: 60,
            refill_rate: 1.0,
        }
    }
}

fn normalize_limit(mut limit: RateLimit) -> RateLimit {
    if !limit.refill_rate.is_finite() || limit.refill_rate < 0.0 {
        limit.refill_rate = 0.0;
    }
    if limit.capacity == 0 && limit.refill_rate > 0.0 {
        limit.capacity = 1;
    }
    limit
}

/// Token bucket for one scope.
#[derive(Debug)]
struct TokenBucket {
    capacity: u64,
    tokens: f64,
    last_refill: Instant,
    refill_rate: f64,
    admitted: u64,
    rejected: u64,
}

impl TokenBucket {
    fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity as f64, // Start full
            last_refill: Instant::now(),
            refill_rate,
            admitted: 0,
            rejected: 0,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let updated = self.tokens + elapsed * self.refill_rate;
        self.tokens = updated.clamp(0.0, self.capacity as f64);
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.admitted += 1;
            true
        } else {
            self.rejected += 1;
            false
        }
    }

    fn available_tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// Point-in-time view of one scope's bucket.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScopeSnapshot {
    pub scope: String,
    pub capacity: u64,
    pub available_tokens: f64,
    pub admitted: u64,
    pub rejected: u64,
}

/// Per-scope token bucket rate limiter.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    custom_limits: Mutex<HashMap<String, RateLimit>>,
    default_limit: RateLimit,
    admitted_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl RateLimiter {
    /// Create a rate limiter with the given default per-scope limit.
    pub fn new(default_limit: RateLimit) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            custom_limits: Mutex::new(HashMap::new()),
            default_limit: normalize_limit(default_limit),
            admitted_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    /// Override the limit for a specific scope.
    ///
    /// Takes effect the next time the scope's bucket is created; an existing
    /// bucket keeps its current fill but adopts the new parameters.
    pub async fn set_scope_limit(&self, scope: impl Into<String>, limit: RateLimit) {
        let scope = scope.into();
        let limit = normalize_limit(limit);
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get_mut(&scope) {
            bucket.capacity = limit.capacity;
            bucket.refill_rate = limit.refill_rate;
            bucket.tokens = bucket.tokens.min(limit.capacity as f64);
        }
        drop(buckets);
        self.custom_limits.lock().await.insert(scope, limit);
    }

    /// Try to admit one call for `scope`.
    ///
    /// Refills lazily, then consumes one token if available. Never blocks on
    /// anything but the bucket map lock.
    pub async fn allow(&self, scope: &str) -> bool {
        let limit = self.limit_for(scope).await;
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(scope.to_string())
            .or_insert_with(|| TokenBucket::new(limit.capacity, limit.refill_rate));
        let allowed = bucket.try_consume();
        drop(buckets);

        if allowed {
            self.admitted_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    /// Total admissions across all scopes.
    pub fn admitted_total(&self) -> u64 {
        self.admitted_total.load(Ordering::Relaxed)
    }

    /// Total rejections across all scopes.
    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }

    /// Snapshot every known scope (for stats and health output).
    pub async fn snapshots(&self) -> Vec<ScopeSnapshot> {
        let mut buckets = self.buckets.lock().await;
        let mut out: Vec<ScopeSnapshot> = buckets
            .iter_mut()
            .map(|(scope, bucket)| ScopeSnapshot {
                scope: scope.clone(),
                capacity: bucket.capacity,
                available_tokens: bucket.available_tokens(),
                admitted: bucket.admitted,
                rejected: bucket.rejected,
            })
            .collect();
        out.sort_by(|a, b| a.scope.cmp(&b.scope));
        out
    }

    async fn limit_for(&self, scope: &str) -> RateLimit {
        self.custom_limits
            .lock()
            .await
            .get(scope)
            .cloned()
            .unwrap_or_else(|| self.default_limit.clone())
    }
}
