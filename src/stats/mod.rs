//! 统计模块：全局追加式请求计量与按批次快照差分。
//!
//! # Statistics Manager Module
//!
//! An append-only accumulator of per-request events. One global [`Stats`]
//! lives for the dispatcher's lifetime; per-batch figures are derived by
//! recording a deep snapshot at `start_batch` and differencing against the
//! global counters at `end_batch`. Rate-limited calls that will be retried
//! are *not* recorded; each request contributes exactly once, when it
//! finalizes.
//!
//! All counters sit behind a single mutex; updates are scalar and short.

use crate::error::{Error, ErrorKind, Result};
use crate::pricing::PricingEntry;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

/// Accumulated counters. Per-batch values use the same shape, produced by
/// snapshot differencing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,

    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,

    pub total_cost: f64,
    pub cost_by_model: HashMap<String, f64>,

    /// Response-time extremes over successful calls, in seconds.
    pub min_response_time: Option<f64>,
    pub max_response_time: Option<f64>,
    pub total_response_time: f64,

    /// Total coordinated-pause wait attributed to finalized requests.
    pub total_wait_time: f64,
    /// Accumulated per-request wall time.
    pub processing_time: f64,

    pub total_retries: u64,
    pub peak_concurrency: usize,
    pub errors_by_kind: HashMap<ErrorKind, u64>,
    pub api_rate_limits_detected: u64,

    /// Wall-clock span this snapshot covers, filled when the snapshot is
    /// taken.
    pub elapsed_secs: f64,
}

impl Stats {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Fraction of finalized requests that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    /// Finalized requests per second over the covered span.
    pub fn avg_rate(&self) -> f64 {
        if self.elapsed_secs <= 0.0 {
            0.0
        } else {
            self.total_requests as f64 / self.elapsed_secs
        }
    }

    /// Mean API response time over successful calls, seconds.
    pub fn avg_response_time(&self) -> f64 {
        if self.successful_requests == 0 {
            0.0
        } else {
            self.total_response_time / self.successful_requests as f64
        }
    }

    /// Share of prompt-side tokens served from the provider cache.
    pub fn cache_hit_rate(&self) -> f64 {
        let denominator = self.input_tokens + self.cached_tokens;
        if denominator == 0 {
            0.0
        } else {
            self.cached_tokens as f64 / denominator as f64
        }
    }

    /// Money not spent thanks to the cache discount.
    pub fn cost_savings_from_cache(&self, pricing: &PricingEntry) -> f64 {
        pricing.cache_savings(self.cached_tokens)
    }

    /// Share of processing time not spent in coordinated waits.
    pub fn efficiency_rate(&self) -> f64 {
        if self.processing_time <= 0.0 {
            1.0
        } else {
            ((self.processing_time - self.total_wait_time) / self.processing_time).max(0.0)
        }
    }

    /// Subtract an earlier snapshot, keying map differences per entry.
    ///
    /// Min/max response times carry over from `self`: an extreme cannot be
    /// un-merged from a snapshot, and the differenced sums stay exact.
    fn diff(&self, earlier: &Stats) -> Stats {
        let mut cost_by_model = HashMap::new();
        for (model, cost) in &self.cost_by_model {
            let delta = cost - earlier.cost_by_model.get(model).copied().unwrap_or(0.0);
            if delta > 0.0 {
                cost_by_model.insert(model.clone(), delta);
            }
        }
        let mut errors_by_kind = HashMap::new();
        for (kind, count) in &self.errors_by_kind {
            let delta = count - earlier.errors_by_kind.get(kind).copied().unwrap_or(0);
            if delta > 0 {
                errors_by_kind.insert(*kind, delta);
            }
        }
        Stats {
            total_requests: self.total_requests - earlier.total_requests,
            successful_requests: self.successful_requests - earlier.successful_requests,
            failed_requests: self.failed_requests - earlier.failed_requests,
            input_tokens: self.input_tokens - earlier.input_tokens,
            output_tokens: self.output_tokens - earlier.output_tokens,
            cached_tokens: self.cached_tokens - earlier.cached_tokens,
            total_cost: (self.total_cost - earlier.total_cost).max(0.0),
            cost_by_model,
            min_response_time: self.min_response_time,
            max_response_time: self.max_response_time,
            total_response_time: (self.total_response_time - earlier.total_response_time)
                .max(0.0),
            total_wait_time: (self.total_wait_time - earlier.total_wait_time).max(0.0),
            processing_time: (self.processing_time - earlier.processing_time).max(0.0),
            total_retries: self.total_retries - earlier.total_retries,
            peak_concurrency: self.peak_concurrency,
            errors_by_kind,
            api_rate_limits_detected: self.api_rate_limits_detected
                - earlier.api_rate_limits_detected,
            elapsed_secs: 0.0,
        }
    }
}

/// One finalized request, as fed to [`StatsManager::record_request`].
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub success: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cost: f64,
    /// Last attempt's API round-trip, seconds.
    pub api_response_time: f64,
    pub error_kind: Option<ErrorKind>,
    /// Attempts beyond the first.
    pub retry_count: u32,
    /// Whether this request hit a server rate limit during its life.
    pub api_rate_limit_detected: bool,
    /// Coordinated wait this request sat through, seconds.
    pub coordinated_wait: f64,
    /// Total wall time from submission to finalization, seconds.
    pub processing_time: f64,
    pub model: String,
}

/// Scope marker produced by `start_batch`.
#[derive(Debug)]
pub struct BatchHandle {
    pub batch_id: String,
    pub started: Instant,
    snapshot: Stats,
    batch_peak: usize,
}

#[derive(Debug)]
struct StatsInner {
    global: Stats,
    started: Instant,
    live_concurrency: usize,
    max_concurrent_limit: usize,
    batches: HashMap<String, BatchHandle>,
}

/// Process-wide statistics accumulator.
#[derive(Debug)]
pub struct StatsManager {
    inner: std::sync::Mutex<StatsInner>,
}

impl StatsManager {
    pub fn new(max_concurrent_limit: usize) -> Self {
        Self {
            inner: std::sync::Mutex::new(StatsInner {
                global: Stats::default(),
                started: Instant::now(),
                live_concurrency: 0,
                max_concurrent_limit: max_concurrent_limit.max(1),
                batches: HashMap::new(),
            }),
        }
    }

    /// Fold one finalized request into the global counters.
    pub fn record_request(&self, record: RequestRecord) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let stats = &mut inner.global;
        stats.total_requests += 1;
        if record.success {
            stats.successful_requests += 1;
            let t = record.api_response_time;
            stats.min_response_time = Some(stats.min_response_time.map_or(t, |m| m.min(t)));
            stats.max_response_time = Some(stats.max_response_time.map_or(t, |m| m.max(t)));
            stats.total_response_time += t;
        } else {
            stats.failed_requests += 1;
        }
        stats.input_tokens += record.input_tokens;
        stats.output_tokens += record.output_tokens;
        stats.cached_tokens += record.cached_tokens;
        stats.total_cost += record.cost;
        *stats.cost_by_model.entry(record.model).or_insert(0.0) += record.cost;
        stats.total_retries += record.retry_count as u64;
        stats.total_wait_time += record.coordinated_wait;
        stats.processing_time += record.processing_time;
        if let Some(kind) = record.error_kind {
            *stats.errors_by_kind.entry(kind).or_insert(0) += 1;
        }
        if record.api_rate_limit_detected {
            stats.api_rate_limits_detected += 1;
        }
    }

    /// Begin a batch scope. Fails on a duplicate id.
    pub fn start_batch(&self, batch_id: &str) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::config("statistics state poisoned"))?;
        if inner.batches.contains_key(batch_id) {
            return Err(Error::validation(format!(
                "batch '{batch_id}' is already active"
            )));
        }
        let snapshot = inner.global.clone();
        inner.batches.insert(
            batch_id.to_string(),
            BatchHandle {
                batch_id: batch_id.to_string(),
                started: Instant::now(),
                snapshot,
                batch_peak: 0,
            },
        );
        debug!(batch_id, "batch stats scope opened");
        Ok(())
    }

    /// Close a batch scope and return the stats covering only its window.
    pub fn end_batch(&self, batch_id: &str) -> Result<Stats> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::config("statistics state poisoned"))?;
        let handle = inner
            .batches
            .remove(batch_id)
            .ok_or_else(|| Error::validation(format!("unknown batch '{batch_id}'")))?;
        let mut stats = inner.global.diff(&handle.snapshot);
        stats.peak_concurrency = handle.batch_peak;
        stats.elapsed_secs = handle.started.elapsed().as_secs_f64();
        Ok(stats)
    }

    /// A task entered its API call. The live counter is clamped at the
    /// configured cap so it never overstates real concurrency.
    pub fn record_concurrent_start(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.live_concurrency = (inner.live_concurrency + 1).min(inner.max_concurrent_limit);
        let live = inner.live_concurrency;
        if live > inner.global.peak_concurrency {
            inner.global.peak_concurrency = live;
        }
        for handle in inner.batches.values_mut() {
            if live > handle.batch_peak {
                handle.batch_peak = live;
            }
        }
    }

    /// A task left its API call.
    pub fn record_concurrent_end(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.live_concurrency = inner.live_concurrency.saturating_sub(1);
        }
    }

    /// Current live in-flight count (test and report plumbing).
    pub fn live_concurrency(&self) -> usize {
        self.inner.lock().map(|i| i.live_concurrency).unwrap_or(0)
    }

    /// Clone out the global stats with the covered span filled in.
    pub fn global(&self) -> Stats {
        match self.inner.lock() {
            Ok(inner) => {
                let mut stats = inner.global.clone();
                stats.elapsed_secs = inner.started.elapsed().as_secs_f64();
                stats
            }
            Err(_) => Stats::default(),
        }
    }

    /// Explicitly reset all counters and drop any open batch scopes.
    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.global = Stats::default();
            inner.started = Instant::now();
            inner.live_concurrency = 0;
            inner.batches.clear();
        }
    }
}
