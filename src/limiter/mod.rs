//! 自适应限流模块：滚动每分钟令牌预算、估算校准与全局协调暂停。
//!
//! # Adaptive Rate Limiter Module
//!
//! A single-process gate in front of the chat endpoint with three jobs:
//!
//! - **Proactive TPM gate** — a rolling per-minute token budget. `acquire`
//!   charges a calibrated estimate against the current minute and sleeps to
//!   the minute boundary when the budget would overflow.
//! - **Calibration** — every observed call feeds an actual-over-estimated
//!   ratio into a bounded ring; the blended factor corrects future
//!   estimates (see [`calibration`]).
//! - **Coordinated pause** — when the server reports a rate limit, a
//!   global time-bounded pause is installed *synchronously*; every
//!   `acquire` sleeps through it before touching the token budget.
//!
//! Two locks guard the state: the pause lock and the token-window lock.
//! The pause lock is acquired first when both are needed, and neither is
//! ever held across a sleep.

mod calibration;
mod wait_hint;

pub use calibration::{CalibrationConfig, FactorChange, TokenUsageRecord};
pub use wait_hint::{is_rate_limit, wait_hint, DEFAULT_WAIT};

use calibration::Calibration;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Tokens-per-minute ceiling.
    pub max_tpm: u64,
    /// Whether observed usage recalibrates estimates.
    pub adaptive_calibration: bool,
    pub calibration: CalibrationConfig,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tpm: 180_000,
            adaptive_calibration: true,
            calibration: CalibrationConfig::default(),
        }
    }
}

impl RateLimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tpm(mut self, max_tpm: u64) -> Self {
        self.max_tpm = max_tpm.max(1);
        self
    }

    pub fn with_adaptive_calibration(mut self, enable: bool) -> Self {
        self.adaptive_calibration = enable;
        self
    }

    pub fn with_calibration(mut self, calibration: CalibrationConfig) -> Self {
        self.calibration = calibration;
        self
    }
}

#[derive(Debug)]
struct TokenWindow {
    tokens_used: u64,
    minute_start: Instant,
}

#[derive(Debug)]
struct PauseState {
    pause_until: Option<Instant>,
    api_rate_limits_detected: u64,
    /// Set on the first rate-limit report of an event, cleared by the next
    /// successful request; gates event logging to one line per event.
    event_active: bool,
}

/// Point-in-time view of the limiter, for logs and reports.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub max_tpm: u64,
    pub tokens_used_this_minute: u64,
    pub calibration_factor: f64,
    pub calibration_samples: usize,
    pub paused: bool,
    pub pause_remaining_ms: Option<u64>,
    pub api_rate_limits_detected: u64,
}

pub struct AdaptiveRateLimiter {
    cfg: RateLimiterConfig,
    pause: Mutex<PauseState>,
    window: Mutex<TokenWindow>,
    calibration: Mutex<Calibration>,
}

impl AdaptiveRateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let calibration = Calibration::new(cfg.calibration.clone());
        Self {
            cfg,
            pause: Mutex::new(PauseState {
                pause_until: None,
                api_rate_limits_detected: 0,
                event_active: false,
            }),
            window: Mutex::new(TokenWindow {
                tokens_used: 0,
                minute_start: Instant::now(),
            }),
            calibration: Mutex::new(calibration),
        }
    }

    /// Wait until a request with `estimated_tokens` may go out, then charge
    /// the calibrated estimate against the current minute. Returns the
    /// calibrated estimate for accounting.
    pub async fn acquire(&self, estimated_tokens: u64) -> u64 {
        let calibrated = {
            let cal = self.calibration.lock().await;
            cal.apply(estimated_tokens)
        };

        self.wait_out_pause().await;

        // Proactive TPM gate. Compute the wait inside the lock, sleep
        // outside it, re-check on wake.
        loop {
            let wait = {
                let mut win = self.window.lock().await;
                let now = Instant::now();
                if now.duration_since(win.minute_start) >= MINUTE {
                    win.minute_start = now;
                    win.tokens_used = 0;
                }
                if win.tokens_used > 0 && win.tokens_used + calibrated > self.cfg.max_tpm {
                    Some(MINUTE - now.duration_since(win.minute_start))
                } else {
                    // An oversized single request on an empty window is
                    // admitted; waiting would never make it fit.
                    win.tokens_used += calibrated;
                    None
                }
            };
            match wait {
                Some(delay) => {
                    debug!(
                        delay_ms = delay.as_millis() as u64,
                        tokens = calibrated,
                        "minute token budget exhausted, waiting for window reset"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => break,
            }
        }

        calibrated
    }

    /// Sleep through an active coordinated pause, if any.
    async fn wait_out_pause(&self) {
        loop {
            let wait = {
                let mut pause = self.pause.lock().await;
                match pause.pause_until {
                    Some(until) => {
                        let now = Instant::now();
                        if now < until {
                            Some(until - now)
                        } else {
                            pause.pause_until = None;
                            info!("coordinated pause ended, resuming requests");
                            None
                        }
                    }
                    None => None,
                }
            };
            match wait {
                Some(delay) => tokio::time::sleep(delay).await,
                None => break,
            }
        }
    }

    /// Record a server-reported rate limit and install (or extend) the
    /// coordinated pause before returning, so no concurrent `acquire` can
    /// slip through after this call completes.
    pub async fn record_api_rate_limit(&self, wait: Duration, context: &str) {
        let mut pause = self.pause.lock().await;
        pause.api_rate_limits_detected += 1;

        let until = Instant::now() + wait;
        let installed = match pause.pause_until {
            // An existing, longer pause already covers this report.
            Some(existing) if existing >= until => false,
            _ => {
                pause.pause_until = Some(until);
                true
            }
        };

        if !pause.event_active {
            pause.event_active = true;
            warn!(
                wait_secs = wait.as_secs_f64(),
                context,
                "server rate limit reported, coordinated pause installed"
            );
        } else if installed {
            debug!(
                wait_secs = wait.as_secs_f64(),
                context, "coordinated pause extended"
            );
        }
    }

    /// Feed one observed call into the calibration ring.
    pub async fn record_usage(&self, estimated_tokens: u64, actual_tokens: u64) {
        if !self.cfg.adaptive_calibration {
            return;
        }
        let change = {
            let mut cal = self.calibration.lock().await;
            let threshold = cal.log_delta_threshold();
            cal.record(estimated_tokens, actual_tokens)
                .filter(|c| c.is_meaningful(threshold))
        };
        if let Some(change) = change {
            info!(
                old_factor = format!("{:.3}", change.old).as_str(),
                new_factor = format!("{:.3}", change.new).as_str(),
                "token estimate calibration factor updated"
            );
        }
    }

    /// Clear the rate-limit event flag; the next server report logs again.
    pub async fn record_successful_request(&self) {
        let mut pause = self.pause.lock().await;
        pause.event_active = false;
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        // Lock order: pause first, then window, then calibration.
        let (paused, pause_remaining_ms, detected) = {
            let pause = self.pause.lock().await;
            let now = Instant::now();
            let remaining = pause
                .pause_until
                .filter(|until| *until > now)
                .map(|until| (until - now).as_millis() as u64);
            (
                remaining.is_some(),
                remaining,
                pause.api_rate_limits_detected,
            )
        };
        let tokens_used = {
            let win = self.window.lock().await;
            if win.minute_start.elapsed() >= MINUTE {
                0
            } else {
                win.tokens_used
            }
        };
        let (factor, samples) = {
            let cal = self.calibration.lock().await;
            (cal.factor(), cal.samples())
        };
        RateLimiterSnapshot {
            max_tpm: self.cfg.max_tpm,
            tokens_used_this_minute: tokens_used,
            calibration_factor: factor,
            calibration_samples: samples,
            paused,
            pause_remaining_ms,
            api_rate_limits_detected: detected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_tpm: u64) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(RateLimiterConfig::new().with_max_tpm(max_tpm))
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_within_budget_does_not_wait() {
        let rl = limiter(1000);
        let before = Instant::now();
        rl.acquire(400).await;
        rl.acquire(400).await;
        assert_eq!(before.elapsed(), Duration::ZERO);
        assert_eq!(rl.snapshot().await.tokens_used_this_minute, 800);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_over_budget_waits_for_minute_boundary() {
        let rl = limiter(1000);
        rl.acquire(800).await;
        let before = Instant::now();
        rl.acquire(800).await;
        assert!(before.elapsed() >= Duration::from_secs(59));
        // window was reset, only the second request is charged
        assert_eq!(rl.snapshot().await.tokens_used_this_minute, 800);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_admitted_on_empty_window() {
        let rl = limiter(100);
        let before = Instant::now();
        let granted = rl.acquire(500).await;
        assert_eq!(granted, 500);
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinated_pause_blocks_acquire() {
        let rl = limiter(100_000);
        rl.record_api_rate_limit(Duration::from_secs(5), "test").await;
        let before = Instant::now();
        rl.acquire(10).await;
        assert!(before.elapsed() >= Duration::from_secs(5));
        let snap = rl.snapshot().await;
        assert!(!snap.paused);
        assert_eq!(snap.api_rate_limits_detected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_pause_does_not_shrink_existing() {
        let rl = limiter(100_000);
        rl.record_api_rate_limit(Duration::from_secs(10), "first").await;
        rl.record_api_rate_limit(Duration::from_secs(2), "second").await;
        let snap = rl.snapshot().await;
        assert!(snap.paused);
        assert!(snap.pause_remaining_ms.unwrap() > 8_000);
        assert_eq!(snap.api_rate_limits_detected, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_longer_pause_extends_existing() {
        let rl = limiter(100_000);
        rl.record_api_rate_limit(Duration::from_secs(2), "first").await;
        rl.record_api_rate_limit(Duration::from_secs(30), "second").await;
        let snap = rl.snapshot().await;
        assert!(snap.pause_remaining_ms.unwrap() > 20_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_waiters_released_after_one_pause() {
        use std::sync::Arc;
        let rl = Arc::new(limiter(100_000));
        rl.record_api_rate_limit(Duration::from_secs(3), "test").await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let rl = rl.clone();
            handles.push(tokio::spawn(async move { rl.acquire(10).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(!rl.snapshot().await.paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibration_disabled_keeps_neutral_factor() {
        let rl = AdaptiveRateLimiter::new(
            RateLimiterConfig::new()
                .with_max_tpm(100_000)
                .with_adaptive_calibration(false),
        );
        for _ in 0..100 {
            rl.record_usage(100, 300).await;
        }
        assert_eq!(rl.snapshot().await.calibration_factor, 1.0);
        assert_eq!(rl.snapshot().await.calibration_samples, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibrated_estimate_charged_to_window() {
        let rl = AdaptiveRateLimiter::new(
            RateLimiterConfig::new()
                .with_max_tpm(100_000)
                .with_calibration(CalibrationConfig::new().with_recalibration_samples(1)),
        );
        // drive factor up: actuals double the estimates
        rl.record_usage(100, 200).await;
        let granted = rl.acquire(100).await;
        assert!(granted > 100);
        assert_eq!(rl.snapshot().await.tokens_used_this_minute, granted);
    }
}
