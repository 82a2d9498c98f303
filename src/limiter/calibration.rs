//! Token-estimate calibration.
//!
//! Tracks observed-over-estimated token ratios in a bounded ring and
//! periodically folds them into a multiplicative correction factor applied
//! to every pre-call estimate.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// One observed (estimate, actual) pair.
#[derive(Debug, Clone, Copy)]
pub struct TokenUsageRecord {
    pub estimated: u64,
    pub actual: u64,
    pub at: Instant,
    /// actual / estimated; always > 0 (zero samples are discarded).
    pub ratio: f64,
}

#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// Clamp range for the correction factor.
    pub min_factor: f64,
    pub max_factor: f64,
    /// Ring capacity; oldest samples are evicted beyond this.
    pub history_capacity: usize,
    /// Recalibrate at least this often while samples arrive.
    pub recalibration_interval: Duration,
    /// ... or after this many new samples, whichever comes first.
    pub recalibration_samples: usize,
    /// Blend weight of the fresh weighted-mean ratio vs the prior factor.
    pub blend: f64,
    /// Factor changes below this are not worth a log line.
    pub log_delta_threshold: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_factor: 0.3,
            max_factor: 3.0,
            history_capacity: 1000,
            recalibration_interval: Duration::from_secs(300),
            recalibration_samples: 50,
            blend: 0.6,
            log_delta_threshold: 0.05,
        }
    }
}

impl CalibrationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factor_range(mut self, min: f64, max: f64) -> Self {
        self.min_factor = min;
        self.max_factor = max;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    pub fn with_recalibration_interval(mut self, interval: Duration) -> Self {
        self.recalibration_interval = interval;
        self
    }

    pub fn with_recalibration_samples(mut self, samples: usize) -> Self {
        self.recalibration_samples = samples.max(1);
        self
    }
}

/// Result of a recalibration that actually moved the factor.
#[derive(Debug, Clone, Copy)]
pub struct FactorChange {
    pub old: f64,
    pub new: f64,
}

impl FactorChange {
    /// Whether the move clears the logging threshold.
    pub fn is_meaningful(&self, threshold: f64) -> bool {
        (self.new - self.old).abs() > threshold
    }
}

#[derive(Debug)]
pub(crate) struct Calibration {
    cfg: CalibrationConfig,
    records: VecDeque<TokenUsageRecord>,
    factor: f64,
    last_recalibration: Instant,
    samples_since: usize,
}

impl Calibration {
    pub fn new(cfg: CalibrationConfig) -> Self {
        Self {
            cfg,
            records: VecDeque::new(),
            factor: 1.0,
            last_recalibration: Instant::now(),
            samples_since: 0,
        }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn samples(&self) -> usize {
        self.records.len()
    }

    /// Apply the current factor to a raw estimate.
    pub fn apply(&self, estimate: u64) -> u64 {
        (estimate as f64 * self.factor).round() as u64
    }

    /// Append a sample; returns a change when a recalibration fired and
    /// moved the factor.
    pub fn record(&mut self, estimated: u64, actual: u64) -> Option<FactorChange> {
        if estimated == 0 || actual == 0 {
            return None;
        }
        let record = TokenUsageRecord {
            estimated,
            actual,
            at: Instant::now(),
            ratio: actual as f64 / estimated as f64,
        };
        self.records.push_back(record);
        while self.records.len() > self.cfg.history_capacity {
            self.records.pop_front();
        }
        self.samples_since += 1;

        let due_by_time = self.last_recalibration.elapsed() >= self.cfg.recalibration_interval;
        let due_by_count = self.samples_since >= self.cfg.recalibration_samples;
        if due_by_time || due_by_count {
            self.recalibrate()
        } else {
            None
        }
    }

    /// Blend the recency-weighted mean ratio into the factor and clamp.
    fn recalibrate(&mut self) -> Option<FactorChange> {
        self.last_recalibration = Instant::now();
        self.samples_since = 0;

        if self.records.is_empty() {
            return None;
        }

        // Newer samples weigh more: weight i+1 over the ring in order.
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for (i, record) in self.records.iter().enumerate() {
            let weight = (i + 1) as f64;
            weighted_sum += record.ratio * weight;
            weight_total += weight;
        }
        let weighted_mean = weighted_sum / weight_total;

        let old = self.factor;
        let blended = self.cfg.blend * weighted_mean + (1.0 - self.cfg.blend) * old;
        self.factor = blended.clamp(self.cfg.min_factor, self.cfg.max_factor);

        if self.factor != old {
            Some(FactorChange {
                old,
                new: self.factor,
            })
        } else {
            None
        }
    }

    pub fn log_delta_threshold(&self) -> f64 {
        self.cfg.log_delta_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibration_every_sample() -> Calibration {
        Calibration::new(CalibrationConfig::new().with_recalibration_samples(1))
    }

    #[tokio::test]
    async fn test_factor_starts_neutral() {
        let cal = Calibration::new(CalibrationConfig::default());
        assert_eq!(cal.factor(), 1.0);
        assert_eq!(cal.apply(100), 100);
    }

    #[tokio::test]
    async fn test_underestimates_raise_factor() {
        let mut cal = calibration_every_sample();
        // actual is consistently 2x the estimate
        let change = cal.record(100, 200).unwrap();
        assert!(change.new > change.old);
        // blend 0.6: 0.6 * 2.0 + 0.4 * 1.0 = 1.6
        assert!((cal.factor() - 1.6).abs() < 1e-9);
        assert!(cal.apply(100) > 100);
    }

    #[tokio::test]
    async fn test_factor_clamped_to_range() {
        let mut cal = calibration_every_sample();
        for _ in 0..20 {
            cal.record(100, 10_000);
        }
        assert_eq!(cal.factor(), 3.0);

        let mut cal = calibration_every_sample();
        for _ in 0..20 {
            cal.record(10_000, 1);
        }
        assert_eq!(cal.factor(), 0.3);
    }

    #[tokio::test]
    async fn test_ring_is_bounded() {
        let mut cal = Calibration::new(
            CalibrationConfig::new()
                .with_history_capacity(10)
                .with_recalibration_samples(1000),
        );
        for _ in 0..100 {
            cal.record(100, 100);
        }
        assert_eq!(cal.samples(), 10);
    }

    #[tokio::test]
    async fn test_zero_samples_discarded() {
        let mut cal = calibration_every_sample();
        assert!(cal.record(0, 100).is_none());
        assert!(cal.record(100, 0).is_none());
        assert_eq!(cal.samples(), 0);
    }

    #[tokio::test]
    async fn test_recency_weighting_favors_late_samples() {
        let mut cal = Calibration::new(
            CalibrationConfig::new().with_recalibration_samples(4),
        );
        // three old 1.0 ratios, one fresh 2.0 ratio; weighted mean
        // (1+2+3+2*4)/10 = 1.4 beats the plain mean 1.25
        cal.record(100, 100);
        cal.record(100, 100);
        cal.record(100, 100);
        let change = cal.record(100, 200).unwrap();
        let expected = 0.6 * 1.4 + 0.4 * 1.0;
        assert!((change.new - expected).abs() < 1e-9);
    }
}
