use std::time::{Duration, Instant};

use crate::PretrainError;

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Aborts the run once too many consecutive iterations were skipped
/// for gradient overflow. A single trusted update resets the streak.
#[derive(Debug, Clone)]
pub struct OverflowMonitor {
    limit: usize,
    consecutive_skips: usize,
}

impl OverflowMonitor {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            consecutive_skips: 0,
        }
    }

    pub fn consecutive_skips(&self) -> usize {
        self.consecutive_skips
    }

    pub fn check(&mut self, skipped: bool) -> Result<(), PretrainError> {
        if !skipped {
            self.consecutive_skips = 0;
            return Ok(());
        }
        self.consecutive_skips += 1;
        if self.consecutive_skips >= self.limit {
            return Err(PretrainError::runtime(format!(
                "aborting: {} consecutive iterations skipped on gradient overflow",
                self.consecutive_skips
            )));
        }
        Ok(())
    }
}

/// Rough gradient noise scale from the running mean and variance of
/// per-step global gradient norms: `B * var / mean^2`.
#[derive(Debug, Clone)]
pub struct GradientNoiseScale {
    batch_tokens: usize,
    norm_ema: ExponentialMovingAverage,
    norm_sq_ema: ExponentialMovingAverage,
}

impl GradientNoiseScale {
    pub fn new(batch_tokens: usize) -> Self {
        Self {
            batch_tokens,
            norm_ema: ExponentialMovingAverage::new(0.05),
            norm_sq_ema: ExponentialMovingAverage::new(0.05),
        }
    }

    pub fn update(&mut self, grad_norm: f64) -> Option<f64> {
        self.norm_ema.update(grad_norm);
        self.norm_sq_ema.update(grad_norm * grad_norm);
        self.estimate()
    }

    pub fn estimate(&self) -> Option<f64> {
        let mean = self.norm_ema.value()?;
        let mean_sq = self.norm_sq_ema.value()?;
        if mean.abs() < f64::EPSILON {
            return None;
        }
        let variance = (mean_sq - mean * mean).max(0.0);
        Some(self.batch_tokens as f64 * variance / (mean * mean))
    }
}

#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    tokens_processed: u64,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            tokens_processed: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, tokens: u64, loss: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.tokens_processed = self.tokens_processed.saturating_add(tokens);
        let step_tokens_per_sec = if step_duration > Duration::ZERO {
            tokens as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };
        let loss_avg = self.loss_ema.update(loss);
        let throughput_avg = self.throughput_ema.update(step_tokens_per_sec);

        StepSnapshot {
            loss: loss_avg,
            step_loss: loss,
            tokens,
            tokens_per_sec: throughput_avg,
            total_tokens: self.tokens_processed,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub loss: f64,
    pub step_loss: f64,
    pub tokens: u64,
    pub tokens_per_sec: f64,
    pub total_tokens: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

/// Resident set size in bytes from /proc, when available.
pub fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_monitor_aborts_after_limit() {
        let mut monitor = OverflowMonitor::new(3);
        assert!(monitor.check(true).is_ok());
        assert!(monitor.check(true).is_ok());
        assert!(monitor.check(true).is_err());
    }

    #[test]
    fn overflow_monitor_resets_on_success() {
        let mut monitor = OverflowMonitor::new(2);
        assert!(monitor.check(true).is_ok());
        assert!(monitor.check(false).is_ok());
        assert_eq!(monitor.consecutive_skips(), 0);
        assert!(monitor.check(true).is_ok());
        assert!(monitor.check(true).is_err());
    }

    #[test]
    fn ema_warms_up_to_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.update(4.0), 4.0);
        assert_eq!(ema.update(0.0), 2.0);
    }

    #[test]
    fn noise_scale_is_zero_for_constant_norms() {
        let mut noise = GradientNoiseScale::new(1024);
        for _ in 0..10 {
            noise.update(2.0);
        }
        let estimate = noise.estimate().unwrap();
        assert!(estimate.abs() < 1e-9);
    }

    #[test]
    fn noise_scale_grows_with_norm_variance() {
        let mut steady = GradientNoiseScale::new(100);
        let mut noisy = GradientNoiseScale::new(100);
        for i in 0..50 {
            steady.update(1.0);
            noisy.update(if i % 2 == 0 { 0.5 } else { 1.5 });
        }
        assert!(noisy.estimate().unwrap() > steady.estimate().unwrap());
    }
}
