//! Adaptive request pacing.
//!
//! Two-mode delay controller: normal pacing while requests succeed, slow
//! pacing after a streak of consecutive failures. A single success restores
//! normal mode immediately.

use std::time::Duration;

use rand::Rng;

use crate::config::{CrawlerConfig, DelayRange};

#[derive(Debug)]
pub struct RateController {
    normal_delay: DelayRange,
    slow_delay: DelayRange,
    failure_threshold: u32,
    consecutive_failures: u32,
    slow_mode: bool,
}

impl RateController {
    pub fn new(config: &CrawlerConfig) -> Self {
        Self {
            normal_delay: config.normal_delay,
            slow_delay: config.slow_delay,
            failure_threshold: config.failure_threshold.max(1),
            consecutive_failures: 0,
            slow_mode: false,
        }
    }

    /// Record a failed attempt; crossing the threshold enters slow mode.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if !self.slow_mode && self.consecutive_failures >= self.failure_threshold {
            self.slow_mode = true;
            log::warn!(
                "{} consecutive failures, entering slow mode ({:?}-{:?} delays)",
                self.consecutive_failures,
                self.slow_delay.min,
                self.slow_delay.max
            );
        }
    }

    /// Record a success: the failure streak resets and slow mode ends.
    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            log::debug!(
                "request succeeded, resetting failure streak (was {})",
                self.consecutive_failures
            );
            self.consecutive_failures = 0;
        }
        if self.slow_mode {
            self.slow_mode = false;
            log::info!("request succeeded, resuming normal pacing");
        }
    }

    pub fn slow_mode(&self) -> bool {
        self.slow_mode
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Sample the delay for the next attempt. Retries scale the sampled
    /// delay linearly with the attempt number.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let range = if self.slow_mode {
            self.slow_delay
        } else {
            self.normal_delay
        };
        let base = sample(range);
        if attempt == 0 {
            base
        } else {
            base * (attempt + 1)
        }
    }

    /// Delay bounds currently in effect.
    pub fn current_bounds(&self) -> DelayRange {
        if self.slow_mode {
            self.slow_delay
        } else {
            self.normal_delay
        }
    }
}

fn sample(range: DelayRange) -> Duration {
    if range.max <= range.min {
        return range.min;
    }
    let secs = rand::thread_rng().gen_range(range.min.as_secs_f64()..=range.max.as_secs_f64());
    Duration::from_secs_f64(secs)
}
