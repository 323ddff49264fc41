// src/utils/backoff.rs
//! Exponential backoff for exchange reconnects
//!
//! `delay(n) = min(initial * multiplier^n, max)`, optionally with up to 25%
//! random jitter so that many engines do not reconnect in lockstep.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay
    pub max_delay_ms: u64,

    /// Growth factor between attempts
    pub multiplier: f64,

    /// Consecutive failures before the outage is reported to agents
    pub max_retries: u32,

    /// Add random jitter to each delay
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            max_retries: 5,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay_ms == 0 {
            return Err("reconnect.initial_delay_ms must be positive".to_string());
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err("reconnect.max_delay_ms must be >= initial_delay_ms".to_string());
        }
        if self.multiplier < 1.0 {
            return Err("reconnect.multiplier must be >= 1.0".to_string());
        }
        Ok(())
    }
}

/// Stateful backoff counter for one connection
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of consecutive failures recorded so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// True once `max_retries` consecutive failures have been recorded
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.config.max_retries
    }

    /// Record a failure and return how long to wait before retrying
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.initial_delay_ms as f64
            * self.config.multiplier.powi(attempt.min(32) as i32);
        let capped = base.min(self.config.max_delay_ms as f64);

        let millis = if self.config.jitter {
            let spread = capped * 0.25;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).clamp(0.0, self.config.max_delay_ms as f64)
        } else {
            capped
        };

        Duration::from_millis(millis as u64)
    }
}
