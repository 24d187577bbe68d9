//! Reconnect delays for the fanout listeners.
//!
//! Attempt `n` (starting at 1) waits `initial * multiplier^(n-1)`, capped at
//! the maximum, optionally spread by a random jitter fraction.

use std::time::Duration;

use rand::Rng;

use crate::config::NotificationConfig;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay used as +/- jitter, 0.0 disables it
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl From<&NotificationConfig> for BackoffConfig {
    fn from(config: &NotificationConfig) -> Self {
        Self {
            initial_delay_ms: config.reconnect_initial_delay_ms,
            max_delay_ms: config.reconnect_max_delay_ms,
            ..Default::default()
        }
    }
}

impl BackoffConfig {
    /// Un-jittered delay for a 1-based attempt number
    fn base_delay_ms(&self, attempt: u32) -> f64 {
        let cap = self.max_delay_ms.max(1) as f64;
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        (self.initial_delay_ms as f64 * self.multiplier.powi(exponent)).clamp(1.0, cap)
    }
}

/// Per-listener backoff state; reset after every successful (re)connect.
#[derive(Debug, Clone, Default)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let base = self.config.base_delay_ms(self.attempt);

        let delay = if self.config.jitter_factor > 0.0 {
            let spread = base * self.config.jitter_factor;
            let jittered = base + rand::rng().random_range(-spread..=spread);
            jittered.clamp(1.0, self.config.max_delay_ms.max(1) as f64)
        } else {
            base
        };
        Duration::from_millis(delay as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
