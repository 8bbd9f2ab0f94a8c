//! Exponential backoff for transport re-registration.
//!
//! The Bluetooth stack disappears whenever bluetoothd restarts; the mux
//! re-registers with growing delays instead of hammering the bus.

use std::time::{Duration, SystemTime};

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for the delay.
    pub max_delay: Duration,
    /// Factor applied after each failure.
    pub growth_factor: f64,
    /// Fraction (0.0–1.0) of the delay added as jitter.
    pub jitter_factor: f64,
    /// Give up after this many attempts (`None` = retry forever).
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            growth_factor: 2.0,
            jitter_factor: 0.1,
            max_retries: None,
        }
    }
}

/// Backoff state for one registration attempt series.
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    /// Fresh series.
    pub fn new(config: ReconnectConfig) -> Backoff {
        Backoff { config, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` when retries are spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_retries {
            if self.attempt >= max {
                return None;
            }
        }
        let exp = self
            .config
            .initial_delay
            .as_secs_f64()
            * self.config.growth_factor.powi(self.attempt as i32);
        let capped = exp.min(self.config.max_delay.as_secs_f64());
        self.attempt += 1;
        Some(Duration::from_secs_f64(capped + jitter(capped, self.config.jitter_factor)))
    }

    /// A successful registration resets the series.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Cheap jitter from the subsecond clock; good enough to de-synchronize
/// retry storms without pulling in a RNG.
fn jitter(base: f64, factor: f64) -> f64 {
    if factor <= 0.0 {
        return 0.0;
    }
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    base * factor * (f64::from(nanos % 1000) / 1000.0)
}
