//! Replay spacing
//!
//! Background replays of undelivered events back off exponentially while
//! events stay undelivered; the schedule restarts once the table drains.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shape of a backoff schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Relative spread applied to each delay, in `0.0..=1.0`
    pub jitter: f64,
    /// Number of delays before the schedule ends; `None` never ends
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    /// Default schedule: 5s doubling up to 5 minutes, 20% jitter
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the first delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the delay cap
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter, clamped to `0.0..=1.0`
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = sanitize_jitter(jitter);
        self
    }

    /// Ends the schedule after `attempts` delays
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay before attempt `attempt` (zero based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(if secs.is_finite() { secs.min(cap) } else { cap })
    }
}

/// NaN counts as no jitter; anything else is clamped to `0.0..=1.0`
fn sanitize_jitter(jitter: f64) -> f64 {
    if jitter.is_nan() {
        0.0
    } else {
        jitter.clamp(0.0, 1.0)
    }
}

/// Stateful walk over a [`BackoffConfig`], yielding one delay per step
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Starts at the first delay of `config`.
    ///
    /// The jitter is sanitized here too, since deserialized configs skip
    /// [`BackoffConfig::with_jitter`].
    pub fn new(mut config: BackoffConfig) -> Self {
        config.jitter = sanitize_jitter(config.jitter);
        Self { config, attempt: 0 }
    }

    /// Delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns false once `max_attempts` delays were handed out
    pub fn can_retry(&self) -> bool {
        match self.config.max_attempts {
            Some(max) => self.attempt < max,
            None => true,
        }
    }

    /// Restarts from the first delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let spread = sanitize_jitter(self.config.jitter);
        if spread <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        Duration::from_secs_f64(delay.as_secs_f64() * factor).min(self.config.max_delay)
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }
        let delay = self.jittered(self.config.delay_for(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }
}
