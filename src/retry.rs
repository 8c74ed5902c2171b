//! Retry configuration and exponential backoff logic.
//!
//! Used wherever a broker-facing loop must survive transient failures
//! without ever giving up: the subscribe loop when (re)subscribing to the
//! response topic, and the Kafka consumer task on read errors.
//!
//! # Retry Strategy
//!
//! - Delays grow exponentially by `multiplier`, starting at `initial_delay`
//! - Delays are capped at `max_delay`
//! - Every delay gets ±25% randomized jitter to prevent thundering herd
//! - A successful step calls [`Backoff::reset`] so the next failure starts
//!   from `initial_delay` again

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::time::Duration;

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Backoff multiplier applied to the delay after each retry.
    ///
    /// Example: 2.0 doubles the delay each time (exponential backoff).
    pub multiplier: f32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retry attempts (caps exponential growth).
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    /// - `multiplier`: 2.0 (exponential backoff)
    /// - `initial_delay`: 100ms
    /// - `max_delay`: 10s
    fn default() -> Self {
        // ---
        Self {
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Stateful backoff sequence for one retrying loop.
///
/// There is no attempt limit; loops that must run for the process lifetime
/// keep asking for the next delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    // ---
    pub fn new(config: RetryConfig) -> Self {
        // ---
        let current = config.initial_delay;
        Self {
            config,
            current,
            attempt: 0,
        }
    }

    /// Number of consecutive failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Return the (jittered) delay to wait before the next attempt and
    /// advance the sequence.
    pub fn next_delay(&mut self) -> Duration {
        // ---
        self.attempt = self.attempt.saturating_add(1);
        let delay = apply_jitter(self.current);

        let next = Duration::from_secs_f64(
            self.current.as_secs_f64() * self.config.multiplier as f64,
        );
        self.current = next.min(self.config.max_delay);

        delay
    }

    /// Start over from `initial_delay` after a success.
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempt = 0;
    }
}

/// Apply ±25% jitter to a duration to prevent thundering herd.
///
/// Uses a simple multiplicative jitter: `delay * (0.75 + random(0.0..0.5))`
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    // Convert to 0.0..1.0 range
    let random_factor = (hash % 1000) as f64 / 1000.0;

    // 0.75x to 1.25x the original delay
    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}
