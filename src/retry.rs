//! Retry policy: backoff growth and jitter
//!
//! The delay before retry `n` (0-indexed, i.e. after the `n+1`th failed
//! attempt) is derived from the attempt number alone and clamped to
//! `max_delay`; jitter is applied on top and never feeds back into later
//! delays.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

/// How the base delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Backoff {
    /// Always `initial_delay`
    Fixed,
    /// `initial_delay × (n + 1)`
    Linear,
    /// `initial_delay × factor^n`
    Exponential { factor: f64 },
}

/// Randomization applied to each delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Exact delays
    #[default]
    None,
    /// Uniform in `[0, delay]`
    Full,
    /// `delay/2 + uniform[0, delay/2]`
    Equal,
}

impl Jitter {
    /// Apply this jitter to a delay
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let ms = delay.as_millis() as u64;
                if ms == 0 {
                    return delay;
                }
                Duration::from_millis(rand::rng().random_range(0..=ms))
            }
            Jitter::Equal => {
                let half = delay.as_millis() as u64 / 2;
                if half == 0 {
                    return delay;
                }
                let extra = rand::rng().random_range(0..=half);
                Duration::from_millis(half + extra)
            }
        }
    }
}

/// Retry configuration for a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one (`0` behaves like `1`)
    pub max_attempts: u32,
    pub backoff: Backoff,
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential { factor: 2.0 },
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: Jitter::None,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fixed delay between a given number of attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed,
            initial_delay: delay,
            max_delay: delay,
            jitter: Jitter::None,
        }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Effective attempt budget
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retry number `retry` (0-indexed)
    pub fn delay(&self, retry: u32) -> Duration {
        let first = self.initial_delay.as_nanos() as f64;
        let unclamped = match self.backoff {
            Backoff::Fixed => first,
            Backoff::Linear => first * (retry as f64 + 1.0),
            Backoff::Exponential { factor } => {
                first * factor.powi(retry.min(i32::MAX as u32) as i32)
            }
        };

        let max = self.max_delay.as_nanos() as f64;
        let base = if !unclamped.is_finite() || unclamped < 0.0 || unclamped > max {
            self.max_delay
        } else {
            Duration::from_nanos(unclamped.round() as u64)
        };

        self.jitter.apply(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff: Backoff) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            backoff,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: Jitter::None,
        }
    }

    #[test]
    fn test_fixed_backoff() {
        let p = policy(Backoff::Fixed);
        for retry in 0..5 {
            assert_eq!(p.delay(retry), Duration::from_millis(100));
        }
    }

    #[test]
    fn test_linear_backoff() {
        let p = policy(Backoff::Linear);
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(4), Duration::from_millis(500));
    }

    #[test]
    fn test_exponential_backoff_clamped() {
        let p = policy(Backoff::Exponential { factor: 2.0 });
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(800));
        assert_eq!(p.delay(4), Duration::from_secs(1));
        assert_eq!(p.delay(60), Duration::from_secs(1));
    }

    #[test]
    fn test_equal_jitter_bounds() {
        let p = policy(Backoff::Fixed).with_jitter(Jitter::Equal);
        for _ in 0..100 {
            let d = p.delay(0);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_full_jitter_never_exceeds_base() {
        let p = policy(Backoff::Exponential { factor: 2.0 }).with_jitter(Jitter::Full);
        for retry in 0..8 {
            assert!(p.delay(retry) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let p = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(p.attempts(), 1);
    }
}
