//! Retry delay policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::BackoffConfig;

/// Computes the delay before a retry.
///
/// `attempt` is 1 for the first retry, 2 for the second, and so on.
pub trait BackoffPolicy: Send + Sync {
    fn delay_for_attempt(&self, attempt: u32) -> Duration;
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * multiplier^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl BackoffStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed" => Some(Self::Fixed),
            "exponential" => Some(Self::Exponential),
            "linear" => Some(Self::Linear),
            _ => None,
        }
    }
}

/// Configurable backoff curve with a cap and optional deterministic jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryBackoff {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for RetryBackoff {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            strategy: config.strategy,
            base_delay: config.base_delay,
            multiplier: config.multiplier,
            max_delay: config.max_delay,
            jitter: config.jitter,
        }
    }
}

impl RetryBackoff {
    /// The same delay before every retry.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    fn uncapped(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let factor = self.multiplier.max(1.0).powi(exponent);
                Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
                    .unwrap_or(Duration::MAX)
            }
        }
    }

    /// Signed offset in `[-jitter, +jitter]` of the delay, fixed per attempt.
    fn spread(&self, attempt: u32, delay: Duration) -> f64 {
        if self.jitter <= 0.0 {
            return 0.0;
        }
        let phase = f64::from(attempt.wrapping_mul(2_654_435_761) % 1_001) / 1_000.0;
        delay.as_secs_f64() * self.jitter.min(1.0) * (2.0 * phase - 1.0)
    }
}

impl BackoffPolicy for RetryBackoff {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = self.uncapped(attempt).min(self.max_delay);
        let spread = self.spread(attempt, delay);
        if spread == 0.0 {
            return delay;
        }
        Duration::try_from_secs_f64((delay.as_secs_f64() + spread).max(0.0)).unwrap_or(delay)
    }
}
