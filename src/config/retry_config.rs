use serde::Deserialize;
use std::time::Duration;

use crate::config::ConfigError;

/// Back-off schedule: one attempt per entry plus the initial one.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    #[serde(default = "default_delays_ms")]
    pub delays_ms: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delays_ms: default_delays_ms(),
        }
    }
}

impl RetryConfig {
    pub fn from_millis(delays_ms: impl Into<Vec<u64>>) -> Self {
        Self {
            delays_ms: delays_ms.into(),
        }
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays_ms.iter().copied().map(Duration::from_millis).collect()
    }

    /// Delay before retry number `attempt` (1-based), clamped to the last entry
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) as usize - 1).min(self.delays_ms.len().saturating_sub(1));
        self.delays_ms
            .get(index)
            .copied()
            .map(Duration::from_millis)
            .unwrap_or_default()
    }

    pub fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.delays_ms.is_empty() {
            return Err(ConfigError::EmptyRetryDelays(section.to_string()));
        }
        Ok(())
    }
}

fn default_delays_ms() -> Vec<u64> {
    vec![250, 500, 1000]
}
