// Listener queue configuration
//
// A session hands its queue settings to every listener it creates.

use crate::error::{EventError, EventResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of events a listener queue holds before overflowing
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default time a blocking producer waits for queue space
pub const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 100;

/// What a broadcast does when a listener's queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the new event and bump the listener's overflow counter
    #[default]
    Drop,
    /// Wait up to `block_timeout_ms` for the consumer to drain, then drop
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    pub block_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::Drop,
            block_timeout_ms: DEFAULT_BLOCK_TIMEOUT_MS,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> EventResult<()> {
        if self.capacity == 0 {
            return Err(EventError::InvalidConfig(
                "queue capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub queue: QueueConfig,
}

impl SessionConfig {
    pub fn validate(&self) -> EventResult<()> {
        self.queue.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.queue.capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.queue.overflow, OverflowPolicy::Drop);
        assert_eq!(config.queue.block_timeout(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = QueueConfig {
            capacity: 0,
            ..QueueConfig::default()
        };
        assert!(matches!(config.validate(), Err(EventError::InvalidConfig(_))));
    }
}
