use thiserror::Error;

/// Engine tuning knobs. Limits bound resources that grow with client
/// misbehavior; correctness-bearing state (response caches, pending
/// event queues) is never truncated, only observed against the warning
/// threshold.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Queries allowed to wait for the applied index to catch up.
    pub max_pending_queries: usize,
    /// Pending-event queue depth at which a session is logged as lagging.
    pub event_queue_warn_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_pending_queries: 1_024,
            event_queue_warn_depth: 1_024,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pending_queries == 0 {
            return Err(ConfigError::InvalidPendingQueryLimit);
        }
        if self.event_queue_warn_depth == 0 {
            return Err(ConfigError::InvalidEventQueueWarnDepth);
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pending query limit must be non-zero")]
    InvalidPendingQueryLimit,
    #[error("event queue warning depth must be non-zero")]
    InvalidEventQueueWarnDepth,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let config = EngineConfig {
            max_pending_queries: 0,
            ..EngineConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPendingQueryLimit)
        );
    }
}
