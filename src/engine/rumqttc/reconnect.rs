//! Reconnection backoff policy for engine-driven reconnects
//!
//! rumqttc re-dials the broker on the next `poll()` after a connection error.
//! The supervisor sleeps between polls according to this policy so a dead broker
//! is not hammered.

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay used once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given attempt (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    /// Decide whether another reconnection attempt should be made
    pub fn decide(&self, attempts_so_far: u32, shutdown_requested: bool) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = self.max_attempts {
            if attempts_so_far >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = attempts_so_far + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: self.backoff_delay(attempt),
        }
    }
}

/// Outcome of [`ReconnectConfig::decide`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_pattern() {
        let config = ReconnectConfig::default();

        assert_eq!(config.backoff_delay(1), 25);
        assert_eq!(config.backoff_delay(2), 50);
        assert_eq!(config.backoff_delay(3), 100);
        assert_eq!(config.backoff_delay(4), 250);
        assert_eq!(config.backoff_delay(5), 250);
        assert_eq!(config.backoff_delay(100), 250);
    }

    #[test]
    fn test_empty_pattern_uses_sustained_delay() {
        let config = ReconnectConfig {
            backoff_pattern: Vec::new(),
            sustained_delay: 500,
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(1), 500);
    }

    #[test]
    fn test_decide() {
        let config = ReconnectConfig {
            max_attempts: Some(2),
            ..Default::default()
        };

        assert_eq!(
            config.decide(0, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 25
            }
        );
        assert_eq!(
            config.decide(0, true),
            ReconnectionDecision::AbortShutdownRequested
        );
        assert_eq!(
            config.decide(2, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_unlimited_attempts_never_abort() {
        let config = ReconnectConfig::default();
        assert!(matches!(
            config.decide(10_000, false),
            ReconnectionDecision::Proceed { attempt: 10_001, .. }
        ));
    }
}
