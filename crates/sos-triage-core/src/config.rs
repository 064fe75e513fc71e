//! Runtime configuration.
//!
//! Resolved once by the host at startup and passed into the store, manager and
//! chat protocol. Nothing in the core reads environment variables.

use std::time::Duration;

use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Delay policy between intake-fetch attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed,
    /// Delay doubles after every retry
    Exponential,
}

/// How a professional's accept is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptPolicy {
    /// Plain field update after a client-side status check. A concurrent
    /// accept can overwrite the assignment.
    LastWriteWins,
    /// Conditional update that only applies while the case is still
    /// `Pending`; a losing accept fails with a conflict.
    RequirePending,
}

/// Who may release an accepted case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Any professional viewing the case
    AnyProfessional,
    /// Only the assigned professional
    AssigneeOnly,
}

/// Core configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TriageConfig {
    /// Attempts at reading intake answers before falling back to blanks
    pub intake_max_attempts: u32,
    /// Delay before the first retry
    pub intake_retry_delay: Duration,
    pub intake_backoff: Backoff,
    /// Upper bound on a completion call; `None` waits indefinitely
    pub completion_timeout: Option<Duration>,
    pub accept_policy: AcceptPolicy,
    pub release_policy: ReleasePolicy,
    /// SQLite busy timeout for file-backed stores
    pub busy_timeout: Duration,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            intake_max_attempts: 3,
            intake_retry_delay: Duration::from_millis(500),
            intake_backoff: Backoff::Fixed,
            completion_timeout: Some(Duration::from_secs(30)),
            accept_policy: AcceptPolicy::LastWriteWins,
            release_policy: ReleasePolicy::AnyProfessional,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl TriageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.intake_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "intake_max_attempts must be at least 1".into(),
            ));
        }
        if self.completion_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid(
                "completion_timeout must be non-zero; use None to disable".into(),
            ));
        }
        Ok(())
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn intake_delay_after(&self, attempt: u32) -> Duration {
        match self.intake_backoff {
            Backoff::Fixed => self.intake_retry_delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.intake_retry_delay.saturating_mul(factor)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = TriageConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.intake_max_attempts, 3);
        assert_eq!(config.accept_policy, AcceptPolicy::LastWriteWins);
        assert_eq!(config.release_policy, ReleasePolicy::AnyProfessional);
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let config = TriageConfig {
            intake_max_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let config = TriageConfig {
            completion_timeout: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_delays() {
        let mut config = TriageConfig {
            intake_retry_delay: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(config.intake_delay_after(1), Duration::from_millis(100));
        assert_eq!(config.intake_delay_after(3), Duration::from_millis(100));

        config.intake_backoff = Backoff::Exponential;
        assert_eq!(config.intake_delay_after(1), Duration::from_millis(100));
        assert_eq!(config.intake_delay_after(2), Duration::from_millis(200));
        assert_eq!(config.intake_delay_after(3), Duration::from_millis(400));
    }
}
