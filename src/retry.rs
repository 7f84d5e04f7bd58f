//! Reconnect policy for remote sessions
//!
//! A session that drops before its reply has been published may reconnect and
//! try again. Only SSH reconnects, a few times with a fixed pause; the other
//! protocols get [`RetryConfig::none`].
//!
//! # Example
//!
//! ```no_run
//! use remexec::retry::{RetryConfig, RetryState};
//! use std::time::Duration;
//!
//! let config = RetryConfig::fixed(3, Duration::from_secs(2));
//! let mut state = RetryState::new();
//!
//! if state.should_retry(&config) {
//!     let pause = state.calculate_delay(&config);
//!     state.record_retry();
//! }
//! ```

use std::time::Duration;
use tracing::warn;

/// Reconnect configuration for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Reconnects allowed after the initial attempt
    pub max_retries: u32,
    /// Pause before every reconnect
    pub delay: Duration,
}

impl RetryConfig {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Never reconnect
    pub fn none() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(2))
    }
}

/// Reconnects performed so far by one unit
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub retry_count: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection attempts made so far, counting the first
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn should_retry(&self, config: &RetryConfig) -> bool {
        self.retry_count < config.max_retries
    }

    pub fn calculate_delay(&self, config: &RetryConfig) -> Duration {
        config.delay
    }

    pub fn record_retry(&mut self) {
        self.retry_count += 1;
        warn!("Reconnecting, attempt {}", self.attempts());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_three_fixed_retries() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.delay, Duration::from_secs(2));
        assert!(config.is_enabled());
    }

    #[test]
    fn test_should_retry_until_exhausted() {
        let config = RetryConfig::fixed(3, Duration::from_secs(2));
        let mut state = RetryState::new();

        for _ in 0..3 {
            assert!(state.should_retry(&config));
            assert_eq!(state.calculate_delay(&config), Duration::from_secs(2));
            state.record_retry();
        }
        assert!(!state.should_retry(&config));
        assert_eq!(state.attempts(), 4);
    }

    #[test]
    fn test_none_never_retries() {
        let config = RetryConfig::none();
        assert!(!config.is_enabled());
        assert!(!RetryState::new().should_retry(&config));
    }
}
