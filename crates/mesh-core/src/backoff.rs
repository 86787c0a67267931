//! Retry policy for dials that fail.
//!
//! A dial that cannot establish a channel is retried with exponential backoff
//! for as long as the peer is still wanted (announced by discovery or listed
//! as an initial peer) and the attempt budget lasts. Channels that close
//! after opening are not redialed here; the rendezvous layer re-announces
//! peers that come back.

use std::time::Duration;

/// Configuration for dial retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts including the first (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: Some(8),
        }
    }
}

impl ReconnectConfig {
    /// Never retry.
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(1),
            ..Default::default()
        }
    }
}

/// Delay before retry number `attempt` (1-based).
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Failed-dial bookkeeping for one peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryState {
    /// Failed attempts so far
    pub attempts: u32,
}

impl RetryState {
    /// Record a failure. Returns the delay before the next attempt, or
    /// `None` once the attempt budget is spent.
    pub fn record_failure(&mut self, config: &ReconnectConfig) -> Option<Duration> {
        self.attempts += 1;
        if config
            .max_attempts
            .map(|max| self.attempts >= max)
            .unwrap_or(false)
        {
            return None;
        }
        Some(calculate_backoff(self.attempts, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_is_capped() {
        let config = ReconnectConfig::default();
        let delays: Vec<_> = (1..=8).map(|n| calculate_backoff(n, &config)).collect();
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[2], Duration::from_secs(2));
        assert_eq!(delays[5], Duration::from_secs(16));
        assert_eq!(delays[6], Duration::from_secs(30));
        assert_eq!(delays[7], Duration::from_secs(30));
    }

    #[test]
    fn test_custom_factor() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 3.0,
            max_attempts: None,
        };
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(3));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(9));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(10));
    }

    #[test]
    fn test_retry_budget() {
        let config = ReconnectConfig {
            max_attempts: Some(3),
            ..Default::default()
        };
        let mut state = RetryState::default();
        assert_eq!(state.record_failure(&config), Some(Duration::from_millis(500)));
        assert_eq!(state.record_failure(&config), Some(Duration::from_secs(1)));
        assert_eq!(state.record_failure(&config), None);
        assert_eq!(state.attempts, 3);
    }

    #[test]
    fn test_disabled_never_retries() {
        let mut state = RetryState::default();
        assert_eq!(state.record_failure(&ReconnectConfig::disabled()), None);
    }

    #[test]
    fn test_unlimited_keeps_retrying() {
        let config = ReconnectConfig {
            max_attempts: None,
            ..Default::default()
        };
        let mut state = RetryState::default();
        for _ in 0..100 {
            assert!(state.record_failure(&config).is_some());
        }
    }
}
