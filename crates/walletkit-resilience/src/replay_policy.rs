//! Bounds for replaying undelivered events
//!
//! Decides whether a persisted event is still worth another delivery
//! attempt given how often it already failed and how old it is.

use crate::backoff::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cap on failed replay attempts per event
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default maximum age of a persisted event
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of checking a persisted event against a [`ReplayPolicy`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayVerdict {
    /// The event should be delivered again
    Replay,
    /// The event exhausted its retries
    RetriesExhausted {
        /// Failed attempts so far
        retry_count: u32,
    },
    /// The event is older than the allowed age
    Expired {
        /// Age of the event
        age: Duration,
    },
}

impl ReplayVerdict {
    /// Returns true if the event should be delivered again
    pub fn should_replay(&self) -> bool {
        matches!(self, ReplayVerdict::Replay)
    }
}

/// Replay bounds plus the schedule for background replays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayPolicy {
    /// Maximum failed attempts before an event is discarded
    pub max_retries: Option<u32>,
    /// Maximum age before an event is discarded
    pub max_age: Option<Duration>,
    /// Background replay schedule; `None` replays only when a handler registers
    pub schedule: Option<BackoffConfig>,
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(DEFAULT_MAX_RETRIES),
            max_age: Some(DEFAULT_MAX_AGE),
            schedule: Some(BackoffConfig::default()),
        }
    }
}

impl ReplayPolicy {
    /// Never discard events and never replay in the background
    pub fn unbounded() -> Self {
        Self {
            max_retries: None,
            max_age: None,
            schedule: None,
        }
    }

    /// Set the retry cap
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set the maximum age
    pub fn with_max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age);
        self
    }

    /// Set or clear the background replay schedule
    pub fn with_schedule(mut self, schedule: Option<BackoffConfig>) -> Self {
        self.schedule = schedule;
        self
    }

    /// Checks an event that failed `retry_count` times and is `age` old
    pub fn verdict(&self, retry_count: u32, age: Duration) -> ReplayVerdict {
        if let Some(max) = self.max_retries {
            if retry_count >= max {
                return ReplayVerdict::RetriesExhausted { retry_count };
            }
        }
        if let Some(max_age) = self.max_age {
            if age > max_age {
                return ReplayVerdict::Expired { age };
            }
        }
        ReplayVerdict::Replay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_bounded() {
        let policy = ReplayPolicy::default();
        assert_eq!(policy.max_retries, Some(10));
        assert!(policy.verdict(0, Duration::ZERO).should_replay());
        assert_eq!(
            policy.verdict(10, Duration::ZERO),
            ReplayVerdict::RetriesExhausted { retry_count: 10 }
        );
    }

    #[test]
    fn test_expired_events() {
        let policy = ReplayPolicy::default().with_max_age(Duration::from_secs(60));
        let verdict = policy.verdict(1, Duration::from_secs(61));
        assert_eq!(verdict, ReplayVerdict::Expired { age: Duration::from_secs(61) });
        assert!(!verdict.should_replay());
    }

    #[test]
    fn test_unbounded_policy_always_replays() {
        let policy = ReplayPolicy::unbounded();
        assert!(policy.verdict(u32::MAX, Duration::from_secs(u64::MAX / 2)).should_replay());
        assert!(policy.schedule.is_none());
    }
}
