//! # WalletKit Resilience
//!
//! Retry and timeout building blocks for the WalletKit bridge:
//!
//! - **Exponential Backoff**: spacing between background replays of
//!   undelivered events
//! - **Replay Policy**: when a persisted event stops being worth replaying
//! - **Timeouts**: caller-imposed deadlines around bridge calls
//!
//! ## Example
//!
//! ```rust
//! use walletkit_resilience::{BackoffConfig, ExponentialBackoff, ReplayPolicy};
//! use std::time::Duration;
//!
//! let policy = ReplayPolicy::default().with_max_retries(3);
//! assert!(policy.verdict(2, Duration::from_secs(5)).should_replay());
//! assert!(!policy.verdict(3, Duration::from_secs(5)).should_replay());
//!
//! let schedule = BackoffConfig::new()
//!     .with_initial_delay(Duration::from_millis(100))
//!     .with_jitter(0.0)
//!     .with_max_attempts(2);
//! let delays: Vec<_> = ExponentialBackoff::new(schedule).collect();
//! assert_eq!(delays, vec![Duration::from_millis(100), Duration::from_millis(200)]);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod replay_policy;
pub mod timeout;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use replay_policy::{ReplayPolicy, ReplayVerdict, DEFAULT_MAX_AGE, DEFAULT_MAX_RETRIES};
pub use timeout::{with_timeout, TimeoutError};
