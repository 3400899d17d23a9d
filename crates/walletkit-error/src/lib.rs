//! # WalletKit Error
//!
//! Unified error types for the WalletKit bridge SDK.
//!
//! Every fallible bridge operation returns [`WalletKitError`]. The variants
//! follow where a failure comes from rather than which call raised it:
//!
//! - [`WalletKitError::Bridge`] - the script returned an error envelope, or a
//!   local precondition failed
//! - [`WalletKitError::Decode`] - an inbound payload did not match its schema
//! - [`WalletKitError::Transport`] - the script host failed to load or evaluate
//! - [`WalletKitError::Storage`] - persistence I/O failed
//!
//! ## Example
//!
//! ```
//! use walletkit_error::{WalletKitError, Result};
//!
//! fn require_signature(signature: Option<&str>) -> Result<String> {
//!     signature
//!         .map(str::to_string)
//!         .ok_or_else(|| WalletKitError::bridge("No signature in response"))
//! }
//!
//! assert!(require_signature(None).is_err());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use thiserror::Error;

/// The main error type for WalletKit bridge operations.
///
/// The type is `Clone` so a single failure (for example a failed
/// initialization attempt) can be handed to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletKitError {
    /// The script host answered with an error, or a local precondition failed.
    ///
    /// Displays the bare message; application code shows it to users as is.
    #[error("{0}")]
    Bridge(String),

    /// An inbound event payload did not match the expected schema
    #[error("Failed to decode '{event_type}' event: {reason}")]
    Decode {
        /// The event type tag that failed to decode
        event_type: String,
        /// What was wrong with the payload
        reason: String,
    },

    /// The script host failed to load, evaluate, or was torn down
    #[error("Transport error: {0}")]
    Transport(String),

    /// Durable storage failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A caller-imposed deadline expired
    #[error("Operation '{operation}' timed out after {millis}ms")]
    Timeout {
        /// The operation that timed out
        operation: String,
        /// The timeout in milliseconds
        millis: u64,
    },

    /// JSON serialization or parsing failed
    #[error("JSON error: {0}")]
    Json(String),
}

/// Convenient Result type using WalletKitError
pub type Result<T> = std::result::Result<T, WalletKitError>;

impl WalletKitError {
    /// Creates a bridge error from any message
    pub fn bridge(message: impl Into<String>) -> Self {
        WalletKitError::Bridge(message.into())
    }

    /// Creates a transport error from any message
    pub fn transport(message: impl Into<String>) -> Self {
        WalletKitError::Transport(message.into())
    }

    /// Creates a storage error from any message
    pub fn storage(message: impl Into<String>) -> Self {
        WalletKitError::Storage(message.into())
    }

    /// Creates a decode error for an event type
    pub fn decode(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        WalletKitError::Decode {
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }

    /// Returns the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            WalletKitError::Bridge(_) => ErrorCode::Bridge,
            WalletKitError::Decode { .. } => ErrorCode::Decode,
            WalletKitError::Transport(_) => ErrorCode::Transport,
            WalletKitError::Storage(_) => ErrorCode::Storage,
            WalletKitError::Config(_) => ErrorCode::Config,
            WalletKitError::Timeout { .. } => ErrorCode::Timeout,
            WalletKitError::Json(_) => ErrorCode::Json,
        }
    }

    /// Returns true if the bridge instance that produced this error is unusable.
    ///
    /// A new bridge has to be constructed after a fatal error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WalletKitError::Transport(_))
    }

    /// Returns true if repeating the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WalletKitError::Timeout { .. } | WalletKitError::Storage(_)
        )
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Script-side or precondition failure
    Bridge = 1001,
    /// Event payload decode failure
    Decode = 2001,
    /// Script host transport failure
    Transport = 3001,
    /// Persistence failure
    Storage = 4001,
    /// Invalid configuration
    Config = 5001,
    /// Deadline expired
    Timeout = 6001,
    /// JSON failure
    Json = 7001,
}

/// Extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Wraps the error as a bridge error prefixed with `ctx`
    fn context(self, ctx: impl Into<String>) -> Result<T>;

    /// Same as [`ErrorContext::context`] with a lazily built message
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| WalletKitError::Bridge(format!("{}: {}", ctx.into(), e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| WalletKitError::Bridge(format!("{}: {}", f(), e)))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| WalletKitError::Bridge(ctx.into()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| WalletKitError::Bridge(f()))
    }
}

impl From<serde_json::Error> for WalletKitError {
    fn from(err: serde_json::Error) -> Self {
        WalletKitError::Json(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_error_displays_bare_message() {
        let err = WalletKitError::bridge("User rejected the request");
        assert_eq!(err.to_string(), "User rejected the request");
    }

    #[test]
    fn test_decode_error_display() {
        let err = WalletKitError::decode("connectRequest", "missing id");
        assert!(err.to_string().contains("connectRequest"));
        assert!(err.to_string().contains("missing id"));
    }

    #[test]
    fn test_error_code() {
        assert_eq!(WalletKitError::transport("gone").code(), ErrorCode::Transport);
        assert_eq!(ErrorCode::Storage as u32, 4001);
    }

    #[test]
    fn test_fatal_and_retryable() {
        assert!(WalletKitError::transport("bundle failed").is_fatal());
        assert!(!WalletKitError::bridge("nope").is_fatal());

        let timeout = WalletKitError::Timeout {
            operation: "getWallets".into(),
            millis: 500,
        };
        assert!(timeout.is_retryable());
        assert!(!WalletKitError::bridge("nope").is_retryable());
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file missing"));

        let err = result.context("Failed to load bundle").unwrap_err();
        assert!(err.to_string().contains("Failed to load bundle"));
        assert!(err.to_string().contains("file missing"));

        let missing: Option<u8> = None;
        assert_eq!(
            missing.context("no value").unwrap_err(),
            WalletKitError::bridge("no value")
        );
    }

    #[test]
    fn test_from_json_error() {
        let err: WalletKitError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.code(), ErrorCode::Json);
    }
}
