//! Caller-imposed timeouts
//!
//! Bridge calls have no built-in timeout; callers that need one wrap the
//! call future with these helpers.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Timeout error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Operation '{operation}' timed out after {duration:?}")]
pub struct TimeoutError {
    /// The operation that timed out
    pub operation: String,
    /// The timeout duration
    pub duration: Duration,
}

/// Execute a future with a timeout
pub async fn with_timeout<T>(
    duration: Duration,
    operation: impl Into<String>,
    future: impl Future<Output = T>,
) -> Result<T, TimeoutError> {
    let operation = operation.into();
    timeout(duration, future).await.map_err(|_| {
        tracing::debug!(operation = %operation, ?duration, "Operation timed out");
        TimeoutError {
            operation,
            duration,
        }
    })
}
