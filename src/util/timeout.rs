//! Timeout helper.

use std::future::Future;
use std::time::Duration;

use crate::error::TetherError;

/// Wrap a future with a timeout. Expiry is reported as a `RequestTimeout`
/// for `operation`.
pub async fn with_timeout<T>(
    duration: Duration,
    operation: &str,
    future: impl Future<Output = Result<T, TetherError>>,
) -> Result<T, TetherError> {
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(TetherError::RequestTimeout {
            method: operation.to_string(),
            timeout_ms: duration.as_millis() as u64,
        }),
    }
}
