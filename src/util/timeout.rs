//! Timeout helper.

use std::future::Future;
use std::time::Duration;

use crate::error::RuntimeError;

/// Wrap a future with a timeout, mapping expiry to [`RuntimeError::Timeout`].
pub async fn with_timeout<T>(
    duration: Duration,
    future: impl Future<Output = Result<T, RuntimeError>>,
) -> Result<T, RuntimeError> {
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::Timeout(duration.as_millis() as u64)),
    }
}
