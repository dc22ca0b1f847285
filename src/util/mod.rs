//! Shared utilities.

pub mod retry;
pub mod timeout;

pub use retry::{classify_error, ErrorClass, RetryDecision, RetryPolicy, RetryState};
pub use timeout::with_timeout;
