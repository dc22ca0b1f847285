//! Provider error classification and retry backoff.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::config::RetryConfig;
use crate::error::{ErrorCategory, RuntimeError};

/// How the conversation loop should react to a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Likely to succeed on retry.
    TransientNetwork,
    /// The request exceeded the model's context window.
    PromptTooLong,
    Fatal,
}

static NETWORK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)econnreset|econnrefused|connection (reset|refused|closed|aborted)|etimedout|timed? ?out|enotfound|eai_again|dns|getaddrinfo|socket hang ?up|broken pipe|overloaded|rate.?limit|too many requests|service unavailable|bad gateway|gateway timeout|\b(429|502|503|504|529)\b",
    )
    .expect("network error regex must compile")
});

static PROMPT_TOO_LONG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)prompt is too long|input is too long|exceeds the context window|maximum context length|context.length.exceeded|too many tokens|request too large",
    )
    .expect("prompt-too-long regex must compile")
});

/// Classify a provider error message by known signatures.
pub fn classify_message(message: &str) -> ErrorClass {
    if PROMPT_TOO_LONG_RE.is_match(message) {
        ErrorClass::PromptTooLong
    } else if NETWORK_RE.is_match(message) {
        ErrorClass::TransientNetwork
    } else {
        ErrorClass::Fatal
    }
}

/// Classify a runtime error raised while talking to the provider.
pub fn classify_error(err: &RuntimeError) -> ErrorClass {
    match err {
        // A 400 carrying a context-length message is an overflow, not a bad request.
        RuntimeError::Api { message, .. } if PROMPT_TOO_LONG_RE.is_match(message) => {
            ErrorClass::PromptTooLong
        }
        _ => match err.category() {
            ErrorCategory::ContextOverflow => ErrorClass::PromptTooLong,
            ErrorCategory::Network => ErrorClass::TransientNetwork,
            ErrorCategory::Provider | ErrorCategory::Unknown => classify_message(&err.to_string()),
            ErrorCategory::Tool
            | ErrorCategory::Configuration
            | ErrorCategory::Serialization
            | ErrorCategory::Session
            | ErrorCategory::Canceled => ErrorClass::Fatal,
        },
    }
}

/// Exponential backoff for transient network failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed per turn, not counting the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_network_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        Duration::from_secs_f64(self.base_delay.as_secs_f64() * self.multiplier.powi(exponent))
    }
}

/// What to do after a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then retry. Carries the 1-based attempt number.
    Backoff { attempt: u32, delay: Duration },
    /// Compact the history, then retry.
    ForceCompact,
    Surface,
}

/// Per-turn retry bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    pub network_retries: u32,
    pub force_compacted: bool,
    /// Set once any visible output reached the transport this turn.
    pub has_streamed: bool,
}

impl RetryState {
    /// Decide how to react to `err`, updating the counters.
    pub fn on_error(&mut self, policy: &RetryPolicy, err: &RuntimeError) -> RetryDecision {
        match classify_error(err) {
            ErrorClass::TransientNetwork => {
                if self.has_streamed || self.network_retries >= policy.max_retries {
                    return RetryDecision::Surface;
                }
                self.network_retries += 1;
                RetryDecision::Backoff {
                    attempt: self.network_retries,
                    delay: policy.delay_for(self.network_retries),
                }
            }
            ErrorClass::PromptTooLong => {
                if self.force_compacted {
                    return RetryDecision::Surface;
                }
                self.force_compacted = true;
                self.network_retries = 0;
                RetryDecision::ForceCompact
            }
            ErrorClass::Fatal => RetryDecision::Surface,
        }
    }

    /// Reset after a successful provider response.
    pub fn on_success(&mut self) {
        self.network_retries = 0;
        self.force_compacted = false;
        self.has_streamed = false;
    }
}
