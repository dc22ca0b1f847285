//! Error types for the conversation runtime.

use thiserror::Error;

/// Broad error category used for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Failures that are fed back to the model as a failed tool result.
    Tool,
    /// Transient provider or network failure; may succeed on retry.
    Network,
    /// The prompt exceeded the model's context window.
    ContextOverflow,
    /// Non-retryable provider failure.
    Provider,
    Configuration,
    Serialization,
    Session,
    Canceled,
    Unknown,
}

/// Primary error type for all runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool '{0}' is disabled for this session")]
    ToolDisabled(String),

    #[error("Permission denied for tool '{tool_name}'{}", reason_suffix(.reason))]
    PermissionDenied {
        tool_name: String,
        reason: Option<String>,
    },

    #[error("Permission request for tool '{tool_name}' timed out after {timeout_secs}s")]
    PermissionTimeout { tool_name: String, timeout_secs: u64 },

    #[error("Tool call rejected by hook: {message}")]
    HookRejected { message: String },

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Prompt too large: {0}")]
    PromptTooLarge(String),

    #[error("Provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("Compaction failed: {0}")]
    CompactionFailed(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Config file error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Session {0} is already processing a turn")]
    SessionBusy(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Operation canceled")]
    Canceled,
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(reason) if !reason.trim().is_empty() => format!(": {reason}"),
        _ => String::new(),
    }
}

impl RuntimeError {
    /// Create a fatal provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an API error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownTool(_)
            | Self::ToolDisabled(_)
            | Self::PermissionDenied { .. }
            | Self::PermissionTimeout { .. }
            | Self::HookRejected { .. }
            | Self::ToolExecution { .. } => ErrorCategory::Tool,
            Self::Network(_) | Self::RateLimited { .. } | Self::Timeout(_) => {
                ErrorCategory::Network
            }
            Self::Api { status, .. } => match status {
                408 | 429 | 500..=599 => ErrorCategory::Network,
                413 => ErrorCategory::ContextOverflow,
                _ => ErrorCategory::Provider,
            },
            Self::PromptTooLarge(_) => ErrorCategory::ContextOverflow,
            Self::Provider { .. } | Self::Stream(_) | Self::CompactionFailed(_) => {
                ErrorCategory::Provider
            }
            Self::Configuration(_) | Self::ConfigParse(_) | Self::InvalidArgument(_) => {
                ErrorCategory::Configuration
            }
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::SessionBusy(_) | Self::SessionNotFound(_) | Self::InvalidState(_) => {
                ErrorCategory::Session
            }
            Self::Canceled => ErrorCategory::Canceled,
            Self::Io(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether this error is reported to the model as a failed tool result
    /// instead of aborting the turn.
    pub fn is_tool_level(&self) -> bool {
        self.category() == ErrorCategory::Tool
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, RuntimeError>;
