//! Typed access to tool call input.

use crate::error::RuntimeError;

/// Wrapper around a tool call's JSON input providing typed extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolArguments {
    value: serde_json::Value,
}

impl ToolArguments {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Parse the concatenated argument fragments of a streamed tool call.
    ///
    /// Empty or unparsable payloads (and non-object JSON) become `{}` and
    /// the second tuple element reports whether parsing succeeded.
    pub fn from_fragments(raw: &str) -> (Self, bool) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return (Self::empty(), true);
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value @ serde_json::Value::Object(_)) => (Self { value }, true),
            _ => (Self::empty(), false),
        }
    }

    /// An empty input object.
    pub fn empty() -> Self {
        Self {
            value: serde_json::json!({}),
        }
    }

    /// Get the raw JSON value.
    pub fn raw(&self) -> &serde_json::Value {
        &self.value
    }

    pub fn into_value(self) -> serde_json::Value {
        self.value
    }

    /// Get a string argument by key.
    pub fn get_str(&self, key: &str) -> Result<&str, RuntimeError> {
        self.value
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| RuntimeError::InvalidArgument(format!("Missing string argument: {key}")))
    }

    /// Get an optional string argument.
    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(|v| v.as_str())
    }

    /// Get an unsigned integer argument.
    pub fn get_u64(&self, key: &str) -> Result<u64, RuntimeError> {
        self.value
            .get(key)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                RuntimeError::InvalidArgument(format!("Missing integer argument: {key}"))
            })
    }

    /// Get a boolean argument, falling back to `default` when absent.
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.value
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    /// Get an array argument.
    pub fn get_array(&self, key: &str) -> Result<&Vec<serde_json::Value>, RuntimeError> {
        self.value
            .get(key)
            .and_then(|v| v.as_array())
            .ok_or_else(|| RuntimeError::InvalidArgument(format!("Missing array argument: {key}")))
    }

    /// Deserialize the entire input into a typed struct.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T, RuntimeError> {
        serde_json::from_value(self.value.clone()).map_err(|e| {
            RuntimeError::InvalidArgument(format!("Failed to deserialize arguments: {e}"))
        })
    }
}

impl From<serde_json::Value> for ToolArguments {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value)
    }
}
