//! Tool-related types: input schemas, outputs, normalized results.

use serde::{Deserialize, Serialize};

use crate::types::{ContentBlock, Message, StopReason, Usage};

/// JSON Schema describing a tool's input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub schema: serde_json::Value,
}

impl ToolSchema {
    /// Create from a raw JSON Schema value.
    pub fn from_schema(schema: serde_json::Value) -> Self {
        Self { schema }
    }

    /// An object schema with no properties.
    pub fn empty() -> Self {
        Self {
            schema: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": [],
            }),
        }
    }

    /// Builder: create an object schema with properties.
    pub fn object() -> SchemaBuilder {
        SchemaBuilder {
            properties: serde_json::Map::new(),
            required: Vec::new(),
        }
    }
}

/// Builder for object input schemas.
pub struct SchemaBuilder {
    properties: serde_json::Map<String, serde_json::Value>,
    required: Vec<String>,
}

impl SchemaBuilder {
    fn property(mut self, name: impl Into<String>, definition: serde_json::Value, required: bool) -> Self {
        let name = name.into();
        self.properties.insert(name.clone(), definition);
        if required {
            self.required.push(name);
        }
        self
    }

    pub fn string(self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        let definition = serde_json::json!({ "type": "string", "description": description.into() });
        self.property(name, definition, required)
    }

    pub fn integer(self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        let definition = serde_json::json!({ "type": "integer", "description": description.into() });
        self.property(name, definition, required)
    }

    pub fn boolean(self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        let definition = serde_json::json!({ "type": "boolean", "description": description.into() });
        self.property(name, definition, required)
    }

    /// Add a string property restricted to `values`.
    pub fn string_enum(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        values: &[&str],
        required: bool,
    ) -> Self {
        let definition = serde_json::json!({
            "type": "string",
            "description": description.into(),
            "enum": values,
        });
        self.property(name, definition, required)
    }

    pub fn build(self) -> ToolSchema {
        ToolSchema {
            schema: serde_json::json!({
                "type": "object",
                "properties": self.properties,
                "required": self.required,
            }),
        }
    }
}

/// Tool-specific side data attached to a result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum StructuredData {
    FileRead {
        path: String,
        lines: usize,
    },
    FileWrite {
        path: String,
        bytes_written: usize,
    },
    Shell {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    Search {
        pattern: String,
        matches: usize,
    },
    SubAgent {
        description: String,
        stop_reason: StopReason,
        usage: Usage,
    },
    Question {
        question: String,
        answer: String,
    },
    Other {
        name: String,
        data: serde_json::Value,
    },
}

/// What a tool's `execute` returns on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub structured: Option<StructuredData>,
    /// Messages appended to history verbatim after the tool-result message.
    pub extra_messages: Vec<Message>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_structured(mut self, structured: StructuredData) -> Self {
        self.structured = Some(structured);
        self
    }

    pub fn with_extra_messages(mut self, messages: Vec<Message>) -> Self {
        self.extra_messages = messages;
        self
    }
}

/// Normalized outcome of one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub success: bool,
    /// Output on success, error message on failure.
    pub content: String,
    pub structured: Option<StructuredData>,
    pub extra_messages: Vec<Message>,
}

impl ToolResult {
    pub fn success(output: ToolOutput) -> Self {
        Self {
            success: true,
            content: output.content,
            structured: output.structured,
            extra_messages: output.extra_messages,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: error.into(),
            structured: None,
            extra_messages: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.success
    }

    /// Build the `tool_result` block answering `tool_use_id`.
    pub fn to_content_block(&self, tool_use_id: &str) -> ContentBlock {
        ContentBlock::tool_result(tool_use_id, self.content.clone(), self.is_error())
    }
}
