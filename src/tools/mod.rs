//! Tool system for model function calling.

pub mod arguments;
pub mod registry;
pub mod tool;
pub mod types;

pub use arguments::ToolArguments;
pub use registry::{ToolFilter, ToolRegistry};
pub use tool::{AgentTool, Tool, ToolContext};
pub use types::{SchemaBuilder, StructuredData, ToolOutput, ToolResult, ToolSchema};
