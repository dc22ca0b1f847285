//! Model provider trait.
//!
//! Concrete HTTP clients live outside this crate; the runtime only consumes
//! the streaming contract below.

pub mod scripted;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::types::{Message, StreamEvent};

pub use scripted::{ScriptedCall, ScriptedError, ScriptedProvider};

/// A request sent to a model provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    /// Empty for tool-less calls such as summarization.
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
}

/// Tool definition sent to the provider API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Core trait implemented by model providers.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name (e.g., "anthropic").
    fn provider_name(&self) -> &str;

    /// Open a stream of events for `request`.
    ///
    /// An `Err` here means the request never started; an `Err` item inside
    /// the stream means it failed part way.
    async fn stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent, RuntimeError>>, RuntimeError>;

    /// Run a request to completion and return its text.
    async fn complete(&self, request: &ProviderRequest) -> Result<String, RuntimeError> {
        let mut stream = self.stream(request).await?;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Text { text: delta } => text.push_str(&delta),
                StreamEvent::Error { message } => {
                    return Err(RuntimeError::provider(self.provider_name(), message))
                }
                StreamEvent::Stop { .. } => break,
                _ => {}
            }
        }
        Ok(text)
    }
}
