//! Folds provider stream events into content blocks.

use crate::agent_loop::events::EventPayload;
use crate::error::RuntimeError;
use crate::tools::ToolArguments;
use crate::types::{ContentBlock, StopReason, StreamEvent, ToolUseBlock, Usage};

enum OpenBlock {
    Text(String),
    Thinking(String),
}

struct PendingToolUse {
    id: String,
    name: String,
    raw_input: String,
}

/// One fully assembled assistant response.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AssembledMessage {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Option<Usage>,
}

impl AssembledMessage {
    pub fn tool_uses(&self) -> Vec<ToolUseBlock> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse(tool_use) => Some(tool_use.clone()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Default)]
pub(crate) struct StreamAssembler {
    blocks: Vec<ContentBlock>,
    open: Option<OpenBlock>,
    tools: Vec<PendingToolUse>,
    stop_reason: Option<StopReason>,
    usage: Option<Usage>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_reason.is_some()
    }

    /// Apply one event, returning the payloads to forward to the transport.
    ///
    /// Once stopped, only usage and errors are read; content is ignored.
    pub fn apply(&mut self, event: StreamEvent) -> Result<Vec<EventPayload>, RuntimeError> {
        let mut out = Vec::new();
        if self.is_stopped()
            && !matches!(event, StreamEvent::Usage { .. } | StreamEvent::Error { .. })
        {
            tracing::debug!("content event after stop ignored");
            return Ok(out);
        }
        match event {
            StreamEvent::Thinking { text } => {
                if let Some(OpenBlock::Thinking(buffer)) = &mut self.open {
                    buffer.push_str(&text);
                } else {
                    self.close_open(&mut out);
                    self.open = Some(OpenBlock::Thinking(text.clone()));
                    out.push(EventPayload::ThinkingStart);
                }
                out.push(EventPayload::ThinkingDelta { text });
            }
            StreamEvent::Text { text } => {
                if text.is_empty() {
                    return Ok(out);
                }
                if let Some(OpenBlock::Text(buffer)) = &mut self.open {
                    buffer.push_str(&text);
                } else {
                    self.close_open(&mut out);
                    self.open = Some(OpenBlock::Text(text.clone()));
                }
                out.push(EventPayload::TextDelta { text });
            }
            StreamEvent::ToolUseStart { id, name } => {
                self.close_open(&mut out);
                self.tools.push(PendingToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    raw_input: String::new(),
                });
                out.push(EventPayload::ToolUseStart { id, name });
            }
            StreamEvent::ToolUseDelta { id, partial_json } => {
                match self.tools.iter_mut().rev().find(|tool| tool.id == id) {
                    Some(tool) => {
                        tool.raw_input.push_str(&partial_json);
                        out.push(EventPayload::ToolUseDelta { id, partial_json });
                    }
                    None => tracing::warn!(tool_use_id = %id, "argument delta for unknown tool call"),
                }
            }
            StreamEvent::Stop { reason } => {
                self.close_open(&mut out);
                self.stop_reason = Some(reason);
            }
            StreamEvent::Usage { usage } => match &mut self.usage {
                Some(total) => total.merge(&usage),
                None => self.usage = Some(usage),
            },
            StreamEvent::Error { message } => return Err(RuntimeError::Stream(message)),
        }
        Ok(out)
    }

    fn close_open(&mut self, out: &mut Vec<EventPayload>) {
        match self.open.take() {
            Some(OpenBlock::Text(text)) => self.blocks.push(ContentBlock::Text { text }),
            Some(OpenBlock::Thinking(thinking)) => {
                out.push(EventPayload::ThinkingComplete {
                    text: thinking.clone(),
                });
                self.blocks.push(ContentBlock::Thinking {
                    thinking,
                    signature: None,
                });
            }
            None => {}
        }
    }

    /// Flush buffered blocks and parse tool arguments. A stream that ended
    /// without a stop event gets a stop reason inferred from its content.
    pub fn finish(mut self) -> (AssembledMessage, Vec<EventPayload>) {
        let mut out = Vec::new();
        self.close_open(&mut out);

        let has_tools = !self.tools.is_empty();
        for tool in self.tools {
            let (arguments, parsed) = ToolArguments::from_fragments(&tool.raw_input);
            if !parsed {
                tracing::warn!(
                    tool = %tool.name,
                    tool_use_id = %tool.id,
                    raw_len = tool.raw_input.len(),
                    "tool arguments did not parse; using empty input"
                );
            }
            self.blocks.push(ContentBlock::ToolUse(ToolUseBlock {
                id: tool.id,
                name: tool.name,
                input: arguments.into_value(),
            }));
        }

        let stop_reason = self.stop_reason.unwrap_or(if has_tools {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        });
        (
            AssembledMessage {
                content: self.blocks,
                stop_reason,
                usage: self.usage,
            },
            out,
        )
    }

    /// Text streamed so far. Thinking and unfinished tool calls are dropped.
    pub fn into_partial(mut self) -> Vec<ContentBlock> {
        let mut discarded = Vec::new();
        self.close_open(&mut discarded);
        self.blocks
            .into_iter()
            .filter(|block| matches!(block, ContentBlock::Text { text } if !text.is_empty()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn apply_all(assembler: &mut StreamAssembler, events: Vec<StreamEvent>) -> Vec<EventPayload> {
        events
            .into_iter()
            .flat_map(|event| assembler.apply(event).expect("event"))
            .collect()
    }

    #[test]
    fn fragments_reassemble_into_exact_input() {
        let input = serde_json::json!({"path": "src/main.rs", "limit": 40, "nested": {"a": [1, 2]}});
        let raw = serde_json::to_string(&input).expect("json");
        let mut events = vec![StreamEvent::tool_use_start("toolu_1", "read_file")];
        for chunk in raw.as_bytes().chunks(3) {
            events.push(StreamEvent::tool_use_delta(
                "toolu_1",
                String::from_utf8(chunk.to_vec()).expect("ascii"),
            ));
        }
        events.push(StreamEvent::stop(StopReason::ToolUse));

        let mut assembler = StreamAssembler::new();
        apply_all(&mut assembler, events);
        let (message, _) = assembler.finish();
        assert_eq!(
            message.tool_uses(),
            vec![ToolUseBlock {
                id: "toolu_1".to_string(),
                name: "read_file".to_string(),
                input,
            }]
        );
    }

    #[test]
    fn unparsable_arguments_become_empty_object() {
        let mut assembler = StreamAssembler::new();
        apply_all(
            &mut assembler,
            vec![
                StreamEvent::tool_use_start("toolu_1", "bash"),
                StreamEvent::tool_use_delta("toolu_1", "{\"command\": \"ls"),
                StreamEvent::stop(StopReason::ToolUse),
            ],
        );
        let (message, _) = assembler.finish();
        assert_eq!(message.tool_uses()[0].input, serde_json::json!({}));
    }

    #[test]
    fn thinking_then_text_produces_ordered_blocks_and_events() {
        let mut assembler = StreamAssembler::new();
        let emitted = apply_all(
            &mut assembler,
            vec![
                StreamEvent::thinking("let me "),
                StreamEvent::thinking("look"),
                StreamEvent::text("Hello"),
                StreamEvent::text(", world"),
                StreamEvent::usage(12, 5),
                StreamEvent::stop(StopReason::EndTurn),
            ],
        );
        assert_eq!(
            emitted,
            vec![
                EventPayload::ThinkingStart,
                EventPayload::ThinkingDelta { text: "let me ".into() },
                EventPayload::ThinkingDelta { text: "look".into() },
                EventPayload::ThinkingComplete { text: "let me look".into() },
                EventPayload::TextDelta { text: "Hello".into() },
                EventPayload::TextDelta { text: ", world".into() },
            ]
        );
        let (message, trailing) = assembler.finish();
        assert!(trailing.is_empty());
        assert_eq!(
            message.content,
            vec![
                ContentBlock::Thinking {
                    thinking: "let me look".into(),
                    signature: None
                },
                ContentBlock::text("Hello, world"),
            ]
        );
        assert_eq!(message.usage, Some(Usage::new(12, 5)));
    }

    #[test]
    fn usage_after_stop_is_kept_and_content_ignored() {
        let mut assembler = StreamAssembler::new();
        let emitted = apply_all(
            &mut assembler,
            vec![
                StreamEvent::text("hi"),
                StreamEvent::stop(StopReason::EndTurn),
                StreamEvent::usage(150_000, 20),
                StreamEvent::text(" late"),
            ],
        );
        assert_eq!(emitted, vec![EventPayload::TextDelta { text: "hi".into() }]);
        let (message, _) = assembler.finish();
        assert_eq!(message.content, vec![ContentBlock::text("hi")]);
        assert_eq!(message.usage, Some(Usage::new(150_000, 20)));
    }

    #[test]
    fn error_event_fails_the_stream() {
        let mut assembler = StreamAssembler::new();
        let err = assembler
            .apply(StreamEvent::error("overloaded"))
            .expect_err("stream error");
        assert!(matches!(err, RuntimeError::Stream(message) if message == "overloaded"));
    }

    #[test]
    fn partial_keeps_only_text() {
        let mut assembler = StreamAssembler::new();
        apply_all(
            &mut assembler,
            vec![
                StreamEvent::text("Working on it"),
                StreamEvent::tool_use_start("toolu_1", "bash"),
                StreamEvent::tool_use_delta("toolu_1", "{\"comm"),
            ],
        );
        assert_eq!(assembler.into_partial(), vec![ContentBlock::text("Working on it")]);
    }

    #[test]
    fn missing_stop_is_inferred_from_content() {
        let mut assembler = StreamAssembler::new();
        apply_all(
            &mut assembler,
            vec![
                StreamEvent::tool_use_start("toolu_1", "ls"),
                StreamEvent::tool_use_delta("toolu_1", "{}"),
            ],
        );
        let (message, _) = assembler.finish();
        assert_eq!(message.stop_reason, StopReason::ToolUse);
    }
}
