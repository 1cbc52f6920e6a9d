use std::collections::BTreeMap;

use time::OffsetDateTime;

use switchyard_protocol::anthropic::error::ErrorDetail;
use switchyard_protocol::anthropic::response::{
    ContentBlock, Message, MessageType, StopReason, Usage,
};
use switchyard_protocol::anthropic::stream::{
    ContentDelta, DeltaUsage, MessageDeltaBody, StreamEvent,
};
use switchyard_protocol::anthropic::types::Role;
use switchyard_protocol::openai::stream::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, FunctionCallDelta, ToolCallChunk,
};
use switchyard_protocol::openai::types::{CompletionUsage, FinishReason};

use crate::context::ToolNameMap;
use crate::tokens;
use crate::{new_message_id, new_tool_use_id};

/// Index used for the legacy single-function dialect, which has no tool index.
const LEGACY_FUNCTION_INDEX: u32 = u32::MAX;

/// Stateful translator turning OpenAI chat-completion chunks into the
/// Anthropic named-event sequence. One instance per upstream stream.
///
/// Call [`Self::transform_chunk`] per decoded chunk and [`Self::finish`] once
/// the upstream terminates (`[DONE]` or connection close); `finish` emits the
/// closing `message_delta`/`message_stop` pair exactly once.
#[derive(Debug)]
pub struct OpenAiToAnthropicStream {
    message_id: String,
    client_model: String,
    started: bool,
    finished: bool,
    next_block_index: u32,
    open_text_block: Option<u32>,
    open_tool_block: Option<OpenToolBlock>,
    pending_stop: Option<StopReason>,
    upstream_usage: Option<CompletionUsage>,
    translated_text: String,
    names: ToolNameMap,
}

#[derive(Debug)]
struct OpenToolBlock {
    tool_index: u32,
    block_index: u32,
}

impl OpenAiToAnthropicStream {
    pub fn new(client_model: impl Into<String>) -> Self {
        Self {
            message_id: new_message_id(),
            client_model: client_model.into(),
            started: false,
            finished: false,
            next_block_index: 0,
            open_text_block: None,
            open_tool_block: None,
            pending_stop: None,
            upstream_usage: None,
            translated_text: String::new(),
            names: ToolNameMap::new(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// The `toolu_…` id → function-name pairs minted so far.
    pub fn tool_names(&self) -> &ToolNameMap {
        &self.names
    }

    pub fn transform_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.ensure_started(&mut events);

        if let Some(usage) = &chunk.usage {
            self.upstream_usage = Some(usage.clone());
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if let Some(text) = choice.delta.content.as_deref()
            && !text.is_empty()
        {
            self.emit_text(text, &mut events);
        }
        if let Some(calls) = &choice.delta.tool_calls {
            for call in calls {
                self.emit_tool_call(call, &mut events);
            }
        }
        if let Some(call) = &choice.delta.function_call {
            self.emit_legacy_function_call(call, &mut events);
        }

        if let Some(reason) = choice.finish_reason {
            self.close_open_blocks(&mut events);
            self.pending_stop = Some(map_finish_reason(reason));
        }

        events
    }

    /// Close the stream: emits any missing block stops, the final
    /// `message_delta` with the mapped stop reason and usage, and
    /// `message_stop`. Output tokens fall back to a tokenizer estimate over
    /// the translated text when the upstream did not report usage.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.ensure_started(&mut events);
        self.close_open_blocks(&mut events);
        self.finished = true;

        let output_tokens = self
            .upstream_usage
            .as_ref()
            .map(|usage| usage.completion_tokens)
            .unwrap_or_else(|| tokens::estimate(&self.client_model, &self.translated_text));
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(self.pending_stop.take().unwrap_or(StopReason::EndTurn)),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                input_tokens: self
                    .upstream_usage
                    .as_ref()
                    .map(|usage| usage.prompt_tokens),
                output_tokens: Some(output_tokens),
            },
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(StreamEvent::MessageStart {
            message: Message {
                id: self.message_id.clone(),
                r#type: MessageType::Message,
                role: Role::Assistant,
                model: self.client_model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        });
    }

    fn emit_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        self.close_tool_block(events);
        let index = match self.open_text_block {
            Some(index) => index,
            None => {
                let index = self.alloc_block_index();
                self.open_text_block = Some(index);
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::Text {
                        text: String::new(),
                    },
                });
                index
            }
        };
        self.translated_text.push_str(text);
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: ContentDelta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn emit_tool_call(&mut self, call: &ToolCallChunk, events: &mut Vec<StreamEvent>) {
        let starts_new = match &self.open_tool_block {
            Some(open) => open.tool_index != call.index,
            None => true,
        };
        if starts_new {
            // A tool call interrupts any running text block and supersedes the
            // previous tool call.
            self.close_text_block(events);
            self.close_tool_block(events);
            let block_index = self.alloc_block_index();
            let id = new_tool_use_id();
            let name = call
                .function
                .as_ref()
                .and_then(|function| function.name.clone())
                .unwrap_or_else(|| "tool".to_string());
            self.names.record(&id, &name);
            self.open_tool_block = Some(OpenToolBlock {
                tool_index: call.index,
                block_index,
            });
            events.push(StreamEvent::ContentBlockStart {
                index: block_index,
                content_block: ContentBlock::ToolUse {
                    id,
                    name,
                    input: serde_json::Value::Object(serde_json::Map::new()),
                },
            });
        }

        if let Some(arguments) = call
            .function
            .as_ref()
            .and_then(|function| function.arguments.as_deref())
            && !arguments.is_empty()
            && let Some(open) = &self.open_tool_block
        {
            // Fragments pass through verbatim; only their concatenation is
            // guaranteed to parse.
            events.push(StreamEvent::ContentBlockDelta {
                index: open.block_index,
                delta: ContentDelta::InputJsonDelta {
                    partial_json: arguments.to_string(),
                },
            });
        }
    }

    fn emit_legacy_function_call(
        &mut self,
        call: &FunctionCallDelta,
        events: &mut Vec<StreamEvent>,
    ) {
        let chunk = ToolCallChunk {
            index: LEGACY_FUNCTION_INDEX,
            id: None,
            r#type: None,
            function: Some(call.clone()),
        };
        self.emit_tool_call(&chunk, events);
    }

    fn close_text_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(index) = self.open_text_block.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn close_tool_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(open) = self.open_tool_block.take() {
            events.push(StreamEvent::ContentBlockStop {
                index: open.block_index,
            });
        }
    }

    fn close_open_blocks(&mut self, events: &mut Vec<StreamEvent>) {
        self.close_text_block(events);
        self.close_tool_block(events);
    }

    fn alloc_block_index(&mut self) -> u32 {
        let index = self.next_block_index;
        self.next_block_index += 1;
        index
    }
}

fn map_finish_reason(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls | FinishReason::FunctionCall => StopReason::ToolUse,
        FinishReason::ContentFilter => StopReason::StopSequence,
    }
}

/// Output of the Anthropic → OpenAI direction. `Done` maps to the `[DONE]`
/// sentinel, `Ping` to an SSE comment, `Error` terminates the stream.
#[derive(Debug, Clone)]
pub enum OpenAiStreamItem {
    Chunk(ChatCompletionChunk),
    Done,
    Ping,
    Error(ErrorDetail),
}

/// Stateful translator for the reverse direction: Anthropic named events in,
/// OpenAI chat-completion chunks out.
#[derive(Debug)]
pub struct AnthropicToOpenAiStream {
    id: String,
    model: String,
    created: i64,
    finish_emitted: bool,
    tool_positions: BTreeMap<u32, u32>,
}

impl AnthropicToOpenAiStream {
    pub fn new() -> Self {
        Self {
            id: "unknown".to_string(),
            model: "unknown".to_string(),
            created: OffsetDateTime::now_utc().unix_timestamp(),
            finish_emitted: false,
            tool_positions: BTreeMap::new(),
        }
    }

    pub fn transform_event(&mut self, event: &StreamEvent) -> Vec<OpenAiStreamItem> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = message.id.clone();
                self.model = message.model.clone();
                vec![OpenAiStreamItem::Chunk(self.chunk(
                    ChunkDelta {
                        role: Some("assistant".to_string()),
                        ..ChunkDelta::default()
                    },
                    None,
                    None,
                ))]
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::Text { text } => {
                    if text.is_empty() {
                        Vec::new()
                    } else {
                        vec![OpenAiStreamItem::Chunk(self.text_chunk(text))]
                    }
                }
                ContentBlock::ToolUse { id, name, .. } => {
                    let position = self.tool_positions.len() as u32;
                    self.tool_positions.insert(*index, position);
                    vec![OpenAiStreamItem::Chunk(self.chunk(
                        ChunkDelta {
                            tool_calls: Some(vec![ToolCallChunk {
                                index: position,
                                id: Some(id.clone()),
                                r#type: Some("function".to_string()),
                                function: Some(FunctionCallDelta {
                                    name: Some(name.clone()),
                                    arguments: None,
                                }),
                            }]),
                            ..ChunkDelta::default()
                        },
                        None,
                        None,
                    ))]
                }
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentDelta::TextDelta { text } => {
                    if text.is_empty() {
                        Vec::new()
                    } else {
                        vec![OpenAiStreamItem::Chunk(self.text_chunk(text))]
                    }
                }
                ContentDelta::InputJsonDelta { partial_json } => {
                    let Some(position) = self.tool_positions.get(index).copied() else {
                        return Vec::new();
                    };
                    vec![OpenAiStreamItem::Chunk(self.chunk(
                        ChunkDelta {
                            tool_calls: Some(vec![ToolCallChunk {
                                index: position,
                                id: None,
                                r#type: None,
                                function: Some(FunctionCallDelta {
                                    name: None,
                                    arguments: Some(partial_json.clone()),
                                }),
                            }]),
                            ..ChunkDelta::default()
                        },
                        None,
                        None,
                    ))]
                }
            },
            StreamEvent::ContentBlockStop { .. } => Vec::new(),
            StreamEvent::MessageDelta { delta, usage } => {
                let finish_reason = delta.stop_reason.map(map_stop_reason);
                if finish_reason.is_some() {
                    self.finish_emitted = true;
                }
                vec![OpenAiStreamItem::Chunk(self.chunk(
                    ChunkDelta::default(),
                    finish_reason,
                    map_delta_usage(usage),
                ))]
            }
            StreamEvent::MessageStop => {
                let mut items = Vec::new();
                if !self.finish_emitted {
                    self.finish_emitted = true;
                    items.push(OpenAiStreamItem::Chunk(self.chunk(
                        ChunkDelta::default(),
                        Some(FinishReason::Stop),
                        None,
                    )));
                }
                items.push(OpenAiStreamItem::Done);
                items
            }
            StreamEvent::Ping => vec![OpenAiStreamItem::Ping],
            StreamEvent::Error { error } => vec![OpenAiStreamItem::Error(error.clone())],
        }
    }

    fn text_chunk(&self, text: &str) -> ChatCompletionChunk {
        self.chunk(
            ChunkDelta {
                content: Some(text.to_string()),
                ..ChunkDelta::default()
            },
            None,
            None,
        )
    }

    fn chunk(
        &self,
        delta: ChunkDelta,
        finish_reason: Option<FinishReason>,
        usage: Option<CompletionUsage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

impl Default for AnthropicToOpenAiStream {
    fn default() -> Self {
        Self::new()
    }
}

fn map_stop_reason(reason: StopReason) -> FinishReason {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => FinishReason::Stop,
        StopReason::MaxTokens => FinishReason::Length,
        StopReason::ToolUse => FinishReason::ToolCalls,
    }
}

fn map_delta_usage(usage: &DeltaUsage) -> Option<CompletionUsage> {
    if usage.input_tokens.is_none() && usage.output_tokens.is_none() {
        return None;
    }
    let prompt = usage.input_tokens.unwrap_or(0);
    let completion = usage.output_tokens.unwrap_or(0);
    Some(CompletionUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    })
}
