use serde_json::Value as JsonValue;

use switchyard_protocol::anthropic::request::CreateMessageBody;
use switchyard_protocol::anthropic::types::{
    ContentBlockParam, ImageSource, MessageContent, MessageParam, Metadata, Role, SystemPrompt,
    Tool, ToolChoice, ToolResultBlock, ToolResultContent,
};
use switchyard_protocol::openai::request::{ChatCompletionBody, StopConfig, StreamOptions};
use switchyard_protocol::openai::types::{
    ChatMessage, FunctionCall, FunctionDefinition, ImageUrl, NamedFunction, NamedToolChoice,
    ToolCall, ToolCallType, ToolChoiceMode, ToolChoiceOption, ToolDefinition, UserContent,
    UserContentPart,
};

use crate::context::ToolNameMap;

const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Convert an Anthropic Messages request into an OpenAI chat-completions
/// request targeting `upstream_model`. `top_k` has no counterpart and is
/// dropped.
pub fn anthropic_to_openai(body: &CreateMessageBody, upstream_model: &str) -> ChatCompletionBody {
    let mut messages = Vec::new();
    if let Some(system) = &body.system {
        let text = system.flatten();
        if !text.is_empty() {
            messages.push(ChatMessage::System { content: text });
        }
    }
    for message in &body.messages {
        match message.role {
            Role::User => map_user_message(&message.content, &mut messages),
            Role::Assistant => messages.push(map_assistant_message(&message.content)),
        }
    }

    let stream = body.stream;
    let stream_options = stream
        .unwrap_or(false)
        .then_some(StreamOptions {
            include_usage: Some(true),
        });

    ChatCompletionBody {
        model: upstream_model.to_string(),
        messages,
        max_tokens: Some(body.max_tokens),
        temperature: body.temperature,
        top_p: body.top_p,
        stop: map_stop_sequences(body.stop_sequences.as_deref()),
        stream,
        stream_options,
        tools: map_tools(body.tools.as_deref()),
        tool_choice: body.tool_choice.as_ref().map(map_tool_choice),
        user: body
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.user_id.clone()),
    }
}

fn map_user_message(content: &MessageContent, out: &mut Vec<ChatMessage>) {
    let mut parts: Vec<UserContentPart> = Vec::new();
    for block in content.blocks() {
        match block {
            ContentBlockParam::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                // Tool results become standalone tool-role messages; surrounding
                // text keeps its position relative to them.
                flush_user_parts(out, &mut parts);
                out.push(ChatMessage::Tool {
                    content: tool_result_text(content.as_ref()),
                    tool_call_id: tool_use_id,
                });
            }
            ContentBlockParam::Text { text } => {
                if !text.is_empty() {
                    parts.push(UserContentPart::Text { text });
                }
            }
            ContentBlockParam::Image { source } => {
                parts.push(UserContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_url(&source),
                    },
                });
            }
            ContentBlockParam::ToolUse { id, name, input } => {
                // Malformed but tolerated: render as text so nothing is lost.
                let rendered = serde_json::to_string(&input).unwrap_or_default();
                parts.push(UserContentPart::Text {
                    text: format!("[tool_use {name} ({id}): {rendered}]"),
                });
            }
        }
    }
    flush_user_parts(out, &mut parts);
}

fn flush_user_parts(out: &mut Vec<ChatMessage>, parts: &mut Vec<UserContentPart>) {
    if parts.is_empty() {
        return;
    }
    let content = match parts.as_slice() {
        [UserContentPart::Text { text }] => UserContent::Text(text.clone()),
        _ => UserContent::Parts(parts.clone()),
    };
    out.push(ChatMessage::User { content });
    parts.clear();
}

fn map_assistant_message(content: &MessageContent) -> ChatMessage {
    let mut texts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    for block in content.blocks() {
        match block {
            ContentBlockParam::Text { text } => {
                if !text.is_empty() {
                    texts.push(text);
                }
            }
            ContentBlockParam::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall {
                    id,
                    r#type: ToolCallType::Function,
                    function: FunctionCall {
                        name,
                        arguments: serde_json::to_string(&input)
                            .unwrap_or_else(|_| "{}".to_string()),
                    },
                });
            }
            ContentBlockParam::Image { source } => {
                texts.push(format!("[image: {}]", image_url(&source)));
            }
            ContentBlockParam::ToolResult { .. } => {}
        }
    }
    ChatMessage::Assistant {
        content: (!texts.is_empty()).then(|| texts.join("\n")),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
    }
}

fn tool_result_text(content: Option<&ToolResultContent>) -> String {
    match content {
        Some(ToolResultContent::Text(text)) => text.clone(),
        Some(ToolResultContent::Blocks(blocks)) => blocks
            .iter()
            .map(|block| match block {
                ToolResultBlock::Text { text } => text.clone(),
                ToolResultBlock::Image { source } => format!("[image: {}]", image_url(source)),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    }
}

fn image_url(source: &ImageSource) -> String {
    match source {
        ImageSource::Url { url } => url.clone(),
        ImageSource::Base64 { media_type, data } => {
            format!("data:{media_type};base64,{data}")
        }
    }
}

fn map_tools(tools: Option<&[Tool]>) -> Option<Vec<ToolDefinition>> {
    let tools = tools?;
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| ToolDefinition {
                r#type: ToolCallType::Function,
                function: FunctionDefinition {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect(),
    )
}

fn map_tool_choice(choice: &ToolChoice) -> ToolChoiceOption {
    match choice {
        ToolChoice::Auto => ToolChoiceOption::Mode(ToolChoiceMode::Auto),
        ToolChoice::Any => ToolChoiceOption::Mode(ToolChoiceMode::Required),
        ToolChoice::None => ToolChoiceOption::Mode(ToolChoiceMode::None),
        ToolChoice::Tool { name } => ToolChoiceOption::Named(NamedToolChoice {
            r#type: ToolCallType::Function,
            function: NamedFunction { name: name.clone() },
        }),
    }
}

fn map_stop_sequences(sequences: Option<&[String]>) -> Option<StopConfig> {
    let sequences = sequences?;
    match sequences {
        [] => None,
        [single] => Some(StopConfig::Single(single.clone())),
        many => Some(StopConfig::Many(many.to_vec())),
    }
}

/// Convert an OpenAI chat-completions request into an Anthropic Messages
/// request. `names` resolves legacy function-role results back to the
/// `toolu_…` ids minted when the tool calls were first translated.
pub fn openai_to_anthropic(body: &ChatCompletionBody, names: &ToolNameMap) -> CreateMessageBody {
    let mut system_texts: Vec<String> = Vec::new();
    let mut messages: Vec<MessageParam> = Vec::new();

    for message in &body.messages {
        match message {
            ChatMessage::System { content } => system_texts.push(content.clone()),
            ChatMessage::User { content } => messages.push(MessageParam {
                role: Role::User,
                content: map_openai_user_content(content),
            }),
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => messages.push(MessageParam {
                role: Role::Assistant,
                content: map_openai_assistant_content(content.as_deref(), tool_calls.as_deref()),
            }),
            ChatMessage::Tool {
                content,
                tool_call_id,
            } => push_tool_result(&mut messages, tool_call_id.clone(), content.clone()),
            ChatMessage::Function { content, name } => {
                let id = names
                    .id_for_function(name)
                    .map(str::to_string)
                    .unwrap_or_else(|| name.clone());
                push_tool_result(&mut messages, id, content.clone());
            }
        }
    }

    CreateMessageBody {
        model: body.model.clone(),
        max_tokens: body.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: (!system_texts.is_empty()).then(|| SystemPrompt::Text(system_texts.join("\n"))),
        metadata: body.user.clone().map(|user_id| Metadata {
            user_id: Some(user_id),
        }),
        stop_sequences: body.stop.as_ref().map(|stop| match stop {
            StopConfig::Single(single) => vec![single.clone()],
            StopConfig::Many(many) => many.clone(),
        }),
        stream: body.stream,
        temperature: body.temperature,
        tool_choice: body.tool_choice.as_ref().map(map_openai_tool_choice),
        tools: map_openai_tools(body.tools.as_deref()),
        top_k: None,
        top_p: body.top_p,
    }
}

fn map_openai_user_content(content: &UserContent) -> MessageContent {
    match content {
        UserContent::Text(text) => MessageContent::Text(text.clone()),
        UserContent::Parts(parts) => MessageContent::Blocks(
            parts
                .iter()
                .map(|part| match part {
                    UserContentPart::Text { text } => ContentBlockParam::Text { text: text.clone() },
                    UserContentPart::ImageUrl { image_url } => ContentBlockParam::Image {
                        source: ImageSource::Url {
                            url: image_url.url.clone(),
                        },
                    },
                })
                .collect(),
        ),
    }
}

fn map_openai_assistant_content(
    content: Option<&str>,
    tool_calls: Option<&[ToolCall]>,
) -> MessageContent {
    let calls = tool_calls.unwrap_or_default();
    if calls.is_empty() {
        return MessageContent::Text(content.unwrap_or_default().to_string());
    }
    let mut blocks = Vec::new();
    if let Some(text) = content.filter(|text| !text.is_empty()) {
        blocks.push(ContentBlockParam::Text {
            text: text.to_string(),
        });
    }
    for call in calls {
        blocks.push(ContentBlockParam::ToolUse {
            id: call.id.clone(),
            name: call.function.name.clone(),
            input: parse_arguments(&call.function.arguments),
        });
    }
    MessageContent::Blocks(blocks)
}

fn push_tool_result(messages: &mut Vec<MessageParam>, tool_use_id: String, content: String) {
    let block = ContentBlockParam::ToolResult {
        tool_use_id,
        content: (!content.is_empty()).then_some(ToolResultContent::Text(content)),
        is_error: None,
    };
    // Consecutive tool results merge into one user turn, matching how the
    // Anthropic API expects them.
    if let Some(last) = messages.last_mut()
        && last.role == Role::User
        && let MessageContent::Blocks(blocks) = &mut last.content
        && blocks
            .iter()
            .all(|existing| matches!(existing, ContentBlockParam::ToolResult { .. }))
    {
        blocks.push(block);
        return;
    }
    messages.push(MessageParam {
        role: Role::User,
        content: MessageContent::Blocks(vec![block]),
    });
}

fn map_openai_tools(tools: Option<&[ToolDefinition]>) -> Option<Vec<Tool>> {
    let tools = tools?;
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| Tool {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                input_schema: tool.function.parameters.clone(),
            })
            .collect(),
    )
}

fn map_openai_tool_choice(choice: &ToolChoiceOption) -> ToolChoice {
    match choice {
        ToolChoiceOption::Mode(ToolChoiceMode::Auto) => ToolChoice::Auto,
        ToolChoiceOption::Mode(ToolChoiceMode::Required) => ToolChoice::Any,
        ToolChoiceOption::Mode(ToolChoiceMode::None) => ToolChoice::None,
        ToolChoiceOption::Named(named) => ToolChoice::Tool {
            name: named.function.name.clone(),
        },
    }
}

pub(crate) fn parse_arguments(arguments: &str) -> JsonValue {
    if arguments.trim().is_empty() {
        return JsonValue::Object(serde_json::Map::new());
    }
    serde_json::from_str(arguments)
        .unwrap_or_else(|_| JsonValue::String(arguments.to_string()))
}
