use time::OffsetDateTime;

use switchyard_protocol::anthropic::response::{
    ContentBlock, Message, MessageType, StopReason, Usage,
};
use switchyard_protocol::anthropic::types::Role;
use switchyard_protocol::openai::response::{
    AssistantMessage, ChatChoice, ChatCompletionResponse,
};
use switchyard_protocol::openai::types::{
    CompletionUsage, FinishReason, FunctionCall, ToolCall, ToolCallType,
};

use crate::context::ToolNameMap;
use crate::request::parse_arguments;
use crate::{new_message_id, new_tool_use_id};

/// Convert an OpenAI chat-completions response into an Anthropic message.
/// Tool calls get freshly minted `toolu_…` ids; the id → function-name pairs
/// are recorded in `names` so later tool results can be translated back.
pub fn openai_to_anthropic(
    response: &ChatCompletionResponse,
    client_model: &str,
    names: &mut ToolNameMap,
) -> Message {
    let choice = response.choices.first();
    let mut content = Vec::new();
    let mut has_tool_use = false;

    if let Some(choice) = choice {
        if let Some(text) = choice.message.content.as_deref()
            && !text.is_empty()
        {
            content.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
        for call in tool_calls_of(&choice.message) {
            let id = new_tool_use_id();
            names.record(&id, &call.name);
            content.push(ContentBlock::ToolUse {
                id,
                name: call.name,
                input: parse_arguments(&call.arguments),
            });
            has_tool_use = true;
        }
    }

    let stop_reason = choice
        .and_then(|choice| choice.finish_reason)
        .map(map_finish_reason)
        .or(has_tool_use.then_some(StopReason::ToolUse));

    Message {
        id: new_message_id(),
        r#type: MessageType::Message,
        role: Role::Assistant,
        model: client_model.to_string(),
        content,
        stop_reason: Some(stop_reason.unwrap_or(StopReason::EndTurn)),
        stop_sequence: None,
        usage: response
            .usage
            .as_ref()
            .map(|usage| Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            })
            .unwrap_or_default(),
    }
}

fn tool_calls_of(message: &AssistantMessage) -> Vec<FunctionCall> {
    if let Some(calls) = &message.tool_calls {
        return calls.iter().map(|call| call.function.clone()).collect();
    }
    if let Some(call) = &message.function_call {
        return vec![call.clone()];
    }
    Vec::new()
}

fn map_finish_reason(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls | FinishReason::FunctionCall => StopReason::ToolUse,
        FinishReason::ContentFilter => StopReason::StopSequence,
    }
}

/// Convert an Anthropic message into an OpenAI chat-completions response.
pub fn anthropic_to_openai(message: &Message) -> ChatCompletionResponse {
    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in &message.content {
        match block {
            ContentBlock::Text { text } => texts.push(text.clone()),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                r#type: ToolCallType::Function,
                function: FunctionCall {
                    name: name.clone(),
                    arguments: serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()),
                },
            }),
        }
    }

    ChatCompletionResponse {
        id: message.id.clone(),
        object: "chat.completion".to_string(),
        created: OffsetDateTime::now_utc().unix_timestamp(),
        model: message.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                content: (!texts.is_empty()).then(|| texts.join("\n")),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                function_call: None,
            },
            finish_reason: message.stop_reason.map(map_stop_reason),
        }],
        usage: Some(CompletionUsage {
            prompt_tokens: message.usage.input_tokens,
            completion_tokens: message.usage.output_tokens,
            total_tokens: message.usage.input_tokens + message.usage.output_tokens,
        }),
    }
}

fn map_stop_reason(reason: StopReason) -> FinishReason {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => FinishReason::Stop,
        StopReason::MaxTokens => FinishReason::Length,
        StopReason::ToolUse => FinishReason::ToolCalls,
    }
}
