use serde_json::json;

use switchyard_protocol::anthropic::request::CreateMessageBody;

/// Stable fingerprint over the normalized request. Fields that do not affect
/// the upstream answer (client metadata) are excluded; the stream flag is
/// included so streaming and unary duplicates never share an entry.
pub fn fingerprint(body: &CreateMessageBody) -> String {
    let canonical = json!({
        "model": body.model,
        "max_tokens": body.max_tokens,
        "messages": body.messages,
        "system": body.system,
        "stop_sequences": body.stop_sequences,
        "temperature": body.temperature,
        "top_k": body.top_k,
        "top_p": body.top_p,
        "tools": body.tools,
        "tool_choice": body.tool_choice,
        "stream": body.is_stream(),
    });
    blake3::hash(canonical.to_string().as_bytes())
        .to_hex()
        .to_string()
}
