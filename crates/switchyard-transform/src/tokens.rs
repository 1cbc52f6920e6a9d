use tiktoken_rs::{get_bpe_from_model, o200k_base};

use switchyard_protocol::anthropic::count_tokens::CountTokensBody;

/// Tokenizer-based estimate for a text fragment. Unknown model names fall
/// back to the o200k encoding.
pub fn estimate(model: &str, text: &str) -> u32 {
    let Ok(bpe) = get_bpe_from_model(model).or_else(|_| o200k_base()) else {
        // Both lookups failing means the embedded encodings are unusable;
        // approximate rather than error on an estimate endpoint.
        return (text.len() / 4) as u32;
    };
    bpe.encode_ordinary(text).len() as u32
}

/// Estimate the input tokens of a count-tokens request by encoding its
/// serialized messages, system prompt, and tool definitions.
pub fn count_request_tokens(body: &CountTokensBody) -> u32 {
    let mut value = serde_json::to_value(body).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.remove("model");
    }
    let text = value.to_string();
    estimate(&body.model, &text)
}
