use serde::{Deserialize, Serialize};

use crate::anthropic::types::{MessageParam, SystemPrompt, Tool};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountTokensBody {
    pub model: String,
    pub messages: Vec<MessageParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountTokensResponse {
    pub input_tokens: u32,
}
