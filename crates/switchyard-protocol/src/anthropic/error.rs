use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    AuthenticationError,
    InvalidRequestError,
    NotFoundError,
    RateLimitError,
    ApiError,
    OverloadedError,
    TimeoutError,
}

impl ErrorType {
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorType::AuthenticationError => 401,
            ErrorType::InvalidRequestError => 400,
            ErrorType::NotFoundError => 404,
            ErrorType::RateLimitError => 429,
            ErrorType::ApiError => 502,
            ErrorType::OverloadedError => 503,
            ErrorType::TimeoutError => 504,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub r#type: ErrorType,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorBodyType {
    #[serde(rename = "error")]
    Error,
}

/// Top-level error envelope: `{"type":"error","error":{...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub r#type: ErrorBodyType,
    pub error: ErrorDetail,
}

impl ErrorBody {
    pub fn new(r#type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            r#type: ErrorBodyType::Error,
            error: ErrorDetail {
                r#type,
                message: message.into(),
            },
        }
    }
}
