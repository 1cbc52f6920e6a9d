use switchyard_protocol::anthropic::error::{ErrorBody, ErrorType};

/// Outward-facing request error, rendered as an Anthropic error envelope.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error_type:?}: {message}")]
pub struct ProxyError {
    pub error_type: ErrorType,
    pub message: String,
}

impl ProxyError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorType::InvalidRequestError, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorType::AuthenticationError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorType::NotFoundError, message)
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new(ErrorType::OverloadedError, message)
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(ErrorType::ApiError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorType::TimeoutError, message)
    }

    pub fn status(&self) -> u16 {
        self.error_type.http_status()
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody::new(self.error_type, self.message.clone())
    }
}
