//! Queue transport error types

use thiserror::Error;

/// Errors returned by a [`QueueClient`](super::QueueClient)
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error {code}: {message}")]
    Api { code: String, message: String },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Receipt handle not found: {0}")]
    ReceiptNotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Injected failure: {0}")]
    Injected(String),
}

impl From<reqwest::Error> for QueueError {
    fn from(e: reqwest::Error) -> Self {
        QueueError::Http(e.to_string())
    }
}

impl QueueError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::Http(_) => true,
            QueueError::Api { code, .. } => is_throttling(code),
            QueueError::Injected(_) => true,
            QueueError::QueueNotFound(_) => false,
            QueueError::ReceiptNotFound(_) => false,
            QueueError::InvalidResponse(_) => false,
        }
    }
}

fn is_throttling(code: &str) -> bool {
    code.ends_with("RequestThrottled") || code.ends_with("ThrottlingException") || code.ends_with("ServiceUnavailable")
}
