//! Error types for the relay

use std::num::ParseIntError;

use thiserror::Error;

use crate::queue::QueueError;

/// Errors that can occur while relaying a message
#[derive(Debug, Error)]
pub enum PulseError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Attribute {key} is missing: {detail}")]
    AttributeMissing { key: String, detail: String },

    #[error("Attribute {key} type mismatch: expected {expected}, got {actual}")]
    AttributeTypeMismatch {
        key: String,
        expected: &'static str,
        actual: String,
    },

    #[error("Attribute {key} parse failed: {source}")]
    AttributeParseError {
        key: String,
        #[source]
        source: ParseIntError,
    },

    #[error("Queue attributes missing: {0}")]
    AttributesMissing(String),

    #[error("Timestamp {0} is out of range")]
    TimestampOutOfRange(i64),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Record {message_id} could not be decoded: {detail}")]
    RecordDecode { message_id: String, detail: String },

    #[error("Panic while handling record {message_id}: {detail}")]
    Panicked { message_id: String, detail: String },

    #[error("Failure message id: {0}")]
    BatchItemFailed(String),

    #[error("Runtime API error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PulseError {
    /// Check if this error came from reading message attributes
    ///
    /// Attribute errors fail only the current attempt on the current copy;
    /// redelivery will hit the same error until the queue's redrive policy
    /// moves the message aside.
    pub fn is_attribute_error(&self) -> bool {
        matches!(
            self,
            PulseError::AttributeMissing { .. }
                | PulseError::AttributeTypeMismatch { .. }
                | PulseError::AttributeParseError { .. }
                | PulseError::AttributesMissing(_)
                | PulseError::TimestampOutOfRange(_)
        )
    }

    /// Check if a later attempt might succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PulseError::Queue(e) => e.is_retryable(),
            PulseError::Runtime(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PulseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_attribute_error() {
        let err = PulseError::AttributeMissing {
            key: "OriginalSentTimestamp".to_string(),
            detail: "not set".to_string(),
        };
        assert!(err.is_attribute_error());

        let err = PulseError::AttributesMissing("attributes not found".to_string());
        assert!(err.is_attribute_error());

        let err = PulseError::Configuration("no inbound queue".to_string());
        assert!(!err.is_attribute_error());
    }

    #[test]
    fn test_is_retryable() {
        assert!(PulseError::Queue(QueueError::Http("connection reset".to_string())).is_retryable());
        assert!(
            !PulseError::Queue(QueueError::QueueNotFound("missing".to_string())).is_retryable()
        );
        assert!(!PulseError::InvalidEvent("no message id".to_string()).is_retryable());
    }

    #[test]
    fn test_batch_item_failed_message() {
        let err = PulseError::BatchItemFailed("059f36b4".to_string());
        assert_eq!(err.to_string(), "Failure message id: 059f36b4");
    }
}
