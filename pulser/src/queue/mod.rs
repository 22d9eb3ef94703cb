//! Queue client abstraction
//!
//! The relay only needs four operations from a queue service: send, receive,
//! delete and name-to-URL resolution. [`QueueClient`] is the seam; two
//! implementations ship here:
//!
//! - [`InMemoryQueue`] - in-process queues with delay and visibility timeout
//! - [`SqsJsonClient`] - HTTP client for the SQS JSON protocol

use std::collections::HashMap;

use async_trait::async_trait;

use crate::message::{Message, MessageAttributes};

mod error;
mod memory;
mod sqs;

pub use error::QueueError;
pub use memory::{DEFAULT_VISIBILITY_TIMEOUT_SECS, InMemoryQueue, SentRecord};
pub use sqs::SqsJsonClient;

/// Largest delay a single send may request, in seconds
pub const MAX_DELAY_SECONDS: u32 = 900;

/// Largest long-poll wait a single receive may request, in seconds
pub const MAX_WAIT_TIME_SECONDS: u32 = 20;

/// Attribute-name wildcard for receives
pub const ALL_ATTRIBUTES: &str = "All";

/// Parameters of a send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageRequest {
    pub queue_url: String,
    pub body: String,
    pub message_attributes: MessageAttributes,
    pub delay_seconds: u32,
}

/// Parameters of a receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveMessageRequest {
    pub queue_url: String,
    pub max_number_of_messages: u32,
    pub wait_time_seconds: u32,
    pub attribute_names: Vec<String>,
    pub message_attribute_names: Vec<String>,
}

impl ReceiveMessageRequest {
    /// Receive a single message with every queue-managed and user attribute
    pub fn single_with_all_attributes(queue_url: impl Into<String>, wait_time_seconds: u32) -> Self {
        Self {
            queue_url: queue_url.into(),
            max_number_of_messages: 1,
            wait_time_seconds: wait_time_seconds.min(MAX_WAIT_TIME_SECONDS),
            attribute_names: vec![ALL_ATTRIBUTES.to_string()],
            message_attribute_names: vec![ALL_ATTRIBUTES.to_string()],
        }
    }
}

/// Operations the relay consumes from a queue service
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Send a message, returning the id the queue assigned to it
    async fn send_message(&self, request: SendMessageRequest) -> Result<String, QueueError>;

    /// Receive up to `max_number_of_messages` messages
    async fn receive_messages(&self, request: ReceiveMessageRequest) -> Result<Vec<Message>, QueueError>;

    /// Delete a received message by its receipt handle
    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), QueueError>;

    /// Resolve a queue name to its URL
    async fn get_queue_url(&self, queue_name: &str) -> Result<String, QueueError>;
}

/// Keep only the attributes a receive asked for
pub(crate) fn filter_attributes<V: Clone>(
    attributes: &HashMap<String, V>,
    names: &[String],
) -> Option<HashMap<String, V>> {
    if names.is_empty() {
        return None;
    }
    if names.iter().any(|n| n == ALL_ATTRIBUTES || n == ".*") {
        return Some(attributes.clone());
    }
    Some(
        attributes
            .iter()
            .filter(|(k, _)| names.iter().any(|n| n == *k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}
