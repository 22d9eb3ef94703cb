//! SQS JSON-protocol client
//!
//! Speaks the `application/x-amz-json-1.0` protocol (`X-Amz-Target:
//! AmazonSQS.<Operation>`) over reqwest. Requests are not SigV4-signed, so
//! this targets SQS-compatible endpoints (ElasticMQ, LocalStack) or a signing
//! proxy in front of SQS.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{QueueClient, QueueError, ReceiveMessageRequest, SendMessageRequest};
use crate::message::{Message, MessageAttributes};

const CONTENT_TYPE: &str = "application/x-amz-json-1.0";
const TARGET_PREFIX: &str = "AmazonSQS.";

/// Extra headroom over the long-poll wait before the HTTP request times out
const REQUEST_TIMEOUT_HEADROOM: Duration = Duration::from_secs(10);

/// [`QueueClient`] over the SQS JSON protocol
pub struct SqsJsonClient {
    endpoint: String,
    http: reqwest::Client,
}

impl SqsJsonClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, QueueError> {
        let endpoint = endpoint.into();
        debug!(%endpoint, "SqsJsonClient::new: called");
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(u64::from(super::MAX_WAIT_TIME_SECONDS)) + REQUEST_TIMEOUT_HEADROOM)
            .build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<Req: Serialize + Sync, Resp: DeserializeOwned>(&self, operation: &str, body: &Req) -> Result<Resp, QueueError> {
        debug!(%operation, endpoint = %self.endpoint, "SqsJsonClient::call: sending request");
        let response = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .header("X-Amz-Target", format!("{}{}", TARGET_PREFIX, operation))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        debug!(%operation, status = status.as_u16(), "SqsJsonClient::call: response received");

        if !status.is_success() {
            return Err(parse_error(status.as_u16(), &text));
        }
        // DeleteMessage answers with an empty body
        let text = if text.trim().is_empty() { "{}" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| QueueError::InvalidResponse(format!("{}: {}", operation, e)))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendMessageInput<'a> {
    queue_url: &'a str,
    message_body: &'a str,
    delay_seconds: u32,
    #[serde(skip_serializing_if = "no_attributes")]
    message_attributes: &'a MessageAttributes,
}

fn no_attributes(attributes: &&MessageAttributes) -> bool {
    attributes.is_empty()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendMessageOutput {
    message_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageInput<'a> {
    queue_url: &'a str,
    max_number_of_messages: u32,
    wait_time_seconds: u32,
    attribute_names: &'a [String],
    message_attribute_names: &'a [String],
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageOutput {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireMessage {
    message_id: String,
    receipt_handle: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    attributes: Option<HashMap<String, String>>,
    #[serde(default)]
    message_attributes: Option<MessageAttributes>,
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        Message {
            message_id: wire.message_id,
            receipt_handle: wire.receipt_handle,
            body: wire.body,
            attributes: wire.attributes,
            message_attributes: wire.message_attributes,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteMessageInput<'a> {
    queue_url: &'a str,
    receipt_handle: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueueUrlInput<'a> {
    queue_name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueueUrlOutput {
    queue_url: String,
}

#[derive(Debug, Deserialize)]
struct EmptyOutput {}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type", default)]
    error_type: String,
    #[serde(alias = "Message", default)]
    message: String,
}

fn parse_error(status: u16, text: &str) -> QueueError {
    let Ok(body) = serde_json::from_str::<ErrorBody>(text) else {
        return QueueError::Http(format!("status {}: {}", status, text));
    };
    // "com.amazonaws.sqs#QueueDoesNotExist" -> "QueueDoesNotExist"
    let code = body
        .error_type
        .rsplit('#')
        .next()
        .unwrap_or(body.error_type.as_str())
        .to_string();

    if code == "QueueDoesNotExist" || code.ends_with("NonExistentQueue") {
        return QueueError::QueueNotFound(body.message);
    }
    if status >= 500 {
        return QueueError::Http(format!("status {} {}: {}", status, code, body.message));
    }
    QueueError::Api {
        code,
        message: body.message,
    }
}

#[async_trait]
impl QueueClient for SqsJsonClient {
    async fn send_message(&self, request: SendMessageRequest) -> Result<String, QueueError> {
        let input = SendMessageInput {
            queue_url: &request.queue_url,
            message_body: &request.body,
            delay_seconds: request.delay_seconds,
            message_attributes: &request.message_attributes,
        };
        let output: SendMessageOutput = self.call("SendMessage", &input).await?;
        Ok(output.message_id)
    }

    async fn receive_messages(&self, request: ReceiveMessageRequest) -> Result<Vec<Message>, QueueError> {
        let input = ReceiveMessageInput {
            queue_url: &request.queue_url,
            max_number_of_messages: request.max_number_of_messages,
            wait_time_seconds: request.wait_time_seconds,
            attribute_names: &request.attribute_names,
            message_attribute_names: &request.message_attribute_names,
        };
        let output: ReceiveMessageOutput = self.call("ReceiveMessage", &input).await?;
        Ok(output.messages.into_iter().map(Message::from).collect())
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), QueueError> {
        let input = DeleteMessageInput {
            queue_url,
            receipt_handle,
        };
        let _: EmptyOutput = self.call("DeleteMessage", &input).await?;
        Ok(())
    }

    async fn get_queue_url(&self, queue_name: &str) -> Result<String, QueueError> {
        let input = GetQueueUrlInput { queue_name };
        let output: GetQueueUrlOutput = self.call("GetQueueUrl", &input).await?;
        Ok(output.queue_url)
    }
}
