//! BatchHandler - routes a pushed batch of messages
//!
//! Used when the process is hosted by the Lambda runtime. Deleting the source
//! copies is the platform's job; this handler only routes each record and
//! reports which ones failed.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{PulseError, Result};
use crate::message::Message;
use crate::router::MessageRouter;

/// Batch of queue messages delivered by the event source
///
/// Records stay as raw JSON until they are handled, so one undecodable
/// record fails on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqsEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<Value>,
}

impl SqsEvent {
    pub fn from_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        Self {
            records: messages
                .into_iter()
                .map(|m| serde_json::to_value(m).unwrap_or_default())
                .collect(),
        }
    }

    /// Message id of every record; the event is rejected if any is missing
    fn message_ids(&self) -> Result<Vec<String>> {
        self.records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                record
                    .get("messageId")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        PulseError::InvalidEvent(format!("record {} has no message id, not a queue event", index))
                    })
            })
            .collect()
    }
}

/// Decode one raw record into a [`Message`]
pub fn decode_record(message_id: &str, record: &Value) -> Result<Message> {
    Message::deserialize(record).map_err(|e| PulseError::RecordDecode {
        message_id: message_id.to_string(),
        detail: e.to_string(),
    })
}

/// One record the handler could not route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

/// Partial-failure report returned to the event source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqsBatchResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batch_item_failures: Vec<BatchItemFailure>,
}

impl SqsBatchResponse {
    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.batch_item_failures.iter().map(|f| f.item_identifier.as_str())
    }
}

pub struct BatchHandler {
    router: MessageRouter,
}

impl BatchHandler {
    pub fn new(router: MessageRouter) -> Self {
        Self { router }
    }

    /// Route every record in input order
    ///
    /// A decode error, routing error or panic in one record does not affect
    /// the others. A batch of exactly one record that fails is returned as an
    /// error instead of a partial-failure response, so the whole invocation is
    /// retried.
    pub async fn handle_event(&self, event: SqsEvent) -> Result<SqsBatchResponse> {
        debug!(records = event.records.len(), "BatchHandler::handle_event: called");

        let message_ids = event.message_ids()?;
        let total = message_ids.len();
        let mut failures = Vec::new();
        for (message_id, record) in message_ids.into_iter().zip(&event.records) {
            if let Err(e) = self.handle_record(&message_id, record).await {
                error!(%message_id, error = %e, "Failed to route record");
                failures.push(BatchItemFailure {
                    item_identifier: message_id,
                });
            }
        }

        if total == 1
            && let Some(failure) = failures.pop()
        {
            warn!(message_id = %failure.item_identifier, "Single-record batch failed");
            return Err(PulseError::BatchItemFailed(failure.item_identifier));
        }

        info!(records = total, failed = failures.len(), "Batch handled");
        Ok(SqsBatchResponse {
            batch_item_failures: failures,
        })
    }

    async fn handle_record(&self, message_id: &str, record: &Value) -> Result<()> {
        let message = decode_record(message_id, record)?;
        match AssertUnwindSafe(self.router.handle(&message)).catch_unwind().await {
            Ok(outcome) => {
                let outcome = outcome?;
                debug!(%message_id, decision = ?outcome.decision, "BatchHandler::handle_record: record routed");
                Ok(())
            }
            Err(panic) => Err(PulseError::Panicked {
                message_id: message_id.to_string(),
                detail: panic_message(panic.as_ref()).to_string(),
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
