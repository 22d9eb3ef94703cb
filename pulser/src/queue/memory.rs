//! In-process queue implementation
//!
//! Mirrors the parts of SQS semantics the relay depends on: per-send delay,
//! a visibility timeout for received copies, `SentTimestamp` stamping and
//! receipt-handle deletion. Time comes from an injected [`Clock`], so a
//! [`ManualClock`](crate::schedule::ManualClock) makes delayed delivery
//! deterministic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;
use uuid::Uuid;

use super::{MAX_DELAY_SECONDS, QueueClient, QueueError, ReceiveMessageRequest, SendMessageRequest, filter_attributes};
use crate::message::{Message, MessageAttributes, SENT_TIMESTAMP_ATTRIBUTE};
use crate::schedule::Clock;

/// Default visibility timeout for received copies
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u32 = 30;

/// How often an empty long-poll re-checks for visible messages
const LONG_POLL_TICK: Duration = Duration::from_millis(100);

const URL_PREFIX: &str = "memory://";

/// A send accepted by the in-memory queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub queue_url: String,
    pub message_id: String,
    pub body: String,
    pub message_attributes: MessageAttributes,
    pub delay_seconds: u32,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    message_attributes: MessageAttributes,
    sent_timestamp: i64,
    visible_at: DateTime<Utc>,
    receipt_handle: Option<String>,
    receive_count: u32,
    first_receive_timestamp: Option<i64>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, Vec<StoredMessage>>,
    sent: Vec<SentRecord>,
    failing_sends: usize,
    failing_receives: usize,
    failing_deletes: usize,
}

/// In-process [`QueueClient`]
pub struct InMemoryQueue {
    clock: Arc<dyn Clock>,
    visibility_timeout: TimeDelta,
    record_sends: bool,
    state: Mutex<State>,
}

impl InMemoryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        debug!("InMemoryQueue::new: called");
        Self {
            clock,
            visibility_timeout: TimeDelta::seconds(i64::from(DEFAULT_VISIBILITY_TIMEOUT_SECS)),
            record_sends: true,
            state: Mutex::new(State::default()),
        }
    }

    /// Override the visibility timeout applied to received copies
    pub fn with_visibility_timeout(mut self, timeout: TimeDelta) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Turn the send log read by [`sent`](Self::sent) on or off
    ///
    /// Long-running processes should turn it off; the log is never pruned.
    pub fn with_send_log(mut self, enabled: bool) -> Self {
        self.record_sends = enabled;
        self
    }

    /// Create a queue (idempotent) and return its URL
    pub fn create_queue(&self, name: &str) -> String {
        let url = format!("{}{}", URL_PREFIX, name);
        debug!(%name, %url, "InMemoryQueue::create_queue: called");
        self.lock().queues.entry(url.clone()).or_default();
        url
    }

    /// Every send accepted so far, oldest first
    pub fn sent(&self) -> Vec<SentRecord> {
        self.lock().sent.clone()
    }

    /// Sends accepted for one queue, oldest first
    pub fn sent_to(&self, queue_url: &str) -> Vec<SentRecord> {
        self.lock()
            .sent
            .iter()
            .filter(|r| r.queue_url == queue_url)
            .cloned()
            .collect()
    }

    /// Messages held by a queue, visible or not
    pub fn len(&self, queue_url: &str) -> usize {
        self.lock().queues.get(queue_url).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self, queue_url: &str) -> bool {
        self.len(queue_url) == 0
    }

    /// Messages a receive would currently see
    pub fn visible_len(&self, queue_url: &str) -> usize {
        let now = self.clock.now();
        self.lock()
            .queues
            .get(queue_url)
            .map(|msgs| msgs.iter().filter(|m| m.visible_at <= now).count())
            .unwrap_or(0)
    }

    /// Make the next `n` sends fail
    pub fn fail_next_sends(&self, n: usize) {
        self.lock().failing_sends = n;
    }

    /// Make the next `n` receives fail
    pub fn fail_next_receives(&self, n: usize) {
        self.lock().failing_receives = n;
    }

    /// Make the next `n` deletes fail
    pub fn fail_next_deletes(&self, n: usize) {
        self.lock().failing_deletes = n;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take up to `max` visible messages, marking them in flight
    fn take_visible(&self, request: &ReceiveMessageRequest) -> Result<Vec<Message>, QueueError> {
        let now = self.clock.now();
        let mut state = self.lock();
        let messages = state
            .queues
            .get_mut(&request.queue_url)
            .ok_or_else(|| QueueError::QueueNotFound(request.queue_url.clone()))?;

        let mut received = Vec::new();
        for stored in messages.iter_mut() {
            if received.len() >= request.max_number_of_messages.max(1) as usize {
                break;
            }
            if stored.visible_at > now {
                continue;
            }

            let receipt_handle = Uuid::now_v7().to_string();
            stored.receipt_handle = Some(receipt_handle.clone());
            stored.receive_count += 1;
            stored.visible_at = now + self.visibility_timeout;
            let first_receive = *stored.first_receive_timestamp.get_or_insert(now.timestamp_millis());

            let mut attributes = HashMap::new();
            attributes.insert(SENT_TIMESTAMP_ATTRIBUTE.to_string(), stored.sent_timestamp.to_string());
            attributes.insert(
                "ApproximateReceiveCount".to_string(),
                stored.receive_count.to_string(),
            );
            attributes.insert(
                "ApproximateFirstReceiveTimestamp".to_string(),
                first_receive.to_string(),
            );

            received.push(Message {
                message_id: stored.message_id.clone(),
                receipt_handle,
                body: stored.body.clone(),
                attributes: filter_attributes(&attributes, &request.attribute_names),
                message_attributes: filter_attributes(&stored.message_attributes, &request.message_attribute_names),
            });
        }

        Ok(received)
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn send_message(&self, request: SendMessageRequest) -> Result<String, QueueError> {
        debug!(queue_url = %request.queue_url, delay_seconds = request.delay_seconds, "InMemoryQueue::send_message: called");

        if request.delay_seconds > MAX_DELAY_SECONDS {
            return Err(QueueError::Api {
                code: "InvalidParameterValue".to_string(),
                message: format!(
                    "DelaySeconds must be between 0 and {}, got {}",
                    MAX_DELAY_SECONDS, request.delay_seconds
                ),
            });
        }

        let now = self.clock.now();
        let mut state = self.lock();
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(QueueError::Injected("send".to_string()));
        }

        let message_id = Uuid::now_v7().to_string();
        let queue = state
            .queues
            .get_mut(&request.queue_url)
            .ok_or_else(|| QueueError::QueueNotFound(request.queue_url.clone()))?;
        queue.push(StoredMessage {
            message_id: message_id.clone(),
            body: request.body.clone(),
            message_attributes: request.message_attributes.clone(),
            sent_timestamp: now.timestamp_millis(),
            visible_at: now + TimeDelta::seconds(i64::from(request.delay_seconds)),
            receipt_handle: None,
            receive_count: 0,
            first_receive_timestamp: None,
        });

        if self.record_sends {
            state.sent.push(SentRecord {
                queue_url: request.queue_url,
                message_id: message_id.clone(),
                body: request.body,
                message_attributes: request.message_attributes,
                delay_seconds: request.delay_seconds,
            });
        }

        Ok(message_id)
    }

    async fn receive_messages(&self, request: ReceiveMessageRequest) -> Result<Vec<Message>, QueueError> {
        debug!(queue_url = %request.queue_url, "InMemoryQueue::receive_messages: called");

        {
            let mut state = self.lock();
            if state.failing_receives > 0 {
                state.failing_receives -= 1;
                return Err(QueueError::Injected("receive".to_string()));
            }
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(u64::from(request.wait_time_seconds));
        loop {
            let received = self.take_visible(&request)?;
            if !received.is_empty() || tokio::time::Instant::now() >= deadline {
                debug!(count = received.len(), "InMemoryQueue::receive_messages: returning");
                return Ok(received);
            }
            tokio::time::sleep(LONG_POLL_TICK).await;
        }
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), QueueError> {
        debug!(%queue_url, "InMemoryQueue::delete_message: called");

        let mut state = self.lock();
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(QueueError::Injected("delete".to_string()));
        }

        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| QueueError::QueueNotFound(queue_url.to_string()))?;
        let position = queue
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::ReceiptNotFound(receipt_handle.to_string()))?;
        queue.remove(position);
        Ok(())
    }

    async fn get_queue_url(&self, queue_name: &str) -> Result<String, QueueError> {
        let url = format!("{}{}", URL_PREFIX, queue_name);
        if self.lock().queues.contains_key(&url) {
            Ok(url)
        } else {
            Err(QueueError::QueueNotFound(queue_name.to_string()))
        }
    }
}
