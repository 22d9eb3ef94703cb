//! pulser - release queued messages on a fixed pulse
//!
//! Messages arriving on an inbound queue are held back until the next pulse
//! boundary after their original send time (plus an offset), then sent to an
//! outbound queue. Delays longer than a queue send can request are covered by
//! bouncing the message back onto the inbound queue with the maximum delay.
//!
//! # Architecture
//!
//! ```text
//!                 +-------------- requeue (900s) ---------------+
//!                 v                                             |
//!   producer -> inbound queue -> Poller / BatchHandler -> MessageRouter
//!                                                               |
//!                                          emit (remaining) ----+--> outbound queue
//! ```
//!
//! The only state is the anchor (`OriginalMessageID`, `OriginalSentTimestamp`)
//! carried as user attributes on every copy.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pulser::{InMemoryQueue, MessageRouter, Poller, RelaySettings, SystemClock};
//!
//! let clock = Arc::new(SystemClock);
//! let queue = Arc::new(InMemoryQueue::new(clock.clone()));
//! let settings = RelaySettings::new(queue.create_queue("in"), queue.create_queue("out"), interval, offset);
//! let poller = Poller::new(MessageRouter::new(queue, Arc::new(settings), clock));
//! poller.run(shutdown_rx).await;
//! ```

pub mod attributes;
pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod local;
pub mod message;
pub mod poller;
pub mod queue;
pub mod router;
pub mod runtime;
pub mod schedule;

pub use attributes::{OriginalAttributes, extract_anchor, extract_sent_timestamp, stamp_anchor};
pub use batch::{BatchHandler, BatchItemFailure, SqsBatchResponse, SqsEvent};
pub use config::{Config, ExecutionMode, RelaySettings};
pub use error::{PulseError, Result};
pub use message::{AttributeValue, Message, MessageAttributes};
pub use poller::{PollStats, Poller};
pub use queue::{InMemoryQueue, QueueClient, QueueError, SqsJsonClient};
pub use router::{MessageRouter, RouteDecision, RouteOutcome};
pub use runtime::LambdaRuntime;
pub use schedule::{Clock, ManualClock, SystemClock, delay_duration, emit_time, sent_time};
