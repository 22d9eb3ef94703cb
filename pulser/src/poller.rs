//! PollLoop - long-running receive/route/delete worker
//!
//! One message at a time: receive from the inbound queue, hand it to the
//! [`MessageRouter`], and delete the source copy only after the router's send
//! was acknowledged. Anything that fails is logged and left on the queue for
//! redelivery.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

use crate::error::PulseError;
use crate::message::Message;
use crate::queue::ReceiveMessageRequest;
use crate::router::{MessageRouter, RouteDecision};

/// Counters for one or more loop iterations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub received: usize,
    pub emitted: usize,
    pub requeued: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Subset of `failed` whose attributes could not be read
    pub malformed: usize,
    pub receive_errors: usize,
}

impl PollStats {
    fn merge(&mut self, other: PollStats) {
        self.received += other.received;
        self.emitted += other.emitted;
        self.requeued += other.requeued;
        self.deleted += other.deleted;
        self.failed += other.failed;
        self.malformed += other.malformed;
        self.receive_errors += other.receive_errors;
    }
}

/// Sequential poll worker over the inbound queue
pub struct Poller {
    router: MessageRouter,
}

impl Poller {
    pub fn new(router: MessageRouter) -> Self {
        Self { router }
    }

    /// Run until shutdown is signalled or the shutdown sender is dropped
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> PollStats {
        let settings = self.router.settings();
        info!(
            inbound = %settings.inbound_queue_url,
            outbound = %settings.outbound_queue_url,
            interval = %settings.emit_interval,
            offset = %settings.offset,
            "Poller starting"
        );

        let mut totals = PollStats::default();
        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => {
                    info!("Shutdown signal received");
                    break;
                }
                Err(TryRecvError::Empty) => {}
            }

            let received = tokio::select! {
                result = self.receive() => result,
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received during receive");
                    break;
                }
            };

            match received {
                Ok(messages) => totals.merge(self.process(messages).await),
                Err(e) => {
                    totals.receive_errors += 1;
                    log_receive_error(&e);
                    tokio::select! {
                        _ = tokio::time::sleep(settings.receive_backoff) => {}
                        _ = shutdown_rx.recv() => {
                            info!("Shutdown signal received during backoff");
                            break;
                        }
                    }
                }
            }
        }

        info!(
            received = totals.received,
            deleted = totals.deleted,
            failed = totals.failed,
            "Poller stopped"
        );
        totals
    }

    /// One receive/route/delete pass without backoff
    pub async fn run_once(&self) -> PollStats {
        debug!("Poller::run_once: called");
        match self.receive().await {
            Ok(messages) => self.process(messages).await,
            Err(e) => {
                log_receive_error(&e);
                PollStats {
                    receive_errors: 1,
                    ..Default::default()
                }
            }
        }
    }

    async fn receive(&self) -> Result<Vec<Message>, PulseError> {
        let settings = self.router.settings();
        let request =
            ReceiveMessageRequest::single_with_all_attributes(&settings.inbound_queue_url, settings.wait_time_seconds);
        Ok(self.router.client().receive_messages(request).await?)
    }

    async fn process(&self, messages: Vec<Message>) -> PollStats {
        let mut stats = PollStats::default();
        for msg in messages {
            stats.received += 1;
            let outcome = match self.router.handle(&msg).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_attribute_error() => {
                    warn!(message_id = %msg.message_id, error = %e, "Unreadable attributes, leaving message for redrive");
                    stats.failed += 1;
                    stats.malformed += 1;
                    continue;
                }
                Err(e) => {
                    error!(message_id = %msg.message_id, error = %e, "Failed to route message");
                    stats.failed += 1;
                    continue;
                }
            };
            match outcome.decision {
                RouteDecision::Emit => stats.emitted += 1,
                RouteDecision::Requeue => stats.requeued += 1,
            }

            let inbound = &self.router.settings().inbound_queue_url;
            match self.router.client().delete_message(inbound, &msg.receipt_handle).await {
                Ok(()) => {
                    debug!(message_id = %msg.message_id, "Poller::process: source copy deleted");
                    stats.deleted += 1;
                }
                Err(e) => {
                    error!(message_id = %msg.message_id, error = %e, "Failed to delete message");
                    stats.failed += 1;
                }
            }
        }
        stats
    }
}

fn log_receive_error(e: &PulseError) {
    if e.is_retryable() {
        warn!(error = %e, "Receive failed, backing off");
    } else {
        // retrying will not help until the queue or its permissions change
        error!(error = %e, "Receive failed with a non-retryable error, backing off");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelaySettings;
    use crate::queue::{InMemoryQueue, QueueClient, SendMessageRequest};
    use crate::schedule::ManualClock;
    use chrono::{DateTime, TimeDelta, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        queue: Arc<InMemoryQueue>,
        clock: Arc<ManualClock>,
        inbound: String,
        outbound: String,
    }

    fn fixture() -> (Fixture, Poller) {
        fixture_with_wait(0)
    }

    fn fixture_with_wait(wait_time_seconds: u32) -> (Fixture, Poller) {
        let now = DateTime::parse_from_rfc3339("2018-12-17T21:20:49Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = Arc::new(ManualClock::new(now));
        let queue = Arc::new(InMemoryQueue::new(clock.clone()));
        let inbound = queue.create_queue("in");
        let outbound = queue.create_queue("out");

        let mut settings = RelaySettings::new(&inbound, &outbound, TimeDelta::minutes(15), TimeDelta::zero());
        settings.wait_time_seconds = wait_time_seconds;
        settings.receive_backoff = Duration::from_millis(10);
        let router = MessageRouter::new(queue.clone(), Arc::new(settings), clock.clone());

        (
            Fixture {
                queue,
                clock,
                inbound,
                outbound,
            },
            Poller::new(router),
        )
    }

    async fn publish(fx: &Fixture, body: &str) {
        fx.queue
            .send_message(SendMessageRequest {
                queue_url: fx.inbound.clone(),
                body: body.to_string(),
                message_attributes: Default::default(),
                delay_seconds: 0,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_once_routes_and_deletes() {
        let (fx, poller) = fixture();
        publish(&fx, "hello").await;
        fx.clock.advance(TimeDelta::minutes(7));

        let stats = poller.run_once().await;

        assert_eq!(stats.received, 1);
        assert_eq!(stats.emitted, 1);
        assert_eq!(stats.deleted, 1);
        assert_eq!(fx.queue.len(&fx.inbound), 0);
        assert_eq!(fx.queue.len(&fx.outbound), 1);
    }

    #[tokio::test]
    async fn test_run_once_empty_queue() {
        let (_fx, poller) = fixture();
        let stats = poller.run_once().await;
        assert_eq!(stats, PollStats::default());
    }

    #[tokio::test]
    async fn test_failed_send_leaves_source_copy() {
        let (fx, poller) = fixture();
        publish(&fx, "hello").await;
        fx.queue.fail_next_sends(1);

        let stats = poller.run_once().await;

        assert_eq!(stats.received, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.malformed, 0);
        assert_eq!(stats.deleted, 0);
        assert_eq!(fx.queue.len(&fx.inbound), 1);
        assert_eq!(fx.queue.len(&fx.outbound), 0);
    }

    #[tokio::test]
    async fn test_unreadable_anchor_counted_as_malformed() {
        let (fx, poller) = fixture();
        let mut attributes = std::collections::HashMap::new();
        attributes.insert(
            crate::attributes::ORIGINAL_MESSAGE_ID_KEY.to_string(),
            crate::message::AttributeValue::number("42"),
        );
        fx.queue
            .send_message(SendMessageRequest {
                queue_url: fx.inbound.clone(),
                body: "hello".to_string(),
                message_attributes: attributes,
                delay_seconds: 0,
            })
            .await
            .unwrap();

        let stats = poller.run_once().await;

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(fx.queue.len(&fx.inbound), 1);
        assert!(fx.queue.sent_to(&fx.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_is_counted() {
        let (fx, poller) = fixture();
        publish(&fx, "hello").await;
        fx.queue.fail_next_deletes(1);

        let stats = poller.run_once().await;

        assert_eq!(stats.emitted, 1);
        assert_eq!(stats.failed, 1);
        // source copy stays in flight for redelivery
        assert_eq!(fx.queue.len(&fx.inbound), 1);
    }

    #[tokio::test]
    async fn test_receive_error_is_counted() {
        let (fx, poller) = fixture();
        fx.queue.fail_next_receives(1);

        let stats = poller.run_once().await;
        assert_eq!(stats.receive_errors, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_pending_shutdown() {
        let (fx, poller) = fixture();
        publish(&fx, "hello").await;

        let (tx, rx) = mpsc::channel(1);
        tx.send(()).await.unwrap();

        let stats = poller.run(rx).await;
        assert_eq!(stats.received, 0);
        assert_eq!(fx.queue.len(&fx.inbound), 1);
    }

    #[tokio::test]
    async fn test_run_stops_when_sender_dropped() {
        let (_fx, poller) = fixture();
        let (tx, rx) = mpsc::channel::<()>(1);
        drop(tx);

        let stats = poller.run(rx).await;
        assert_eq!(stats, PollStats::default());
    }

    #[tokio::test]
    async fn test_run_interrupts_long_poll() {
        let (_fx, poller) = fixture_with_wait(20);

        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move { poller.run(rx).await });
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(()).await.unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
        assert_eq!(stats.received, 0);
    }

    #[tokio::test]
    async fn test_run_backs_off_after_receive_error() {
        let (fx, poller) = fixture_with_wait(1);
        fx.queue.fail_next_receives(2);

        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move { poller.run(rx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).await.unwrap();

        let stats = handle.await.unwrap();
        assert_eq!(stats.receive_errors, 2);
    }
}
