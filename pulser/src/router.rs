//! MessageRouter - decides where a received copy goes next
//!
//! Every copy either leaves for the outbound queue with the remaining delay,
//! or goes back to the inbound queue for another maximum-delay hop. The anchor
//! is stamped onto the outgoing copy in both cases.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::attributes::{OriginalAttributes, extract_anchor, extract_sent_timestamp, stamp_anchor};
use crate::config::RelaySettings;
use crate::error::Result;
use crate::message::Message;
use crate::queue::{MAX_DELAY_SECONDS, QueueClient, SendMessageRequest};
use crate::schedule::{Clock, delay_duration};

/// Where a copy was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Released to the outbound queue
    Emit,
    /// Sent back to the inbound queue for another hop
    Requeue,
}

/// Result of routing one copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub anchor: OriginalAttributes,
    pub decision: RouteDecision,
    /// Delay requested on the send
    pub delay_seconds: u32,
    /// Total delay left before the emit instant, as seen at routing time
    pub remaining: Duration,
    /// Id the queue assigned to the new copy
    pub sent_message_id: String,
}

/// Routes received copies toward their emit instant
pub struct MessageRouter {
    client: Arc<dyn QueueClient>,
    settings: Arc<RelaySettings>,
    clock: Arc<dyn Clock>,
}

impl MessageRouter {
    pub fn new(client: Arc<dyn QueueClient>, settings: Arc<RelaySettings>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn client(&self) -> &Arc<dyn QueueClient> {
        &self.client
    }

    /// Route one copy; success means the send was acknowledged
    pub async fn handle(&self, msg: &Message) -> Result<RouteOutcome> {
        debug!(message_id = %msg.message_id, "MessageRouter::handle: called");

        let anchor = match extract_anchor(msg)? {
            Some(anchor) => anchor,
            None => {
                let sent_timestamp = extract_sent_timestamp(msg)?;
                debug!(message_id = %msg.message_id, sent_timestamp, "MessageRouter::handle: first sighting");
                OriginalAttributes::new(msg.message_id.clone(), sent_timestamp)
            }
        };

        let remaining = delay_duration(
            &anchor,
            self.settings.emit_interval,
            self.settings.offset,
            self.clock.now(),
        )?;

        let max_delay = Duration::from_secs(u64::from(MAX_DELAY_SECONDS));
        let (decision, queue_url, delay_seconds) = if remaining <= max_delay {
            // whole seconds; the sub-second remainder is dropped
            let secs = u32::try_from(remaining.as_secs()).unwrap_or(MAX_DELAY_SECONDS);
            (RouteDecision::Emit, &self.settings.outbound_queue_url, secs)
        } else {
            (RouteDecision::Requeue, &self.settings.inbound_queue_url, MAX_DELAY_SECONDS)
        };

        let request = SendMessageRequest {
            queue_url: queue_url.clone(),
            body: msg.body.clone(),
            message_attributes: stamp_anchor(msg.message_attributes.clone(), &anchor),
            delay_seconds,
        };
        let sent_message_id = self.client.send_message(request).await?;

        match decision {
            RouteDecision::Emit => info!(
                message_id = %msg.message_id,
                original_message_id = %anchor.message_id,
                sent_message_id = %sent_message_id,
                delay_secs = delay_seconds,
                "Message emitted to outbound queue"
            ),
            RouteDecision::Requeue => info!(
                message_id = %msg.message_id,
                original_message_id = %anchor.message_id,
                sent_message_id = %sent_message_id,
                remaining_secs = remaining.as_secs(),
                "Message requeued to inbound queue"
            ),
        }

        Ok(RouteOutcome {
            anchor,
            decision,
            delay_seconds,
            remaining,
            sent_message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{ORIGINAL_MESSAGE_ID_KEY, ORIGINAL_SENT_TIMESTAMP_KEY};
    use crate::error::PulseError;
    use crate::message::AttributeValue;
    use crate::queue::InMemoryQueue;
    use crate::schedule::ManualClock;
    use chrono::{DateTime, TimeDelta, Utc};

    const SENT: &str = "2018-12-17T21:20:49Z";

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    struct Fixture {
        queue: Arc<InMemoryQueue>,
        clock: Arc<ManualClock>,
        inbound: String,
        outbound: String,
    }

    impl Fixture {
        fn new(now: &str) -> Self {
            let clock = Arc::new(ManualClock::new(at(now)));
            let queue = Arc::new(InMemoryQueue::new(clock.clone()));
            let inbound = queue.create_queue("in");
            let outbound = queue.create_queue("out");
            Self {
                queue,
                clock,
                inbound,
                outbound,
            }
        }

        fn router(&self, interval: TimeDelta, offset: TimeDelta) -> MessageRouter {
            let settings = RelaySettings::new(&self.inbound, &self.outbound, interval, offset);
            MessageRouter::new(self.queue.clone(), Arc::new(settings), self.clock.clone())
        }
    }

    fn first_sighting() -> Message {
        Message::new("059f36b4-87a3-44ab-83d2-661975830a7d", "test")
            .with_attribute("SentTimestamp", at(SENT).timestamp_millis().to_string())
    }

    fn anchored(original_sent: DateTime<Utc>) -> Message {
        Message::new("1f0e4a0c-0000-7000-8000-000000000001", "test")
            .with_attribute("SentTimestamp", "1545082649183")
            .with_message_attribute(
                ORIGINAL_MESSAGE_ID_KEY,
                AttributeValue::string("d3217307-c31f-42ad-a235-2d80def3f919"),
            )
            .with_message_attribute(
                ORIGINAL_SENT_TIMESTAMP_KEY,
                AttributeValue::number(original_sent.timestamp_millis().to_string()),
            )
    }

    #[tokio::test]
    async fn test_first_sighting_emits_with_own_anchor() {
        let fx = Fixture::new("2018-12-17T21:28:00Z");
        let router = fx.router(TimeDelta::minutes(15), TimeDelta::zero());

        let outcome = router.handle(&first_sighting()).await.unwrap();

        assert_eq!(outcome.decision, RouteDecision::Emit);
        assert_eq!(outcome.delay_seconds, 120);
        assert_eq!(outcome.anchor.message_id, "059f36b4-87a3-44ab-83d2-661975830a7d");
        assert_eq!(outcome.anchor.sent_timestamp, at(SENT).timestamp_millis());

        let sent = fx.queue.sent_to(&fx.outbound);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, "test");
        assert_eq!(sent[0].delay_seconds, 120);
        assert_eq!(
            sent[0].message_attributes.get(ORIGINAL_MESSAGE_ID_KEY),
            Some(&AttributeValue::string("059f36b4-87a3-44ab-83d2-661975830a7d"))
        );
        assert!(fx.queue.sent_to(&fx.inbound).is_empty());
    }

    #[tokio::test]
    async fn test_long_delay_requeues_to_inbound() {
        let fx = Fixture::new("2018-12-17T21:28:00Z");
        let router = fx.router(TimeDelta::hours(1), TimeDelta::zero());

        // emit at 22:00, 32 minutes away
        let outcome = router.handle(&first_sighting()).await.unwrap();

        assert_eq!(outcome.decision, RouteDecision::Requeue);
        assert_eq!(outcome.delay_seconds, MAX_DELAY_SECONDS);
        assert_eq!(outcome.remaining, Duration::from_secs(32 * 60));
        assert_eq!(fx.queue.sent_to(&fx.inbound).len(), 1);
        assert!(fx.queue.sent_to(&fx.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_exactly_max_delay_emits() {
        let fx = Fixture::new("2018-12-17T21:45:00Z");
        let router = fx.router(TimeDelta::hours(1), TimeDelta::zero());

        let outcome = router.handle(&first_sighting()).await.unwrap();
        assert_eq!(outcome.decision, RouteDecision::Emit);
        assert_eq!(outcome.delay_seconds, 900);
    }

    #[tokio::test]
    async fn test_past_emit_time_sends_immediately() {
        let fx = Fixture::new("2018-12-17T23:00:00Z");
        let router = fx.router(TimeDelta::minutes(15), TimeDelta::zero());

        let outcome = router.handle(&first_sighting()).await.unwrap();
        assert_eq!(outcome.decision, RouteDecision::Emit);
        assert_eq!(outcome.delay_seconds, 0);
        assert_eq!(outcome.remaining, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_subsecond_remainder_is_floored() {
        let fx = Fixture::new("2018-12-17T21:27:59.400Z");
        let router = fx.router(TimeDelta::minutes(15), TimeDelta::zero());

        let outcome = router.handle(&first_sighting()).await.unwrap();
        assert_eq!(outcome.delay_seconds, 120);
    }

    #[tokio::test]
    async fn test_existing_anchor_is_preserved() {
        let fx = Fixture::new("2018-12-17T21:50:00Z");
        let router = fx.router(TimeDelta::hours(1), TimeDelta::zero());

        let msg = anchored(at(SENT)).with_message_attribute("Trace", AttributeValue::string("abc"));
        let outcome = router.handle(&msg).await.unwrap();

        assert_eq!(outcome.decision, RouteDecision::Emit);
        assert_eq!(outcome.delay_seconds, 600);
        assert_eq!(outcome.anchor.message_id, "d3217307-c31f-42ad-a235-2d80def3f919");

        let sent = fx.queue.sent_to(&fx.outbound);
        assert_eq!(sent[0].message_attributes.get("Trace"), Some(&AttributeValue::string("abc")));
        assert_eq!(
            sent[0].message_attributes.get(ORIGINAL_SENT_TIMESTAMP_KEY),
            Some(&AttributeValue::number(at(SENT).timestamp_millis().to_string()))
        );
    }

    #[tokio::test]
    async fn test_stale_timestamp_without_id_is_reanchored() {
        let fx = Fixture::new("2018-12-17T21:28:00Z");
        let router = fx.router(TimeDelta::minutes(15), TimeDelta::zero());

        let msg = first_sighting().with_message_attribute(ORIGINAL_SENT_TIMESTAMP_KEY, AttributeValue::number("1"));
        let outcome = router.handle(&msg).await.unwrap();

        assert_eq!(outcome.anchor.message_id, "059f36b4-87a3-44ab-83d2-661975830a7d");
        assert_eq!(outcome.anchor.sent_timestamp, at(SENT).timestamp_millis());
        assert_eq!(outcome.delay_seconds, 120);

        let sent = fx.queue.sent_to(&fx.outbound);
        assert_eq!(
            sent[0].message_attributes.get(ORIGINAL_SENT_TIMESTAMP_KEY),
            Some(&AttributeValue::number(at(SENT).timestamp_millis().to_string()))
        );
        assert_eq!(
            sent[0].message_attributes.get(ORIGINAL_MESSAGE_ID_KEY),
            Some(&AttributeValue::string("059f36b4-87a3-44ab-83d2-661975830a7d"))
        );
    }

    #[tokio::test]
    async fn test_offset_moves_emit_time() {
        let fx = Fixture::new("2018-12-17T21:28:00Z");
        let router = fx.router(TimeDelta::minutes(15), TimeDelta::minutes(5));

        let outcome = router.handle(&first_sighting()).await.unwrap();
        assert_eq!(outcome.delay_seconds, 7 * 60);
    }

    #[tokio::test]
    async fn test_missing_sent_timestamp_fails_without_send() {
        let fx = Fixture::new("2018-12-17T21:28:00Z");
        let router = fx.router(TimeDelta::minutes(15), TimeDelta::zero());

        let result = router.handle(&Message::new("abc", "test")).await;
        assert!(matches!(result, Err(PulseError::AttributesMissing(_))));
        assert!(fx.queue.sent().is_empty());
    }

    #[tokio::test]
    async fn test_partial_anchor_fails() {
        let fx = Fixture::new("2018-12-17T21:28:00Z");
        let router = fx.router(TimeDelta::minutes(15), TimeDelta::zero());

        let msg = first_sighting().with_message_attribute(ORIGINAL_MESSAGE_ID_KEY, AttributeValue::string("x"));
        let result = router.handle(&msg).await;
        assert!(matches!(result, Err(PulseError::AttributeMissing { .. })));
        assert!(fx.queue.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_propagates() {
        let fx = Fixture::new("2018-12-17T21:28:00Z");
        let router = fx.router(TimeDelta::minutes(15), TimeDelta::zero());
        fx.queue.fail_next_sends(1);

        let result = router.handle(&first_sighting()).await;
        assert!(matches!(result, Err(PulseError::Queue(_))));
        assert!(fx.queue.sent().is_empty());
    }
}
