//! Anchor record carried on every copy of a relayed message
//!
//! The anchor (`OriginalMessageID` + `OriginalSentTimestamp`) is written the
//! first time a logical message is seen and copied verbatim onto every later
//! hop. It is the only state the relay keeps, and it lives in the message.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PulseError, Result};
use crate::message::{AttributeValue, Message, MessageAttributes, SENT_TIMESTAMP_ATTRIBUTE};

/// Reserved user attribute: anchor message id (`String`)
pub const ORIGINAL_MESSAGE_ID_KEY: &str = "OriginalMessageID";

/// Reserved user attribute: anchor send time, epoch ms (`Number`)
pub const ORIGINAL_SENT_TIMESTAMP_KEY: &str = "OriginalSentTimestamp";

/// Identity and send time of the first copy of a logical message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OriginalAttributes {
    pub message_id: String,
    /// Epoch milliseconds
    pub sent_timestamp: i64,
}

impl OriginalAttributes {
    pub fn new(message_id: impl Into<String>, sent_timestamp: i64) -> Self {
        Self {
            message_id: message_id.into(),
            sent_timestamp,
        }
    }
}

/// Read the anchor back from a message's user attributes
///
/// Returns `Ok(None)` on first sighting (no anchor id attribute). Once the id
/// attribute is present the pair must be complete and well-typed.
pub fn extract_anchor(msg: &Message) -> Result<Option<OriginalAttributes>> {
    debug!(message_id = %msg.message_id, "extract_anchor: called");

    let Some(id_value) = msg.message_attribute(ORIGINAL_MESSAGE_ID_KEY) else {
        debug!(message_id = %msg.message_id, "extract_anchor: no anchor present");
        return Ok(None);
    };

    let message_id = match id_value {
        AttributeValue::String { value, label: None } => value,
        other => {
            return Err(PulseError::AttributeTypeMismatch {
                key: ORIGINAL_MESSAGE_ID_KEY.to_string(),
                expected: "String",
                actual: other.data_type(),
            });
        }
    };
    if message_id.is_empty() {
        return Err(PulseError::AttributeMissing {
            key: ORIGINAL_MESSAGE_ID_KEY.to_string(),
            detail: "value is empty".to_string(),
        });
    }

    let Some(ts_value) = msg.message_attribute(ORIGINAL_SENT_TIMESTAMP_KEY) else {
        return Err(PulseError::AttributeMissing {
            key: ORIGINAL_SENT_TIMESTAMP_KEY.to_string(),
            detail: format!("original message id {} is set but sent timestamp is not", message_id),
        });
    };

    let raw = match ts_value {
        AttributeValue::Number { value, label: None } => value,
        other => {
            return Err(PulseError::AttributeTypeMismatch {
                key: ORIGINAL_SENT_TIMESTAMP_KEY.to_string(),
                expected: "Number",
                actual: other.data_type(),
            });
        }
    };

    let sent_timestamp = raw.parse::<i64>().map_err(|source| PulseError::AttributeParseError {
        key: ORIGINAL_SENT_TIMESTAMP_KEY.to_string(),
        source,
    })?;

    Ok(Some(OriginalAttributes::new(message_id.clone(), sent_timestamp)))
}

/// Read the queue-managed send time (epoch ms) of this copy
pub fn extract_sent_timestamp(msg: &Message) -> Result<i64> {
    debug!(message_id = %msg.message_id, "extract_sent_timestamp: called");

    let Some(attributes) = msg.attributes.as_ref() else {
        return Err(PulseError::AttributesMissing("attributes not found".to_string()));
    };
    let Some(raw) = attributes.get(SENT_TIMESTAMP_ATTRIBUTE) else {
        return Err(PulseError::AttributesMissing(format!(
            "attribute {} not found",
            SENT_TIMESTAMP_ATTRIBUTE
        )));
    };

    raw.parse::<i64>().map_err(|source| PulseError::AttributeParseError {
        key: SENT_TIMESTAMP_ATTRIBUTE.to_string(),
        source,
    })
}

/// Write the anchor into a user attribute map, creating it if needed
///
/// Other attributes are left untouched. Applying the same anchor twice gives
/// the same map as applying it once.
pub fn stamp_anchor(attributes: Option<MessageAttributes>, anchor: &OriginalAttributes) -> MessageAttributes {
    let mut attributes = attributes.unwrap_or_else(|| HashMap::with_capacity(2));
    attributes.insert(
        ORIGINAL_MESSAGE_ID_KEY.to_string(),
        AttributeValue::string(anchor.message_id.clone()),
    );
    attributes.insert(
        ORIGINAL_SENT_TIMESTAMP_KEY.to_string(),
        AttributeValue::number(anchor.sent_timestamp.to_string()),
    );
    attributes
}
