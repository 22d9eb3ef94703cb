//! Queue message model
//!
//! A [`Message`] is what a receive (or a batch event record) hands us: an
//! opaque body, a receipt handle, the queue-managed attributes (string map,
//! includes `SentTimestamp`) and the user attributes, each a typed
//! [`AttributeValue`].

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Queue-managed attribute holding the send time in epoch milliseconds
pub const SENT_TIMESTAMP_ATTRIBUTE: &str = "SentTimestamp";

/// User attribute map as carried on a message
pub type MessageAttributes = HashMap<String, AttributeValue>;

/// A message as received from a queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub message_id: String,

    #[serde(default)]
    pub receipt_handle: String,

    #[serde(default)]
    pub body: String,

    /// Queue-managed attributes; `None` when the receive did not ask for them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<HashMap<String, String>>,

    /// User attributes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_attributes: Option<MessageAttributes>,
}

impl Message {
    /// Create a message with an id and body and no attributes
    pub fn new(message_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    /// Builder-style setter for a queue-managed attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Builder-style setter for a user attribute
    pub fn with_message_attribute(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.message_attributes
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    /// Look up a user attribute
    pub fn message_attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.message_attributes.as_ref().and_then(|attrs| attrs.get(key))
    }
}

/// A typed user attribute value
///
/// The base type is a closed set. SQS allows a custom label after the base
/// type (`Number.int`, `String.uuid`); the label is kept so the value is
/// re-sent exactly as it arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireAttributeValue", into = "WireAttributeValue")]
pub enum AttributeValue {
    String { value: String, label: Option<String> },
    Number { value: String, label: Option<String> },
    /// Base64 text as carried on the wire
    Binary { value: String, label: Option<String> },
}

impl AttributeValue {
    /// Plain `String` value
    pub fn string(value: impl Into<String>) -> Self {
        AttributeValue::String {
            value: value.into(),
            label: None,
        }
    }

    /// Plain `Number` value
    pub fn number(value: impl Into<String>) -> Self {
        AttributeValue::Number {
            value: value.into(),
            label: None,
        }
    }

    /// Plain `Binary` value (base64 text)
    pub fn binary(value: impl Into<String>) -> Self {
        AttributeValue::Binary {
            value: value.into(),
            label: None,
        }
    }

    pub fn base_type(&self) -> &'static str {
        match self {
            AttributeValue::String { .. } => "String",
            AttributeValue::Number { .. } => "Number",
            AttributeValue::Binary { .. } => "Binary",
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            AttributeValue::String { label, .. }
            | AttributeValue::Number { label, .. }
            | AttributeValue::Binary { label, .. } => label.as_deref(),
        }
    }

    pub fn value(&self) -> &str {
        match self {
            AttributeValue::String { value, .. }
            | AttributeValue::Number { value, .. }
            | AttributeValue::Binary { value, .. } => value,
        }
    }

    /// Full data type as written on the wire, e.g. `Number` or `Number.int`
    pub fn data_type(&self) -> String {
        match self.label() {
            Some(label) => format!("{}.{}", self.base_type(), label),
            None => self.base_type().to_string(),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.data_type(), self.value())
    }
}

/// Attribute value as it appears in queue payloads
///
/// The queue API uses PascalCase keys, the batch event uses camelCase; both
/// decode into this shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAttributeValue {
    #[serde(rename = "DataType", alias = "dataType", default)]
    pub data_type: String,

    #[serde(
        rename = "StringValue",
        alias = "stringValue",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub string_value: Option<String>,

    #[serde(
        rename = "BinaryValue",
        alias = "binaryValue",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub binary_value: Option<String>,
}

impl TryFrom<WireAttributeValue> for AttributeValue {
    type Error = String;

    fn try_from(wire: WireAttributeValue) -> Result<Self, Self::Error> {
        let (base, label) = match wire.data_type.split_once('.') {
            Some((base, label)) => (base, Some(label.to_string())),
            None => (wire.data_type.as_str(), None),
        };

        match base {
            "String" => wire
                .string_value
                .map(|value| AttributeValue::String { value, label })
                .ok_or_else(|| "String attribute without stringValue".to_string()),
            "Number" => wire
                .string_value
                .map(|value| AttributeValue::Number { value, label })
                .ok_or_else(|| "Number attribute without stringValue".to_string()),
            "Binary" => wire
                .binary_value
                .map(|value| AttributeValue::Binary { value, label })
                .ok_or_else(|| "Binary attribute without binaryValue".to_string()),
            other => Err(format!("unknown attribute data type: '{}'", other)),
        }
    }
}

impl From<AttributeValue> for WireAttributeValue {
    fn from(value: AttributeValue) -> Self {
        let data_type = value.data_type();
        match value {
            AttributeValue::String { value, .. } | AttributeValue::Number { value, .. } => WireAttributeValue {
                data_type,
                string_value: Some(value),
                binary_value: None,
            },
            AttributeValue::Binary { value, .. } => WireAttributeValue {
                data_type,
                string_value: None,
                binary_value: Some(value),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_camel_case_string_attribute() {
        let json = r#"{"stringValue": "d3217307", "dataType": "String"}"#;
        let value: AttributeValue = serde_json::from_str(json).unwrap();
        assert_eq!(value, AttributeValue::string("d3217307"));
    }

    #[test]
    fn test_decode_pascal_case_number_attribute() {
        let json = r#"{"DataType": "Number", "StringValue": "1545081649183"}"#;
        let value: AttributeValue = serde_json::from_str(json).unwrap();
        assert_eq!(value, AttributeValue::number("1545081649183"));
    }

    #[test]
    fn test_decode_keeps_custom_label() {
        let json = r#"{"dataType": "Number.int", "stringValue": "42"}"#;
        let value: AttributeValue = serde_json::from_str(json).unwrap();
        assert_eq!(value.base_type(), "Number");
        assert_eq!(value.label(), Some("int"));
        assert_eq!(value.data_type(), "Number.int");
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let json = r#"{"dataType": "Blob", "stringValue": "x"}"#;
        let result: Result<AttributeValue, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_rejects_missing_payload() {
        let json = r#"{"dataType": "String"}"#;
        let result: Result<AttributeValue, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn test_encode_uses_queue_api_keys() {
        let json = serde_json::to_value(AttributeValue::binary("AAEC")).unwrap();
        assert_eq!(json, serde_json::json!({"DataType": "Binary", "BinaryValue": "AAEC"}));
    }

    #[test]
    fn test_message_builders() {
        let msg = Message::new("id-1", "body")
            .with_attribute(SENT_TIMESTAMP_ATTRIBUTE, "1545082649183")
            .with_message_attribute("color", AttributeValue::string("blue"));

        assert_eq!(
            msg.attributes.as_ref().unwrap().get(SENT_TIMESTAMP_ATTRIBUTE).map(String::as_str),
            Some("1545082649183")
        );
        assert_eq!(msg.message_attribute("color"), Some(&AttributeValue::string("blue")));
        assert_eq!(msg.message_attribute("size"), None);
    }

    #[test]
    fn test_decode_event_record() {
        let json = r#"{
            "messageId": "059f36b4-87a3-44ab-83d2-661975830a7d",
            "receiptHandle": "AQEBwJnKyrHigUMZj6rYigCgxlaS3SLy0a...",
            "body": "test",
            "attributes": {"SentTimestamp": "1545082649183"},
            "messageAttributes": {},
            "md5OfBody": "098f6bcd4621d373cade4e832627b4f6",
            "eventSource": "aws:sqs"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.message_id, "059f36b4-87a3-44ab-83d2-661975830a7d");
        assert_eq!(msg.body, "test");
        assert_eq!(msg.message_attributes, Some(HashMap::new()));
    }
}
