use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message carried by the length-field framing
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldMessage {
    pub message_type: u32,
    pub sequence: u32,
    pub data: Bytes,
}

impl FieldMessage {
    pub fn new(message_type: u32, sequence: u32, data: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            sequence,
            data: data.into(),
        }
    }
}

/// Message carried by the JSON framing
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JsonMessage {
    #[serde(rename = "type")]
    pub message_type: u32,
    pub sequence: u32,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub timestamp: i64,
}

impl JsonMessage {
    pub fn new(message_type: u32, sequence: u32, data: Map<String, Value>) -> Self {
        Self {
            message_type,
            sequence,
            data,
            timestamp: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// peers may send `"data": null` for an empty payload
fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Message carried by the checksummed binary framing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMessage {
    pub version: u8,
    pub message_type: u32,
    pub sequence: u32,
    pub data: Bytes,
}

impl BinaryMessage {
    pub fn new(message_type: u32, sequence: u32, data: impl Into<Bytes>) -> Self {
        Self {
            version: super::binary::VERSION,
            message_type,
            sequence,
            data: data.into(),
        }
    }
}

/// A decoded frame. Each framing produces and accepts exactly one variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Field(FieldMessage),
    Json(JsonMessage),
    Binary(BinaryMessage),
}

impl Message {
    pub fn message_type(&self) -> u32 {
        match self {
            Message::Field(m) => m.message_type,
            Message::Json(m) => m.message_type,
            Message::Binary(m) => m.message_type,
        }
    }

    pub fn sequence(&self) -> u32 {
        match self {
            Message::Field(m) => m.sequence,
            Message::Json(m) => m.sequence,
            Message::Binary(m) => m.sequence,
        }
    }

    /// Payload bytes for the byte-oriented framings; `None` for JSON.
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Message::Field(m) => Some(&m.data),
            Message::Binary(m) => Some(&m.data),
            Message::Json(_) => None,
        }
    }

    /// Payload size in bytes. For JSON this is the encoded size of `data`.
    pub fn payload_len(&self) -> usize {
        match self {
            Message::Field(m) => m.data.len(),
            Message::Binary(m) => m.data.len(),
            Message::Json(m) => serde_json::to_vec(&m.data).map_or(0, |body| body.len()),
        }
    }
}

impl From<FieldMessage> for Message {
    fn from(m: FieldMessage) -> Self {
        Message::Field(m)
    }
}

impl From<JsonMessage> for Message {
    fn from(m: JsonMessage) -> Self {
        Message::Json(m)
    }
}

impl From<BinaryMessage> for Message {
    fn from(m: BinaryMessage) -> Self {
        Message::Binary(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_len_per_variant() {
        assert_eq!(Message::from(FieldMessage::new(1, 1, &b"abc"[..])).payload_len(), 3);
        assert_eq!(Message::from(BinaryMessage::new(1, 1, Bytes::new())).payload_len(), 0);

        let mut data = Map::new();
        data.insert("k".into(), Value::from(1));
        // {"k":1}
        assert_eq!(Message::from(JsonMessage::new(1, 1, data)).payload_len(), 7);
        assert_eq!(Message::from(JsonMessage::default()).payload_len(), 2);
    }
}
