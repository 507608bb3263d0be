use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::ApiError;

/// Per-topic position of a message. Starts at 1; 0 means "before the first message".
pub type Sequence = u64;

/// Identifies one incarnation of a topic's history. A topic whose log is
/// deleted or discarded starts over at sequence 1 under a new epoch.
pub type Epoch = u64;

// ════════════════════════════════════════════════════════════════
//  Payload
// ════════════════════════════════════════════════════════════════

/// Opaque message body.
///
/// The broker never looks inside. On the wire and on disk it is carried as
/// a base64 string inside JSON, which keeps arbitrary bytes intact.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Serialize a structured value as the payload bytes.
    pub fn from_json<T: Serialize + ?Sized>(value: &T) -> Result<Self, ApiError> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    /// Parse the payload bytes as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ApiError> {
        Ok(serde_json::from_slice(&self.0)?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) if text.len() <= 64 => write!(f, "Payload({text:?})"),
            _ => write!(f, "Payload({} bytes)", self.0.len()),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

impl Serialize for Payload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.0);
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

// ════════════════════════════════════════════════════════════════
//  Message
// ════════════════════════════════════════════════════════════════

/// One published message, as stored and delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    /// Assigned at ingest; the only ordering key within a topic.
    pub sequence: Sequence,
    /// Incarnation of the topic log `sequence` belongs to.
    pub epoch: Epoch,
    pub payload: Payload,
    /// Ingest time, Unix milliseconds.
    pub ts_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_survives_json_encoding_byte_for_byte() {
        let raw = Payload::new(vec![0, 159, 146, 150, b'{', b' ', 0xff]);
        let text = serde_json::to_string(&raw).unwrap();
        let back: Payload = serde_json::from_str(&text).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn structured_payload_helpers() {
        let payload = Payload::from_json(&serde_json::json!({"id": 1})).unwrap();
        let value: serde_json::Value = payload.json().unwrap();
        assert_eq!(value["id"], 1);
        assert!(Payload::from("not json").json::<serde_json::Value>().is_err());
    }
}
