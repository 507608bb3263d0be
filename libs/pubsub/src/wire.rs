use serde::{Deserialize, Serialize};

use herald_api::{Epoch, Payload, Sequence};

use crate::ProtocolError;

/// One control record exchanged between clients and the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlFrame {
    /// Client → broker: replay the topic's backlog, then stream new messages.
    Subscribe { topic: String },
    /// Client → broker: append a message. Not acknowledged.
    Publish { topic: String, payload: Payload },
    /// Broker → subscriber: one message, in sequence order per topic.
    /// Sequences restart at 1 whenever `epoch` changes.
    Deliver {
        topic: String,
        sequence: Sequence,
        #[serde(default)]
        epoch: Epoch,
        payload: Payload,
    },
    /// Broker → client: a request on `topic` failed.
    Error { topic: String, message: String },
}

impl ControlFrame {
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self::Subscribe { topic: topic.into() }
    }

    pub fn publish(topic: impl Into<String>, payload: Payload) -> Self {
        Self::Publish {
            topic: topic.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
    }

    pub fn topic(&self) -> &str {
        match self {
            Self::Subscribe { topic }
            | Self::Publish { topic, .. }
            | Self::Deliver { topic, .. }
            | Self::Error { topic, .. } => topic,
        }
    }

    /// Wire name of the frame type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "SUBSCRIBE",
            Self::Publish { .. } => "PUBLISH",
            Self::Deliver { .. } => "DELIVER",
            Self::Error { .. } => "ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_tagged_by_type() {
        let frame = ControlFrame::publish("orders", Payload::from("hi"));
        let json: serde_json::Value = serde_json::from_slice(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "PUBLISH");
        assert_eq!(json["topic"], "orders");
        assert_eq!(json["payload"], "aGk=");
    }

    #[test]
    fn deliver_decodes_with_sequence() {
        let bytes = br#"{"type":"DELIVER","topic":"t","sequence":7,"epoch":42,"payload":"AAH/"}"#;
        let frame = ControlFrame::decode(bytes).unwrap();
        assert_eq!(
            frame,
            ControlFrame::Deliver {
                topic: "t".into(),
                sequence: 7,
                epoch: 42,
                payload: Payload::new(vec![0, 1, 255]),
            }
        );
        assert_eq!(frame.kind(), "DELIVER");

        let without_epoch = br#"{"type":"DELIVER","topic":"t","sequence":7,"payload":"AAH/"}"#;
        assert!(matches!(
            ControlFrame::decode(without_epoch).unwrap(),
            ControlFrame::Deliver { epoch: 0, .. }
        ));
    }

    #[test]
    fn unknown_or_malformed_frames_are_rejected() {
        assert!(ControlFrame::decode(br#"{"type":"UNSUBSCRIBE","topic":"t"}"#).is_err());
        assert!(ControlFrame::decode(br#"{"topic":"t"}"#).is_err());
        assert!(ControlFrame::decode(br#"{"type":"PUBLISH","topic":"t","payload":"%%"}"#).is_err());
        assert!(ControlFrame::decode(b"not json").is_err());
    }
}
