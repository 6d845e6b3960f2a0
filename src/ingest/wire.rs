//! Feed wire messages

use crate::models::{ParseOutcome, RawUpdateMessage, RejectReason};
use serde::{Deserialize, Serialize};

/// Outbound subscription request, one per source channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub action: String,
    pub source: String,
    pub message_type: String,
}

impl SubscribeRequest {
    pub fn updates(source: impl Into<String>) -> Self {
        Self {
            action: "subscribe".to_string(),
            source: source.into(),
            message_type: "UPDATE".to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Deserialize)]
struct FeedFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Inbound frame after parsing
#[derive(Debug, Clone, PartialEq)]
pub enum FeedPayload {
    Data(RawUpdateMessage),
    /// Any non-data frame, carrying its type
    Control(String),
}

fn is_data_frame(frame_type: &str) -> bool {
    matches!(frame_type, "data" | "ris_message")
}

/// Parse one text frame. Only data frames have their payload decoded.
pub fn parse_frame(text: &str) -> ParseOutcome<FeedPayload> {
    let outcome: ParseOutcome<FeedFrame> = serde_json::from_str::<FeedFrame>(text).into();

    outcome.and_then(|frame| {
        if !is_data_frame(&frame.frame_type) {
            return ParseOutcome::Parsed(FeedPayload::Control(frame.frame_type));
        }

        match frame.payload.or(frame.data) {
            None | Some(serde_json::Value::Null) => {
                ParseOutcome::Rejected(RejectReason::MissingPayload)
            }
            Some(value) => {
                let update: ParseOutcome<RawUpdateMessage> =
                    serde_json::from_value::<RawUpdateMessage>(value).into();
                update.and_then(|msg| ParseOutcome::Parsed(FeedPayload::Data(msg)))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_request_shape() {
        let json = SubscribeRequest::updates("rrc00").to_json().unwrap();
        assert_eq!(
            json,
            r#"{"action":"subscribe","source":"rrc00","messageType":"UPDATE"}"#
        );
    }

    #[test]
    fn test_data_frame() {
        let text = r#"{"type":"data","payload":{"timestamp":1.5,"peer_asn":3333,"host":"rrc00","withdrawals":["10.0.0.0/24"]}}"#;
        match parse_frame(text) {
            ParseOutcome::Parsed(FeedPayload::Data(msg)) => {
                assert_eq!(msg.peer_asn, Some(3333));
                assert_eq!(msg.withdrawals.len(), 1);
            }
            other => panic!("Expected data frame, got {:?}", other),
        }
    }

    #[test]
    fn test_ris_message_spelling() {
        let text = r#"{"type":"ris_message","data":{"timestamp":2.0,"peer_asn":"1299","host":"rrc21"}}"#;
        assert!(matches!(
            parse_frame(text),
            ParseOutcome::Parsed(FeedPayload::Data(_))
        ));
    }

    #[test]
    fn test_control_frames_ignored() {
        let text = r#"{"type":"ris_subscribe_ok","data":{"subscription":{}}}"#;
        assert_eq!(
            parse_frame(text),
            ParseOutcome::Parsed(FeedPayload::Control("ris_subscribe_ok".into()))
        );

        let pong = r#"{"type":"pong"}"#;
        assert_eq!(
            parse_frame(pong),
            ParseOutcome::Parsed(FeedPayload::Control("pong".into()))
        );
    }

    #[test]
    fn test_rejections() {
        assert_eq!(
            parse_frame(r#"{"type":"data"}"#),
            ParseOutcome::Rejected(RejectReason::MissingPayload)
        );
        assert!(matches!(
            parse_frame("not json"),
            ParseOutcome::Rejected(RejectReason::Malformed(_))
        ));
        assert!(matches!(
            parse_frame(r#"{"type":"data","payload":{"path":"oops"}}"#),
            ParseOutcome::Rejected(RejectReason::Malformed(_))
        ));
    }
}
