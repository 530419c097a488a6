// WebSocket wire messages exchanged with subscribers.
//
// Server-to-client event frames are the serialized `AuctionEvent`
// variants themselves (see `events`); this module covers the inbound
// vocabulary and the error frame.

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Frames a connected client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { auction_id: String },
    Unsubscribe { auction_id: String },
}

/// Frame sent when a client request cannot be honored. `code` is the
/// stable machine-readable failure kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub code: String,
    pub message: String,
}

impl ErrorFrame {
    pub fn from_error(err: &ServiceError) -> Self {
        ErrorFrame {
            frame_type: "error".into(),
            code: err.kind().into(),
            message: err.public_message(),
        }
    }

    pub fn malformed() -> Self {
        ErrorFrame {
            frame_type: "error".into(),
            code: "invalid_argument".into(),
            message: "malformed message".into(),
        }
    }
}

/// Parse a raw text frame from a client.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe() {
        let msg = parse_client_message(r#"{"type":"subscribe","auction_id":"a1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                auction_id: "a1".into()
            }
        );
    }

    #[test]
    fn parses_unsubscribe() {
        let msg = parse_client_message(r#"{"type":"unsubscribe","auction_id":"a1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Unsubscribe {
                auction_id: "a1".into()
            }
        );
    }

    #[test]
    fn rejects_unknown_type_and_garbage() {
        assert!(parse_client_message(r#"{"type":"place_bid","auction_id":"a1"}"#).is_err());
        assert!(parse_client_message("not json at all").is_err());
        assert!(parse_client_message(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn error_frame_carries_kind_and_message() {
        let err = ServiceError::BidTooLow { minimum: 600 };
        let frame = ErrorFrame::from_error(&err);
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "bid_too_low");
        assert!(json["message"].as_str().unwrap().contains("600"));
    }

    #[test]
    fn internal_errors_stay_opaque_on_the_wire() {
        let err = ServiceError::internal(anyhow::anyhow!("connection pool exhausted at worker 3"));
        let frame = ErrorFrame::from_error(&err);
        assert_eq!(frame.code, "internal");
        assert_eq!(frame.message, "internal error");
    }
}
