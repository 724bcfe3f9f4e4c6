//! Frames exchanged with remote clients.
//!
//! Each frame is a JSON document carried in a length-delimited frame
//! (4-byte big-endian length prefix).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::dead_letter::DeadLetterId;
use crate::record::Record;
use crate::relay::ticket::TicketId;

/// Upper bound on a single frame, in bytes
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Sent by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Push {
        ticket_id: TicketId,
        record: Record,
    },
    PullResponse {
        records: Vec<Delivery>,
    },
    ViewResponse {
        message_id: DeadLetterId,
        /// None when no dead letter has this id
        record: Option<Record>,
        /// Why `record` is missing
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        message: String,
    },
}

/// Sent by a remote client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ack { ticket_id: TicketId },
    PullRequest { max_records: usize },
    ViewRequest { message_id: DeadLetterId },
}

/// A record handed out on pull, with the ticket to acknowledge it by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub ticket_id: TicketId,
    pub record: Record,
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(frame).map(Bytes::from)
}

pub fn decode<'a, T: Deserialize<'a>>(buf: &'a [u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frames_wire_format() {
        let ack: ClientFrame = decode(br#"{"type":"ack","ticket_id":12}"#).unwrap();
        assert_eq!(ack, ClientFrame::Ack { ticket_id: TicketId(12) });

        let pull: ClientFrame = decode(br#"{"type":"pull_request","max_records":5}"#).unwrap();
        assert_eq!(pull, ClientFrame::PullRequest { max_records: 5 });

        let view: ClientFrame = decode(br#"{"type":"view_request","message_id":3}"#).unwrap();
        assert_eq!(view, ClientFrame::ViewRequest { message_id: DeadLetterId(3) });

        assert!(decode::<ClientFrame>(br#"{"type":"nope"}"#).is_err());
    }

    #[test]
    fn test_view_response_not_found_is_null_record() {
        let frame = ServerFrame::ViewResponse {
            message_id: DeadLetterId(9),
            record: None,
            reason: Some("dead letter 9 was purged".to_string()),
        };
        let json: serde_json::Value = serde_json::from_slice(&encode(&frame).unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "view_response",
                "message_id": 9,
                "record": null,
                "reason": "dead letter 9 was purged"
            })
        );

        let bare: ServerFrame =
            decode(br#"{"type":"view_response","message_id":9,"record":null}"#).unwrap();
        assert_eq!(
            bare,
            ServerFrame::ViewResponse {
                message_id: DeadLetterId(9),
                record: None,
                reason: None
            }
        );
    }
}
