//! Direct-channel wire framing
//!
//! Control frames travel as JSON text messages; chunk payloads travel as raw
//! binary messages with no envelope. A `chunk-metadata` frame is always
//! immediately followed by the binary frame it describes.

use crate::error::{Error, Result};
use crate::types::{ChunkDescriptor, TransferMetadata};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One message as carried by a direct channel
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    /// Wire length in bytes, used for buffered-amount accounting
    pub fn len(&self) -> usize {
        match self {
            Message::Text(s) => s.len(),
            Message::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The control frames of the transfer protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlFrame {
    /// Announces a transfer; first frame on every channel
    #[serde(rename = "metadata")]
    Metadata { metadata: TransferMetadata },
    /// Describes the binary frame that immediately follows
    #[serde(rename = "chunk-metadata")]
    ChunkMetadata { metadata: ChunkDescriptor },
    /// Final frame, carrying the sender's finished metadata
    #[serde(rename = "complete")]
    Complete { metadata: TransferMetadata },
}

/// A decoded frame: either a control frame or a raw chunk
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlFrame),
    Chunk(Bytes),
}

impl Frame {
    /// Encode for the wire
    pub fn encode(&self) -> Result<Message> {
        match self {
            Frame::Control(ctrl) => Ok(Message::Text(serde_json::to_string(ctrl)?)),
            Frame::Chunk(bytes) => Ok(Message::Binary(bytes.clone())),
        }
    }

    /// Decode a received message
    ///
    /// Binary messages have no envelope, so any binary message is a chunk;
    /// text messages must parse as a known control frame.
    pub fn decode(msg: Message) -> Result<Frame> {
        match msg {
            Message::Text(text) => {
                let ctrl: ControlFrame = serde_json::from_str(&text)
                    .map_err(|e| Error::Protocol(format!("invalid control frame: {}", e)))?;
                Ok(Frame::Control(ctrl))
            }
            Message::Binary(bytes) => Ok(Frame::Chunk(bytes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TransferDirection, TransferStatus};

    fn test_metadata() -> TransferMetadata {
        TransferMetadata {
            id: "abc123".into(),
            sid: "peer-1".into(),
            name: "report.pdf".into(),
            size: 300000,
            mime_type: Some("application/pdf".into()),
            last_modified: 1700000000000,
            chunk_size: 131072,
            total_chunks: 3,
            received_chunks: 0,
            status: TransferStatus::Pending,
            direction: TransferDirection::Sending,
        }
    }

    #[test]
    fn test_control_frame_tags() {
        let frame = Frame::Control(ControlFrame::ChunkMetadata {
            metadata: ChunkDescriptor {
                transfer_id: "abc123".into(),
                index: 1,
                progress: 66.67,
            },
        });
        let msg = frame.encode().unwrap();
        let Message::Text(text) = &msg else {
            panic!("control frames encode as text");
        };
        let json: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(json["type"], "chunk-metadata");
        assert_eq!(json["metadata"]["transferId"], "abc123");
        assert_eq!(json["metadata"]["index"], 1);
        assert_eq!(json["metadata"]["progress"], 66.67);

        assert_eq!(Frame::decode(msg).unwrap(), frame);
    }

    #[test]
    fn test_metadata_frame_roundtrip() {
        let frame = Frame::Control(ControlFrame::Metadata {
            metadata: test_metadata(),
        });
        let decoded = Frame::decode(frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_binary_is_chunk() {
        let payload = Bytes::from_static(b"\x00\x01\x02\x03");
        let decoded = Frame::decode(Message::Binary(payload.clone())).unwrap();
        assert_eq!(decoded, Frame::Chunk(payload));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Frame::decode(Message::Text(r#"{"type":"resume","metadata":{}}"#.into()))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_non_json_text_rejected() {
        let err = Frame::decode(Message::Text("not json".into())).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
