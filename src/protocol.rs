/// Wire message types and the codec boundary.
///
/// The production wire format is protobuf produced by an external
/// codec owned outside this crate; `AkitaMessage` is the decoded,
/// in-memory tagged union the core state machines actually operate on.
/// `encode_message`/`decode_message` are a thin internal stand-in
/// (`serde` + `bincode`) used for tests and for callers that have not
/// wired up the real protobuf toolchain -- swap them for a real codec
/// at this same boundary in production.
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileStart {
    pub filename: String,
    pub total_size: u32,
    pub piece_size: u32,
    pub merkle_root: Option<String>,
    pub piece_hashes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PieceData {
    pub piece_index: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumeRequest {
    pub missing_indices: Vec<u32>,
    pub acknowledged_indices: Vec<u32>,
}

/// Reserved variant. The protocol bundles acknowledgement into
/// `ResumeRequest`; this is accepted on the wire and ignored, for
/// forward compatibility with a future per-piece ack path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Acknowledgement {
    pub piece_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AkitaMessage {
    FileStart(FileStart),
    PieceData(PieceData),
    ResumeRequest(ResumeRequest),
    Acknowledgement(Acknowledgement),
}

pub fn encode_message(msg: &AkitaMessage) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| TransferError::InvalidMessage {
        peer: String::new(),
        reason: format!("encode failed: {e}"),
    })
}

pub fn decode_message(bytes: &[u8]) -> Result<AkitaMessage> {
    bincode::deserialize(bytes).map_err(|e| TransferError::InvalidMessage {
        peer: String::new(),
        reason: format!("decode failed: {e}"),
    })
}

pub fn num_pieces(total_size: u32, piece_size: u32) -> u32 {
    if total_size == 0 {
        return 0;
    }
    total_size.div_ceil(piece_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant() {
        let msgs = vec![
            AkitaMessage::FileStart(FileStart {
                filename: "a.bin".into(),
                total_size: 1000,
                piece_size: 200,
                merkle_root: Some("a".repeat(64)),
                piece_hashes: vec!["b".repeat(64)],
            }),
            AkitaMessage::PieceData(PieceData {
                piece_index: 3,
                data: vec![1, 2, 3],
            }),
            AkitaMessage::ResumeRequest(ResumeRequest {
                missing_indices: vec![1, 2],
                acknowledged_indices: vec![0, 3, 4],
            }),
            AkitaMessage::Acknowledgement(Acknowledgement { piece_index: 7 }),
        ];

        for msg in msgs {
            let encoded = encode_message(&msg).unwrap();
            let decoded = decode_message(&encoded).unwrap();
            assert_eq!(msg, decoded);
        }
    }

    #[test]
    fn decode_garbage_is_invalid_message() {
        let err = decode_message(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, TransferError::InvalidMessage { .. }));
    }

    #[test]
    fn num_pieces_rounds_up() {
        assert_eq!(num_pieces(1000, 200), 5);
        assert_eq!(num_pieces(1001, 200), 6);
        assert_eq!(num_pieces(0, 200), 0);
        assert_eq!(num_pieces(200, 200), 1);
    }
}
