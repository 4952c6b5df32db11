/// Piece hashing and Merkle root construction.
///
/// Piece hashes are lowercase-hex SHA-256, matching the digest format
/// used throughout the wire protocol. The Merkle tree uses a
/// duplicate-last-node rule at odd levels rather than zero-padding, so
/// the root changes whenever the leaf set's length parity changes.
use sha2::{Digest, Sha256};

use crate::error::{Result, TransferError};

/// SHA-256 of `data`, as lowercase hex.
pub fn piece_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Combine two raw 32-byte digests into their parent: SHA-256(left || right).
fn combine(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let out = hasher.finalize();
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&out);
    digest
}

fn decode_digest(hex_hash: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_hash).map_err(|e| TransferError::InvalidMessage {
        peer: String::new(),
        reason: format!("not valid hex: {e}"),
    })?;
    bytes.try_into().map_err(|_| TransferError::InvalidMessage {
        peer: String::new(),
        reason: "hash is not 32 bytes".into(),
    })
}

/// Merkle root over an ordered list of hex-encoded piece hashes.
///
/// Levels are reduced pairwise left-to-right; an odd node at a level is
/// paired with itself (duplicated) rather than dropped or zero-padded.
/// Fails when `hashes` is empty -- there is no tree to root.
pub fn merkle_root(hashes: &[String]) -> Result<String> {
    if hashes.is_empty() {
        return Err(TransferError::InvalidMessage {
            peer: String::new(),
            reason: "merkle_root requires at least one piece hash".into(),
        });
    }

    let mut level: Vec<[u8; 32]> = hashes
        .iter()
        .map(|h| decode_digest(h))
        .collect::<Result<_>>()?;

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut i = 0;
        while i < level.len() {
            let left = level[i];
            let right = if i + 1 < level.len() { level[i + 1] } else { level[i] };
            next.push(combine(&left, &right));
            i += 2;
        }
        level = next;
    }

    Ok(hex::encode(level[0]))
}
