//! Network identifiers.
//!
//! All identifiers are fixed-width byte arrays so they can be compared,
//! hashed, and persisted without allocation. Piece IDs are derived, never
//! minted: every piece of a segment is named by a deterministic function of
//! the segment's root piece ID, the node holding it, and the piece number,
//! so storage nodes and the satellite always agree on piece names without
//! coordination.

use std::fmt;

use hmac::Hmac;
use hmac::Mac;
use serde::Deserialize;
use serde::Serialize;
use sha2::Sha512_256;

/// Identifier of a storage node, derived from its long-term key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// The all-zero node ID, never assigned to a real node.
    pub const ZERO: NodeId = NodeId([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..6]))
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        NodeId(bytes)
    }
}

/// Identifier of a single erasure-coded piece.
///
/// A segment's pieces share a root piece ID stored in the pointer; the
/// per-piece ID is produced by [`PieceId::derive`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PieceId(pub [u8; 32]);

impl PieceId {
    pub const ZERO: PieceId = PieceId([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive the piece ID stored on `node_id` as piece `piece_num`.
    ///
    /// The derivation is HMAC-SHA-512/256 keyed by the root piece ID over
    /// `node_id || varint(piece_num)`. Storage nodes compute the same
    /// function independently, so the encoding must never change.
    pub fn derive(&self, node_id: NodeId, piece_num: u16) -> PieceId {
        type HmacSha512_256 = Hmac<Sha512_256>;

        let mut mac =
            HmacSha512_256::new_from_slice(&self.0).expect("HMAC accepts keys of any size");
        mac.update(node_id.as_bytes());
        mac.update(&varint(u64::from(piece_num)));

        let digest = mac.finalize().into_bytes();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        PieceId(out)
    }
}

impl fmt::Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

impl fmt::Debug for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceId({})", hex::encode(&self.0[..6]))
    }
}

impl From<[u8; 32]> for PieceId {
    fn from(bytes: [u8; 32]) -> Self {
        PieceId(bytes)
    }
}

/// Single-use serial number carried by an order limit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SerialNumber(pub [u8; 16]);

impl SerialNumber {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerialNumber({})", hex::encode(self.0))
    }
}

impl From<[u8; 16]> for SerialNumber {
    fn from(bytes: [u8; 16]) -> Self {
        SerialNumber(bytes)
    }
}

/// Unsigned LEB128, the varint form used by the piece derivation function.
fn varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(2);
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}
