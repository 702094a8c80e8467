//! Segment pointers.
//!
//! A pointer is the satellite's authoritative record of where a segment
//! lives: either a small inline blob, or the erasure parameters and piece
//! placement of a remote segment. Pointers are persisted as length-prefixed
//! postcard records; `created_at` doubles as the compare-and-swap token for
//! all concurrent mutation, so repair never changes it.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

use crate::NodeId;
use crate::PieceId;

/// Errors from pointer validation and persistence.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PointerError {
    /// Redundancy thresholds are out of order or zero.
    #[snafu(display(
        "invalid redundancy scheme: required={required} repair={repair} optimal={optimal} total={total}"
    ))]
    InvalidRedundancy {
        required: u16,
        repair: u16,
        optimal: u16,
        total: u16,
    },

    /// Two pieces in one pointer claim the same piece number.
    #[snafu(display("duplicate piece number {piece_num} in pointer"))]
    DuplicatePieceNum { piece_num: u16 },

    /// Two pieces in one pointer live on the same node.
    #[snafu(display("duplicate node {node_id} in pointer"))]
    DuplicateNode { node_id: NodeId },

    /// A piece number is outside `[0, total)`.
    #[snafu(display("piece number {piece_num} exceeds total {total}"))]
    PieceNumOutOfRange { piece_num: u16, total: u16 },

    /// The persisted record could not be decoded.
    #[snafu(display("malformed pointer record: {message}"))]
    Decode { message: String },
}

/// Erasure code family used for a remote segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErasureAlgorithm {
    ReedSolomon,
}

/// Erasure parameters of a remote segment.
///
/// `required` (k) pieces reconstruct the segment, `repair` (r) is the
/// floor below which repair triggers, `optimal` (s) is the upload success
/// target, and `total` (n) is the full piece count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyScheme {
    pub algorithm: ErasureAlgorithm,
    pub required: u16,
    pub repair: u16,
    pub optimal: u16,
    pub total: u16,
    /// Bytes of one erasure share, the smallest auditable unit of a piece.
    pub share_size: u32,
}

impl RedundancyScheme {
    pub fn new(required: u16, repair: u16, optimal: u16, total: u16, share_size: u32) -> Self {
        RedundancyScheme {
            algorithm: ErasureAlgorithm::ReedSolomon,
            required,
            repair,
            optimal,
            total,
            share_size,
        }
    }

    /// Check `1 <= k <= r <= s <= n` and a non-zero share size.
    pub fn validate(&self) -> Result<(), PointerError> {
        let ordered = self.required >= 1
            && self.required <= self.repair
            && self.repair <= self.optimal
            && self.optimal <= self.total;
        if !ordered || self.share_size == 0 {
            return Err(PointerError::InvalidRedundancy {
                required: self.required,
                repair: self.repair,
                optimal: self.optimal,
                total: self.total,
            });
        }
        Ok(())
    }

    /// Bytes covered by one stripe across the `required` data pieces.
    pub fn stripe_size(&self) -> u64 {
        u64::from(self.required) * u64::from(self.share_size)
    }

    /// Segment size rounded up to a whole number of stripes.
    pub fn padded_size(&self, segment_size: u64) -> u64 {
        let stripe = self.stripe_size();
        segment_size.div_ceil(stripe) * stripe
    }

    /// Size of each stored piece for a segment of `segment_size` bytes.
    pub fn piece_size(&self, segment_size: u64) -> u64 {
        self.padded_size(segment_size) / u64::from(self.required)
    }

    /// Number of stripes in a segment of `segment_size` bytes.
    pub fn stripe_count(&self, segment_size: u64) -> u64 {
        self.padded_size(segment_size) / self.stripe_size()
    }
}

/// Hash of an uploaded piece, signed by whoever uploaded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceHash {
    pub piece_id: PieceId,
    pub hash: [u8; 32],
    /// Ed25519 signature by the uploader's ephemeral piece key.
    pub signature: Vec<u8>,
}

/// One erasure-coded piece of a remote segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePiece {
    pub piece_num: u16,
    pub node_id: NodeId,
    pub hash: Option<PieceHash>,
}

/// The remote half of a pointer: erasure parameters plus piece placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSegment {
    pub root_piece_id: PieceId,
    pub redundancy: RedundancyScheme,
    pub pieces: Vec<RemotePiece>,
}

impl RemoteSegment {
    /// Validate the scheme and the uniqueness invariants of the piece set.
    pub fn validate(&self) -> Result<(), PointerError> {
        self.redundancy.validate()?;

        let mut nums = std::collections::HashSet::new();
        let mut nodes = std::collections::HashSet::new();
        for piece in &self.pieces {
            if piece.piece_num >= self.redundancy.total {
                return Err(PointerError::PieceNumOutOfRange {
                    piece_num: piece.piece_num,
                    total: self.redundancy.total,
                });
            }
            if !nums.insert(piece.piece_num) {
                return Err(PointerError::DuplicatePieceNum {
                    piece_num: piece.piece_num,
                });
            }
            if !nodes.insert(piece.node_id) {
                return Err(PointerError::DuplicateNode {
                    node_id: piece.node_id,
                });
            }
        }
        Ok(())
    }

    pub fn piece_for_num(&self, piece_num: u16) -> Option<&RemotePiece> {
        self.pieces.iter().find(|p| p.piece_num == piece_num)
    }

    pub fn piece_for_node(&self, node_id: NodeId) -> Option<&RemotePiece> {
        self.pieces.iter().find(|p| p.node_id == node_id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.pieces.iter().map(|p| p.node_id).collect()
    }
}

/// Where the segment's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Segment {
    /// Small segments are stored directly in the pointer.
    Inline(Vec<u8>),
    /// Larger segments are erasure coded across storage nodes.
    Remote(RemoteSegment),
}

/// Authoritative description of one stored segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointer {
    pub segment: Segment,
    /// Set when the uplink commits the segment; unchanged by repair.
    /// Serves as the compare-and-swap token for every pointer mutation.
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Plaintext byte count of the segment.
    pub segment_size: u64,
    /// Opaque uplink metadata, never interpreted by the satellite.
    pub metadata: Vec<u8>,
}

impl Pointer {
    pub fn is_remote(&self) -> bool {
        matches!(self.segment, Segment::Remote(_))
    }

    pub fn remote(&self) -> Option<&RemoteSegment> {
        match &self.segment {
            Segment::Remote(remote) => Some(remote),
            Segment::Inline(_) => None,
        }
    }

    pub fn remote_mut(&mut self) -> Option<&mut RemoteSegment> {
        match &mut self.segment {
            Segment::Remote(remote) => Some(remote),
            Segment::Inline(_) => None,
        }
    }

    /// Encode to the persisted binary record.
    pub fn encode(&self) -> Result<Vec<u8>, PointerError> {
        postcard::to_stdvec(self).map_err(|e| PointerError::Decode {
            message: e.to_string(),
        })
    }

    /// Decode a persisted binary record.
    pub fn decode(bytes: &[u8]) -> Result<Pointer, PointerError> {
        postcard::from_bytes(bytes).map_err(|e| PointerError::Decode {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> RedundancyScheme {
        RedundancyScheme::new(2, 3, 4, 5, 256)
    }

    fn remote_with_pieces(pieces: Vec<RemotePiece>) -> RemoteSegment {
        RemoteSegment {
            root_piece_id: PieceId([9u8; 32]),
            redundancy: scheme(),
            pieces,
        }
    }

    fn piece(num: u16, node: u8) -> RemotePiece {
        RemotePiece {
            piece_num: num,
            node_id: NodeId([node; 32]),
            hash: None,
        }
    }

    #[test]
    fn scheme_validates_ordering() {
        assert!(scheme().validate().is_ok());
        assert!(RedundancyScheme::new(3, 2, 4, 5, 256).validate().is_err());
        assert!(RedundancyScheme::new(0, 0, 0, 0, 256).validate().is_err());
        assert!(RedundancyScheme::new(2, 3, 4, 5, 0).validate().is_err());
        // equal thresholds are allowed
        assert!(RedundancyScheme::new(2, 2, 2, 2, 64).validate().is_ok());
    }

    #[test]
    fn size_math() {
        let rs = scheme();
        assert_eq!(rs.stripe_size(), 512);
        assert_eq!(rs.padded_size(1), 512);
        assert_eq!(rs.padded_size(512), 512);
        assert_eq!(rs.padded_size(513), 1024);
        assert_eq!(rs.piece_size(513), 512);
        assert_eq!(rs.stripe_count(1024), 2);
    }

    #[test]
    fn remote_rejects_duplicates() {
        let dup_num = remote_with_pieces(vec![piece(0, 1), piece(0, 2)]);
        assert!(matches!(
            dup_num.validate(),
            Err(PointerError::DuplicatePieceNum { piece_num: 0 })
        ));

        let dup_node = remote_with_pieces(vec![piece(0, 1), piece(1, 1)]);
        assert!(matches!(
            dup_node.validate(),
            Err(PointerError::DuplicateNode { .. })
        ));

        let out_of_range = remote_with_pieces(vec![piece(5, 1)]);
        assert!(matches!(
            out_of_range.validate(),
            Err(PointerError::PieceNumOutOfRange { piece_num: 5, .. })
        ));
    }

    #[test]
    fn pointer_roundtrip() {
        let pointer = Pointer {
            segment: Segment::Remote(remote_with_pieces(vec![piece(0, 1), piece(1, 2)])),
            created_at: Utc::now(),
            expires_at: None,
            segment_size: 4096,
            metadata: vec![1, 2, 3],
        };

        let bytes = pointer.encode().unwrap();
        let decoded = Pointer::decode(&bytes).unwrap();
        assert_eq!(decoded, pointer);
    }

    #[test]
    fn inline_pointer_has_no_remote() {
        let pointer = Pointer {
            segment: Segment::Inline(b"tiny".to_vec()),
            created_at: Utc::now(),
            expires_at: None,
            segment_size: 4,
            metadata: Vec::new(),
        };
        assert!(!pointer.is_remote());
        assert!(pointer.remote().is_none());
    }
}
