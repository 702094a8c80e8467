//! Piece-store client seam.
//!
//! [`PieceStore`] abstracts the RPC surface of a storage node as seen by
//! the satellite: upload, ranged download, and delete, all authorized by an
//! addressed order limit and signed with the ticket set's piece key. The
//! error taxonomy deliberately distinguishes the failure modes the audit
//! classifier cares about: dial problems (node offline) versus accepted
//! dials that then fail (node contained for reverification).

use async_trait::async_trait;
use snafu::Snafu;

use warden_core::PieceHash;
use warden_core::PieceId;
use warden_orders::AddressedOrderLimit;
use warden_orders::PiecePrivateKey;

/// Errors surfaced by piece-store operations.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum PieceStoreError {
    /// The node did not answer the dial within the deadline.
    #[snafu(display("dial timed out: {address}"))]
    DialTimeout { address: String },

    /// The dial was refused or the address is unreachable.
    #[snafu(display("dial failed: {address}: {message}"))]
    DialFailed { address: String, message: String },

    /// The node answered but does not have the piece.
    #[snafu(display("piece not found: {piece_id}"))]
    NotFound { piece_id: PieceId },

    /// The dial succeeded but the transfer ran out of time.
    #[snafu(display("request deadline exceeded"))]
    DeadlineExceeded,

    /// The node rejected the order limit or order.
    #[snafu(display("request rejected: {message}"))]
    Rejected { message: String },

    /// The transfer failed mid-stream.
    #[snafu(display("transfer failed: {message}"))]
    Transfer { message: String },

    /// The operation was cancelled by the caller.
    #[snafu(display("operation cancelled"))]
    Cancelled,
}

impl PieceStoreError {
    /// Whether the failure happened before the node accepted the dial.
    pub fn is_dial_failure(&self) -> bool {
        matches!(
            self,
            PieceStoreError::DialTimeout { .. } | PieceStoreError::DialFailed { .. }
        )
    }
}

/// Client surface of a storage node's piece RPCs.
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Upload a whole piece; the node returns the signed hash it stored.
    async fn upload(
        &self,
        limit: &AddressedOrderLimit,
        piece_key: &PiecePrivateKey,
        data: &[u8],
    ) -> Result<PieceHash, PieceStoreError>;

    /// Download `length` bytes of the piece starting at `offset`.
    async fn download(
        &self,
        limit: &AddressedOrderLimit,
        piece_key: &PiecePrivateKey,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, PieceStoreError>;

    /// Delete the piece.
    async fn delete(
        &self,
        limit: &AddressedOrderLimit,
        piece_key: &PiecePrivateKey,
    ) -> Result<(), PieceStoreError>;
}
