//! Repair error types.

use snafu::Snafu;

use warden_core::SegmentPath;
use warden_ec::EcError;
use warden_metainfo::MetainfoError;
use warden_orders::OrdersError;
use warden_overlay::OverlayError;

/// Errors from the checker, the queues, and the repairer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RepairError {
    /// Durability is lost: too few healthy pieces even to detect errors.
    #[snafu(display(
        "segment {path} cannot be repaired: only {healthy} healthy pieces, {needed} required"
    ))]
    IrreparableSegment {
        path: SegmentPath,
        healthy: usize,
        needed: usize,
    },

    /// Inline segments never reach the repair queue legitimately.
    #[snafu(display("cannot repair inline segment {path}"))]
    InlineSegment { path: SegmentPath },

    /// Queue backend failure.
    #[snafu(display("repair queue error: {message}"))]
    Queue { message: String },

    /// Irreparable store backend failure.
    #[snafu(display("irreparable store error: {message}"))]
    Irreparable { message: String },

    #[snafu(display("pointer access failed: {source}"))]
    Metainfo { source: MetainfoError },

    #[snafu(display("overlay access failed: {source}"))]
    Overlay { source: OverlayError },

    #[snafu(display("order minting failed: {source}"))]
    Orders { source: OrdersError },

    #[snafu(display("erasure transfer failed: {source}"))]
    Ec { source: EcError },
}

impl From<MetainfoError> for RepairError {
    fn from(source: MetainfoError) -> Self {
        RepairError::Metainfo { source }
    }
}

impl From<OverlayError> for RepairError {
    fn from(source: OverlayError) -> Self {
        RepairError::Overlay { source }
    }
}

impl From<OrdersError> for RepairError {
    fn from(source: OrdersError) -> Self {
        RepairError::Orders { source }
    }
}

impl From<EcError> for RepairError {
    fn from(source: EcError) -> Self {
        RepairError::Ec { source }
    }
}
