//! Audit error types.

use snafu::Snafu;

use warden_core::NodeId;
use warden_core::SegmentPath;
use warden_ec::SchemeError;
use warden_metainfo::MetainfoError;
use warden_orders::OrdersError;
use warden_overlay::OverlayError;

/// Errors from audit verification.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AuditError {
    /// The audited segment was deleted or overwritten mid-audit.
    #[snafu(display("segment deleted during audit: {path}"))]
    SegmentDeleted { path: SegmentPath },

    /// Too few shares arrived to run erasure verification.
    ///
    /// Carries the offline and failed sets observed so far; no reputation
    /// is changed on this path.
    #[snafu(display("not enough shares for audit: got {got}, required {required}"))]
    NotEnoughShares {
        got: usize,
        required: usize,
        offlines: Vec<NodeId>,
        fails: Vec<NodeId>,
    },

    /// Inline segments have no pieces to audit.
    #[snafu(display("cannot audit inline segment {path}"))]
    InlineSegment { path: SegmentPath },

    /// Erasure verification could not settle the stripe.
    #[snafu(display("stripe verification failed: {source}"))]
    Erasure { source: SchemeError },

    /// Applying an audit report left observations unrecorded.
    #[snafu(display("audit report incomplete: {remaining} observations unapplied"))]
    ReportIncomplete { remaining: usize },

    #[snafu(display("pointer access failed: {source}"))]
    Metainfo { source: MetainfoError },

    #[snafu(display("order minting failed: {source}"))]
    Orders { source: OrdersError },

    #[snafu(display("overlay access failed: {source}"))]
    Overlay { source: OverlayError },

    /// Containment backend failure.
    #[snafu(display("containment store error: {message}"))]
    Containment { message: String },
}

impl From<MetainfoError> for AuditError {
    fn from(source: MetainfoError) -> Self {
        AuditError::Metainfo { source }
    }
}

impl From<OrdersError> for AuditError {
    fn from(source: OrdersError) -> Self {
        AuditError::Orders { source }
    }
}

impl From<OverlayError> for AuditError {
    fn from(source: OverlayError) -> Self {
        AuditError::Overlay { source }
    }
}

impl From<SchemeError> for AuditError {
    fn from(source: SchemeError) -> Self {
        AuditError::Erasure { source }
    }
}
