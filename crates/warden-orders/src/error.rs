//! Order error types.

use snafu::Snafu;

use warden_core::SerialNumber;
use warden_overlay::OverlayError;

/// Errors from minting, verifying, and settling orders.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum OrdersError {
    /// Serialization of signable bytes failed.
    #[snafu(display("failed to encode signable bytes: {message}"))]
    Encode { message: String },

    /// A cryptographic check failed; refuse, do not penalize the asker.
    #[snafu(display("untrusted: {message}"))]
    Untrusted { message: String },

    /// The client violated the order protocol.
    #[snafu(display("protocol violation: {message}"))]
    Protocol { message: String },

    /// The serial was already settled.
    #[snafu(display("duplicate request: serial {serial} already used"))]
    DuplicateSerial { serial: SerialNumber },

    /// The ticket or piece is expired, or outside the grace window.
    #[snafu(display("order rejected: {message}"))]
    Expired { message: String },

    /// Not enough reachable nodes to authorize the transfer.
    #[snafu(display("not enough orderable nodes: required {required}, found {found}"))]
    NotEnoughNodes { required: usize, found: usize },

    /// Overlay lookup failed.
    #[snafu(display("overlay lookup failed: {source}"))]
    Overlay { source: OverlayError },
}
