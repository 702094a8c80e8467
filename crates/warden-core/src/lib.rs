//! Core types shared across the warden durability core.
//!
//! This crate holds the vocabulary of the satellite: node and piece
//! identifiers, segment paths, and the pointer records that describe where
//! every segment's erasure-coded pieces live. It has no I/O and no async;
//! the service crates build on these types.

pub mod id;
pub mod path;
pub mod pointer;

pub use id::NodeId;
pub use id::PieceId;
pub use id::SerialNumber;
pub use path::SegmentPath;
pub use pointer::ErasureAlgorithm;
pub use pointer::PieceHash;
pub use pointer::Pointer;
pub use pointer::PointerError;
pub use pointer::RedundancyScheme;
pub use pointer::RemotePiece;
pub use pointer::RemoteSegment;
pub use pointer::Segment;
