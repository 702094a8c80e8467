//! Erasure coding: the Reed-Solomon scheme and the piece client.
//!
//! [`Scheme`] owns the codec math, including corruption location on top of
//! the library's reconstruct/verify. [`EcClient`] drives parallel piece
//! transfers with long-tail cancellation for uploads and forced error
//! detection for reads. The [`PieceStore`] trait is the seam the test
//! swarm implements in memory and a production build implements over the
//! storage-node RPC.

pub mod client;
pub mod scheme;
pub mod store;

pub use client::EcClient;
pub use client::EcError;
pub use client::PutResult;
pub use client::SuccessfulPut;
pub use scheme::Correction;
pub use scheme::Scheme;
pub use scheme::SchemeError;
pub use store::PieceStore;
pub use store::PieceStoreError;
