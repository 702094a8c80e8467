//! Pointer namespace and the metainfo observer loop.
//!
//! Two pieces live here: the [`PointerStore`] seam with its
//! compare-and-swap `update_pieces` contract, and the [`MetainfoLoop`]
//! that walks the whole namespace on a cycle and fans each pointer out to
//! joined observers. The segment-health checker is one such observer; the
//! loop itself knows nothing about health.

pub mod store;
pub mod walk;

pub use store::MemoryPointerStore;
pub use store::MetainfoError;
pub use store::PointerStore;
pub use store::UpdateOutcome;
pub use walk::LoopConfig;
pub use walk::LoopError;
pub use walk::MetainfoLoop;
pub use walk::Observer;
