//! Test fixtures for the durability core.
//!
//! [`SimSwarm`] is an in-memory storage-node population that still
//! enforces real order-limit verification, so tests exercise the same
//! authorization path production traffic takes. [`TestSatellite`] wires
//! the full core (overlay, metainfo, orders, repair, audit) over the swarm
//! and in-memory stores.

pub mod harness;
pub mod swarm;

pub use harness::TestSatellite;
pub use swarm::SimSwarm;
