//! Durability core of a decentralized object-storage satellite.
//!
//! Clients split objects into segments; each segment is erasure coded into
//! pieces spread across many untrusted storage nodes. This crate keeps
//! every segment recoverable anyway: a checker classifies segment health
//! on a continuous metainfo walk, a repairer rebuilds under-redundant
//! segments onto fresh nodes, and an auditor challenges nodes with random
//! stripes, feeding a Beta-distribution reputation that ultimately
//! disqualifies bad actors.
//!
//! [`DurabilityCore`] assembles the whole subsystem over caller-provided
//! backends and runs it under one cancellation token. Each service can
//! also be used on its own; see the member crates.

pub mod config;
pub mod peer;

pub use config::Config;
pub use peer::Backends;
pub use peer::CoreStats;
pub use peer::DurabilityCore;
