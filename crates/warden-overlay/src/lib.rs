//! Node overlay: dossiers, reputation, selection, and reliability.
//!
//! The overlay is the satellite's view of the storage-node population. It
//! feeds two consumers inside the durability core: the order authority
//! (which refuses to hand work to offline or disqualified nodes) and the
//! repair path (which asks the [`ReliabilityCache`] which pieces are on
//! missing nodes). Reputation updates produced by the audit subsystem flow
//! back in through [`OverlayService::batch_update_stats`]; the cycle is
//! broken by making the cache a read-only snapshot that is rebuilt
//! asynchronously.

pub mod dossier;
pub mod reliability;
pub mod reputation;
pub mod service;
pub mod store;

pub use dossier::NodeCapacity;
pub use dossier::NodeDossier;
pub use dossier::NodeReputation;
pub use reliability::ReliabilityCache;
pub use reputation::ObservationKind;
pub use reputation::ReputationConfig;
pub use reputation::UpdateOutcome;
pub use reputation::VettingThresholds;
pub use service::FindNodesRequest;
pub use service::OverlayConfig;
pub use service::OverlayService;
pub use store::MemoryOverlayStore;
pub use store::OverlayError;
pub use store::OverlayStore;
pub use store::ReputationTuning;
pub use store::SelectionCriteria;
pub use store::StatsUpdate;
