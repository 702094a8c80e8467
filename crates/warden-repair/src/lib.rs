//! Segment repair: health checking, queueing, and reconstruction.
//!
//! The [`Checker`] rides the metainfo loop and sorts remote segments into
//! healthy, injured (queued for repair), and irreparable (parked for
//! re-scanning). The [`RepairService`] drains the queue with a bounded
//! worker pool, and [`SegmentRepairer`] performs the actual download,
//! decode, re-encode, upload, and compare-and-swap pointer update for one
//! segment at a time.

pub mod checker;
pub mod error;
pub mod irreparable;
pub mod queue;
pub mod repairer;

pub use checker::classify;
pub use checker::Checker;
pub use checker::CheckerConfig;
pub use checker::CheckerStats;
pub use checker::HealthObserver;
pub use checker::SegmentHealth;
pub use error::RepairError;
pub use irreparable::IrreparableSegment;
pub use irreparable::IrreparableStore;
pub use irreparable::MemoryIrreparableStore;
pub use queue::InjuredSegment;
pub use queue::MemoryRepairQueue;
pub use queue::RepairQueue;
pub use repairer::RepairOutcome;
pub use repairer::RepairService;
pub use repairer::RepairerConfig;
pub use repairer::RepairerStats;
pub use repairer::SegmentRepairer;
