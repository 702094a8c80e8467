//! Segment-health checker.
//!
//! The checker joins the metainfo loop once per cycle with a health
//! observer that classifies every remote segment against its redundancy
//! scheme, feeds injured segments to the repair queue, and parks
//! irreparable ones. A second, slower loop re-examines the irreparable
//! store page by page and promotes segments whose nodes came back.
//!
//! Classification, as enforced by the thresholds: a segment is *injured*
//! when `required < healthy <= repair` and `healthy < optimal`, and
//! *irreparable* when `healthy <= required` and `healthy < repair`.
//! Schemes with `repair == optimal` therefore never classify as injured;
//! that configuration is only useful in tests and gets a warning.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use warden_core::Pointer;
use warden_core::RedundancyScheme;
use warden_core::SegmentPath;
use warden_metainfo::LoopError;
use warden_metainfo::MetainfoLoop;
use warden_metainfo::Observer;
use warden_overlay::ReliabilityCache;

use crate::error::RepairError;
use crate::irreparable::IrreparableSegment;
use crate::irreparable::IrreparableStore;
use crate::queue::InjuredSegment;
use crate::queue::RepairQueue;

/// Checker cycle tuning.
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Health-check cycle.
    pub interval: Duration,
    /// Irreparable re-scan cycle.
    pub irreparable_interval: Duration,
    /// Page size for the irreparable scan.
    pub irreparable_page_size: usize,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        CheckerConfig {
            interval: Duration::from_secs(30),
            irreparable_interval: Duration::from_secs(30 * 60),
            irreparable_page_size: 1000,
        }
    }
}

/// Cumulative checker counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckerStats {
    pub remote_files_checked: u64,
    pub remote_segments_checked: u64,
    pub remote_segments_needing_repair: u64,
    pub remote_segments_lost: u64,
    /// Distinct objects with at least one lost segment.
    pub remote_files_lost: u64,
}

/// How a remote segment stands against its redundancy scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentHealth {
    Healthy,
    Injured { healthy: usize, missing: Vec<u16> },
    Irreparable { healthy: usize, missing: Vec<u16> },
}

/// Classify a segment by its piece count and missing set.
pub fn classify(
    redundancy: &RedundancyScheme,
    total_pieces: usize,
    missing: Vec<u16>,
) -> SegmentHealth {
    let healthy = total_pieces.saturating_sub(missing.len());
    let required = usize::from(redundancy.required);
    let repair = usize::from(redundancy.repair);
    let optimal = usize::from(redundancy.optimal);

    if healthy > required && healthy <= repair && healthy < optimal {
        SegmentHealth::Injured { healthy, missing }
    } else if healthy <= required && healthy < repair {
        SegmentHealth::Irreparable { healthy, missing }
    } else {
        SegmentHealth::Healthy
    }
}

#[derive(Default)]
struct PassStats {
    remote_files_checked: u64,
    remote_segments_checked: u64,
    remote_segments_needing_repair: u64,
    remote_segments_lost: u64,
    lost_objects: HashSet<String>,
}

/// Metainfo observer that routes segments by health.
pub struct HealthObserver {
    queue: Arc<dyn RepairQueue>,
    irreparable: Arc<dyn IrreparableStore>,
    reliability: Arc<ReliabilityCache>,
    pass: Mutex<PassStats>,
    warned_equal_thresholds: AtomicBool,
}

impl HealthObserver {
    pub fn new(
        queue: Arc<dyn RepairQueue>,
        irreparable: Arc<dyn IrreparableStore>,
        reliability: Arc<ReliabilityCache>,
    ) -> Self {
        HealthObserver {
            queue,
            irreparable,
            reliability,
            pass: Mutex::new(PassStats::default()),
            warned_equal_thresholds: AtomicBool::new(false),
        }
    }

    async fn check_segment(&self, path: &SegmentPath, pointer: &Pointer) -> anyhow::Result<()> {
        let Some(remote) = pointer.remote() else {
            return Ok(());
        };
        if remote.pieces.is_empty() {
            debug!(path = %path, "no pieces on remote segment");
            return Ok(());
        }

        let redundancy = remote.redundancy;
        if redundancy.repair == redundancy.optimal
            && !self.warned_equal_thresholds.swap(true, Ordering::Relaxed)
        {
            warn!(
                repair = redundancy.repair,
                optimal = redundancy.optimal,
                "redundancy scheme has repair == optimal; segments with this \
                 scheme will never classify as injured"
            );
        }

        let missing = self
            .reliability
            .missing_pieces(pointer.created_at, &remote.pieces)
            .await?;

        match classify(&redundancy, remote.pieces.len(), missing) {
            SegmentHealth::Healthy => {}
            SegmentHealth::Injured { healthy, missing } => {
                if missing.is_empty() {
                    // classification demands missing pieces; an empty set
                    // means the scheme itself is inconsistent
                    error!(
                        path = %path,
                        required = redundancy.required,
                        repair = redundancy.repair,
                        optimal = redundancy.optimal,
                        total = redundancy.total,
                        "zero missing pieces on injured segment; bad redundancy scheme"
                    );
                    return Ok(());
                }
                self.pass.lock().remote_segments_needing_repair += 1;
                self.queue
                    .insert(InjuredSegment {
                        path: path.clone(),
                        lost_piece_nums: missing,
                        num_healthy: healthy,
                        inserted_at: Utc::now(),
                    })
                    .await?;
                // the segment is repairable again; drop any stale loss record
                if let Err(error) = self.irreparable.delete(path).await {
                    error!(path = %path, %error, "failed to clear irreparable record");
                }
            }
            SegmentHealth::Irreparable { healthy, missing } => {
                {
                    let mut pass = self.pass.lock();
                    pass.remote_segments_lost += 1;
                    if let Some(object_key) = path.object_key() {
                        pass.lost_objects.insert(object_key);
                    }
                }

                debug!(path = %path, healthy, "segment has become irreparable");
                self.irreparable
                    .upsert(IrreparableSegment {
                        path: path.clone(),
                        pointer: pointer.clone(),
                        lost_pieces: missing.len(),
                        last_attempt_at: Utc::now(),
                        attempts: 1,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    fn take_pass_stats(&self) -> PassStats {
        std::mem::take(&mut *self.pass.lock())
    }
}

#[async_trait]
impl Observer for HealthObserver {
    async fn remote_object(&self, _path: &SegmentPath, _pointer: &Pointer) -> anyhow::Result<()> {
        self.pass.lock().remote_files_checked += 1;
        Ok(())
    }

    async fn remote_segment(&self, path: &SegmentPath, pointer: &Pointer) -> anyhow::Result<()> {
        self.pass.lock().remote_segments_checked += 1;
        self.check_segment(path, pointer).await
    }

    async fn inline_segment(&self, _path: &SegmentPath, _pointer: &Pointer) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Drives the health observer and the irreparable re-scan.
pub struct Checker {
    metainfo_loop: MetainfoLoop,
    queue: Arc<dyn RepairQueue>,
    irreparable: Arc<dyn IrreparableStore>,
    reliability: Arc<ReliabilityCache>,
    config: CheckerConfig,
    stats: Mutex<CheckerStats>,
}

impl Checker {
    pub fn new(
        metainfo_loop: MetainfoLoop,
        queue: Arc<dyn RepairQueue>,
        irreparable: Arc<dyn IrreparableStore>,
        reliability: Arc<ReliabilityCache>,
        config: CheckerConfig,
    ) -> Self {
        Checker {
            metainfo_loop,
            queue,
            irreparable,
            reliability,
            config,
            stats: Mutex::new(CheckerStats::default()),
        }
    }

    pub fn stats(&self) -> CheckerStats {
        *self.stats.lock()
    }

    /// Run both cycles until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            irreparable_interval_secs = self.config.irreparable_interval.as_secs(),
            "checker started"
        );

        let mut check_timer = tokio::time::interval(self.config.interval);
        check_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut irreparable_timer = tokio::time::interval(self.config.irreparable_interval);
        irreparable_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("checker shutting down");
                    return;
                }
                _ = check_timer.tick() => {
                    if let Err(error) = self.identify_injured_segments().await {
                        warn!(%error, "health check pass failed");
                    }
                }
                _ = irreparable_timer.tick() => {
                    if let Err(error) = self.process_irreparable().await {
                        warn!(%error, "irreparable scan failed");
                    }
                }
            }
        }
    }

    /// One full health pass over the namespace.
    pub async fn identify_injured_segments(&self) -> Result<(), LoopError> {
        let observer = Arc::new(HealthObserver::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.irreparable),
            Arc::clone(&self.reliability),
        ));

        let result = self
            .metainfo_loop
            .join(Arc::clone(&observer) as Arc<dyn Observer>)
            .await;

        let pass = observer.take_pass_stats();
        let mut stats = self.stats.lock();
        stats.remote_files_checked += pass.remote_files_checked;
        stats.remote_segments_checked += pass.remote_segments_checked;
        stats.remote_segments_needing_repair += pass.remote_segments_needing_repair;
        stats.remote_segments_lost += pass.remote_segments_lost;
        stats.remote_files_lost += pass.lost_objects.len() as u64;
        drop(stats);

        info!(
            segments = pass.remote_segments_checked,
            needing_repair = pass.remote_segments_needing_repair,
            lost = pass.remote_segments_lost,
            "health pass finished"
        );
        result
    }

    /// One page-by-page scan of the irreparable store.
    ///
    /// Entries that have recovered enough to be injured are promoted to
    /// the repair queue and dropped from the store; entries still lost get
    /// their attempt counter bumped.
    pub async fn process_irreparable(&self) -> Result<(), RepairError> {
        let mut last: Option<SegmentPath> = None;
        loop {
            let page = self
                .irreparable
                .list_after(last.as_ref(), self.config.irreparable_page_size)
                .await?;
            if page.is_empty() {
                return Ok(());
            }
            last = page.last().map(|record| record.path.clone());

            for record in page {
                if let Err(error) = self.reexamine(record).await {
                    error!(%error, "irreparable segment re-check failed");
                }
            }
        }
    }

    async fn reexamine(&self, record: IrreparableSegment) -> Result<(), RepairError> {
        let Some(remote) = record.pointer.remote() else {
            return Ok(());
        };
        let missing = self
            .reliability
            .missing_pieces(record.pointer.created_at, &remote.pieces)
            .await?;

        match classify(&remote.redundancy, remote.pieces.len(), missing) {
            SegmentHealth::Injured { healthy, missing } => {
                info!(path = %record.path, healthy, "irreparable segment recovered to injured");
                self.queue
                    .insert(InjuredSegment {
                        path: record.path.clone(),
                        lost_piece_nums: missing,
                        num_healthy: healthy,
                        inserted_at: Utc::now(),
                    })
                    .await?;
                self.irreparable.delete(&record.path).await?;
            }
            SegmentHealth::Irreparable { missing, .. } => {
                self.irreparable
                    .upsert(IrreparableSegment {
                        path: record.path,
                        pointer: record.pointer,
                        lost_pieces: missing.len(),
                        last_attempt_at: Utc::now(),
                        attempts: record.attempts,
                    })
                    .await?;
            }
            SegmentHealth::Healthy => {}
        }
        Ok(())
    }
}
