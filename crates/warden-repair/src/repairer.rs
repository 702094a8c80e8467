//! Segment repairer.
//!
//! Rebuilds an under-redundant segment: download the surviving pieces,
//! erasure-decode with forced error detection, re-encode, and upload fresh
//! pieces to newly selected nodes under a wall-clock long-tail deadline.
//! The pointer is written exactly once, after the full outcome is known,
//! and only if no uplink overwrote the segment in the meantime; the
//! compare-and-swap token is the pointer's `created_at`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use warden_core::RemotePiece;
use warden_core::SegmentPath;
use warden_ec::EcClient;
use warden_metainfo::MetainfoError;
use warden_metainfo::PointerStore;
use warden_metainfo::UpdateOutcome;
use warden_orders::OrderService;
use warden_overlay::FindNodesRequest;
use warden_overlay::OverlayService;
use warden_overlay::ReliabilityCache;

use crate::error::RepairError;
use crate::irreparable::IrreparableSegment;
use crate::irreparable::IrreparableStore;
use crate::queue::RepairQueue;

/// Repairer tuning.
#[derive(Debug, Clone)]
pub struct RepairerConfig {
    /// Long-tail cap on repair uploads.
    pub timeout: Duration,
    /// Headroom multiplier over the optimal threshold when selecting new
    /// nodes; negative values are treated as zero.
    pub excess_optimal: f64,
    /// Bounded worker pool size.
    pub max_workers: usize,
    /// Poll delay when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for RepairerConfig {
    fn default() -> Self {
        RepairerConfig {
            timeout: Duration::from_secs(120),
            excess_optimal: 0.05,
            max_workers: 4,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// How one repair attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The segment reached its success threshold; all unhealthy pieces
    /// were removed.
    Full,
    /// Above the repair threshold but below success; unrepaired unhealthy
    /// pieces stay in the pointer so they can still serve reads.
    Partial,
    /// Still at or below the repair threshold after uploading.
    Failed,
    /// The segment was already healthy enough; nothing to do.
    NotNeeded,
    /// The pointer disappeared before repair started.
    Vanished,
    /// An uplink overwrote the segment mid-repair; nothing was written.
    Superseded,
}

/// Cumulative repairer counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepairerStats {
    pub attempts: u64,
    pub full: u64,
    pub partial: u64,
    pub failed: u64,
    pub irreparable: u64,
    pub not_needed: u64,
    pub superseded: u64,
}

/// Rebuilds single segments.
pub struct SegmentRepairer {
    metainfo: Arc<dyn PointerStore>,
    orders: Arc<OrderService>,
    overlay: Arc<OverlayService>,
    reliability: Arc<ReliabilityCache>,
    ec: EcClient,
    timeout: Duration,
    multiplier_optimal: f64,
    stats: Mutex<RepairerStats>,
}

impl SegmentRepairer {
    pub fn new(
        metainfo: Arc<dyn PointerStore>,
        orders: Arc<OrderService>,
        overlay: Arc<OverlayService>,
        reliability: Arc<ReliabilityCache>,
        ec: EcClient,
        config: &RepairerConfig,
    ) -> Self {
        SegmentRepairer {
            metainfo,
            orders,
            overlay,
            reliability,
            // repairs must never trust pieces blindly
            ec: ec.with_force_error_detection(true),
            timeout: config.timeout,
            multiplier_optimal: 1.0 + config.excess_optimal.max(0.0),
            stats: Mutex::new(RepairerStats::default()),
        }
    }

    pub fn stats(&self) -> RepairerStats {
        *self.stats.lock()
    }

    /// Repair one segment.
    pub async fn repair(&self, path: &SegmentPath) -> Result<RepairOutcome, RepairError> {
        self.stats.lock().attempts += 1;

        let pointer = match self.metainfo.get(path).await {
            Ok(pointer) => pointer,
            Err(MetainfoError::PointerNotFound { .. }) => {
                debug!(path = %path, "segment deleted before repair");
                return Ok(RepairOutcome::Vanished);
            }
            Err(source) => return Err(RepairError::Metainfo { source }),
        };
        let Some(remote) = pointer.remote() else {
            return Err(RepairError::InlineSegment { path: path.clone() });
        };

        let redundancy = remote.redundancy;
        let piece_size = redundancy.piece_size(pointer.segment_size);
        let missing = self
            .reliability
            .missing_pieces(pointer.created_at, &remote.pieces)
            .await?;
        let num_healthy = remote.pieces.len() - missing.len();

        // one spare piece beyond the reconstruction minimum is required to
        // detect corrupted pieces during the download
        let needed = usize::from(redundancy.required) + 1;
        if num_healthy < needed {
            self.stats.lock().irreparable += 1;
            return Err(RepairError::IrreparableSegment {
                path: path.clone(),
                healthy: num_healthy,
                needed,
            });
        }

        if num_healthy > usize::from(redundancy.repair) {
            debug!(
                path = %path,
                healthy = num_healthy,
                repair_threshold = redundancy.repair,
                "segment above repair threshold, nothing to do"
            );
            self.stats.lock().not_needed += 1;
            return Ok(RepairOutcome::NotNeeded);
        }

        let missing_set: std::collections::HashSet<u16> = missing.iter().copied().collect();
        let mut healthy_pieces = Vec::new();
        let mut unhealthy_pieces = Vec::new();
        let mut exclude_node_ids = Vec::new();
        for piece in &remote.pieces {
            exclude_node_ids.push(piece.node_id);
            if missing_set.contains(&piece.piece_num) {
                unhealthy_pieces.push(piece.clone());
            } else {
                healthy_pieces.push(piece.clone());
            }
        }

        let (get_limits, get_key) = self
            .orders
            .create_get_repair_order_limits(&pointer, &healthy_pieces)
            .await?;

        let total_needed =
            (f64::from(redundancy.optimal) * self.multiplier_optimal).ceil() as usize;
        let request_count = total_needed.saturating_sub(healthy_pieces.len());
        let new_nodes = self
            .overlay
            .find_storage_nodes(FindNodesRequest {
                requested_count: request_count,
                free_disk: piece_size,
                excluded: exclude_node_ids,
            })
            .await?;

        let (put_limits, put_key) = self
            .orders
            .create_put_repair_order_limits(&pointer, &get_limits, &new_nodes)
            .await?;

        let data = self
            .ec
            .get(&get_limits, &get_key, &redundancy, pointer.segment_size)
            .await?;

        let uploaded = self
            .ec
            .put_repair(&put_limits, &put_key, &redundancy, &data, self.timeout)
            .await?;

        let mut repaired_pieces = Vec::new();
        let mut repaired_nums = std::collections::HashSet::new();
        for (piece_num, success) in uploaded.pieces.iter().enumerate() {
            let Some(success) = success else { continue };
            repaired_pieces.push(RemotePiece {
                piece_num: piece_num as u16,
                node_id: success.node_id,
                hash: Some(success.hash.clone()),
            });
            repaired_nums.insert(piece_num as u16);
        }

        let healthy_after = healthy_pieces.len() + repaired_pieces.len();
        let outcome = if healthy_after <= usize::from(redundancy.repair) {
            RepairOutcome::Failed
        } else if healthy_after < usize::from(redundancy.optimal) {
            RepairOutcome::Partial
        } else {
            RepairOutcome::Full
        };

        let to_remove: Vec<RemotePiece> = if outcome == RepairOutcome::Full {
            unhealthy_pieces
        } else {
            // keep unrepaired unhealthy pieces; they may still serve reads
            unhealthy_pieces
                .into_iter()
                .filter(|piece| repaired_nums.contains(&piece.piece_num))
                .collect()
        };

        let update = self
            .metainfo
            .update_pieces(path, pointer.created_at, repaired_pieces, to_remove)
            .await?;
        if update == UpdateOutcome::Superseded {
            debug!(path = %path, "segment overwritten during repair, dropping result");
            self.stats.lock().superseded += 1;
            return Ok(RepairOutcome::Superseded);
        }

        let mut stats = self.stats.lock();
        match outcome {
            RepairOutcome::Full => stats.full += 1,
            RepairOutcome::Partial => stats.partial += 1,
            RepairOutcome::Failed => stats.failed += 1,
            _ => {}
        }
        drop(stats);

        info!(
            path = %path,
            healthy_before = num_healthy,
            healthy_after,
            outcome = ?outcome,
            "repair finished"
        );
        Ok(outcome)
    }
}

/// Drains the repair queue with a bounded worker pool.
pub struct RepairService {
    queue: Arc<dyn RepairQueue>,
    irreparable: Arc<dyn IrreparableStore>,
    repairer: Arc<SegmentRepairer>,
    metainfo: Arc<dyn PointerStore>,
    config: RepairerConfig,
}

impl RepairService {
    pub fn new(
        queue: Arc<dyn RepairQueue>,
        irreparable: Arc<dyn IrreparableStore>,
        repairer: Arc<SegmentRepairer>,
        metainfo: Arc<dyn PointerStore>,
        config: RepairerConfig,
    ) -> Self {
        RepairService {
            queue,
            irreparable,
            repairer,
            metainfo,
            config,
        }
    }

    /// Consume the queue until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(workers = self.config.max_workers, "repair service started");
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));

        loop {
            if cancel.is_cancelled() {
                info!("repair service shutting down");
                return;
            }

            let item = match self.queue.select().await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => continue,
                        _ = tokio::time::sleep(self.config.poll_interval) => continue,
                    }
                }
                Err(error) => {
                    warn!(%error, "repair queue select failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                return;
            };
            let queue = Arc::clone(&self.queue);
            let irreparable = Arc::clone(&self.irreparable);
            let repairer = Arc::clone(&self.repairer);
            let metainfo = Arc::clone(&self.metainfo);
            tokio::spawn(async move {
                let _permit = permit;
                process_item(queue, irreparable, repairer, metainfo, item).await;
            });
        }
    }
}

async fn process_item(
    queue: Arc<dyn RepairQueue>,
    irreparable: Arc<dyn IrreparableStore>,
    repairer: Arc<SegmentRepairer>,
    metainfo: Arc<dyn PointerStore>,
    item: crate::queue::InjuredSegment,
) {
    match repairer.repair(&item.path).await {
        Ok(outcome) => {
            debug!(path = %item.path, outcome = ?outcome, "repair item finished");
            if let Err(error) = queue.remove(&item.path).await {
                warn!(path = %item.path, %error, "failed to remove repaired item");
            }
        }
        Err(RepairError::IrreparableSegment { path, healthy, needed }) => {
            warn!(path = %path, healthy, needed, "segment is irreparable");
            // park the segment; the irreparable scan takes it from here
            if let Ok(pointer) = metainfo.get(&path).await {
                let record = IrreparableSegment {
                    path: path.clone(),
                    lost_pieces: item.lost_piece_nums.len(),
                    pointer,
                    last_attempt_at: Utc::now(),
                    attempts: 1,
                };
                if let Err(error) = irreparable.upsert(record).await {
                    warn!(path = %path, %error, "failed to record irreparable segment");
                }
            }
            if let Err(error) = queue.remove(&path).await {
                warn!(path = %path, %error, "failed to remove irreparable item");
            }
        }
        Err(error) => {
            warn!(path = %item.path, %error, "repair failed, releasing for redelivery");
            if let Err(release_error) = queue.release(&item.path).await {
                warn!(path = %item.path, %release_error, "failed to release repair item");
            }
        }
    }
}
