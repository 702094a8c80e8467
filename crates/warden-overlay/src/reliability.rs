//! Reliability cache.
//!
//! The checker and repairer ask "which of these pieces sit on unreliable
//! nodes?" for every remote segment in the namespace, far too often to hit
//! the overlay each time. The cache holds a snapshot of the reliable node
//! set and rebuilds it when it goes stale or when a pointer newer than the
//! snapshot shows up (a fresh upload can reference nodes the snapshot has
//! never seen). Callers tolerate one cycle of staleness; repair thresholds
//! are conservative enough to absorb it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use warden_core::NodeId;
use warden_core::RemotePiece;

use crate::service::OverlayService;
use crate::store::OverlayError;

struct Snapshot {
    taken_at: DateTime<Utc>,
    reliable: HashSet<NodeId>,
}

/// Time-bounded snapshot of the reliable node set.
pub struct ReliabilityCache {
    overlay: Arc<OverlayService>,
    staleness: Duration,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    /// Serializes rebuilds; readers never block on a refresh in progress.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl ReliabilityCache {
    pub fn new(overlay: Arc<OverlayService>, staleness: Duration) -> Self {
        ReliabilityCache {
            overlay,
            staleness,
            snapshot: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Piece numbers of `pieces` whose node is not currently reliable.
    ///
    /// `created_at` is the owning pointer's creation date; a snapshot older
    /// than the pointer is refreshed first.
    pub async fn missing_pieces(
        &self,
        created_at: DateTime<Utc>,
        pieces: &[RemotePiece],
    ) -> Result<Vec<u16>, OverlayError> {
        let snapshot = self.valid_snapshot(created_at).await?;
        Ok(pieces
            .iter()
            .filter(|piece| !snapshot.reliable.contains(&piece.node_id))
            .map(|piece| piece.piece_num)
            .collect())
    }

    /// Force a rebuild from the overlay.
    pub async fn refresh(&self) -> Result<(), OverlayError> {
        let _guard = self.refresh_lock.lock().await;
        self.rebuild().await
    }

    async fn valid_snapshot(
        &self,
        created_at: DateTime<Utc>,
    ) -> Result<Arc<Snapshot>, OverlayError> {
        if let Some(snapshot) = self.current_if_valid(created_at) {
            return Ok(snapshot);
        }

        let _guard = self.refresh_lock.lock().await;
        // another caller may have refreshed while we waited
        if let Some(snapshot) = self.current_if_valid(created_at) {
            return Ok(snapshot);
        }
        self.rebuild().await?;

        // one rebuild is as fresh as we can get; a pointer stamped ahead of
        // our clock must not force a refresh loop
        self.snapshot
            .read()
            .clone()
            .ok_or_else(|| OverlayError::Store {
                message: "reliability snapshot missing after refresh".to_string(),
            })
    }

    fn current_if_valid(&self, created_at: DateTime<Utc>) -> Option<Arc<Snapshot>> {
        let guard = self.snapshot.read();
        let snapshot = guard.as_ref()?;
        let now = Utc::now();
        let age = now.signed_duration_since(snapshot.taken_at).to_std().ok()?;
        if age >= self.staleness || snapshot.taken_at < created_at {
            return None;
        }
        Some(Arc::clone(snapshot))
    }

    async fn rebuild(&self) -> Result<(), OverlayError> {
        let reliable: HashSet<NodeId> = self.overlay.reliable().await?.into_iter().collect();
        debug!(reliable = reliable.len(), "rebuilt reliability snapshot");
        *self.snapshot.write() = Some(Arc::new(Snapshot {
            taken_at: Utc::now(),
            reliable,
        }));
        Ok(())
    }
}
