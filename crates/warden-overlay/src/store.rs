//! Overlay storage.
//!
//! [`OverlayStore`] is the persistence seam for node dossiers. The store is
//! responsible for per-node atomicity of reputation updates; the update
//! math itself lives in [`crate::reputation`] so every backend applies the
//! same formula. [`MemoryOverlayStore`] is the reference implementation and
//! is what the test harness runs against.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use parking_lot::RwLock;
use snafu::Snafu;

use warden_core::NodeId;

use crate::dossier::NodeDossier;
use crate::reputation::apply_observation;
use crate::reputation::ObservationKind;
use crate::reputation::ReputationConfig;
use crate::reputation::VettingThresholds;

/// Errors from overlay operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum OverlayError {
    /// No dossier exists for the node.
    #[snafu(display("node {node_id} not found"))]
    NodeNotFound { node_id: NodeId },

    /// The all-zero node ID is not a valid lookup key.
    #[snafu(display("node ID must not be zero"))]
    ZeroNodeId,

    /// Selection could not satisfy the requested count.
    #[snafu(display("not enough nodes: requested {requested}, found {found}"))]
    NotEnoughNodes { requested: usize, found: usize },

    /// The node is disqualified and must not be handed new work.
    #[snafu(display("node {node_id} is disqualified"))]
    NodeDisqualified { node_id: NodeId },

    /// The node is outside its online window.
    #[snafu(display("node {node_id} is offline"))]
    NodeOffline { node_id: NodeId },

    /// Backend failure.
    #[snafu(display("overlay store error: {message}"))]
    Store { message: String },
}

/// One reputation/uptime observation for one node.
#[derive(Debug, Clone, Copy)]
pub struct StatsUpdate {
    pub node_id: NodeId,
    pub audit_success: Option<bool>,
    pub uptime_success: Option<bool>,
}

/// Reputation tuning shared by every stats update.
#[derive(Debug, Clone, Copy)]
pub struct ReputationTuning {
    pub audit: ReputationConfig,
    pub uptime: ReputationConfig,
    pub vetting: VettingThresholds,
}

/// Filter for node selection.
#[derive(Debug, Clone)]
pub struct SelectionCriteria {
    /// How many nodes to return.
    pub count: usize,
    /// Node IDs that must not be selected.
    pub excluded: HashSet<NodeId>,
    /// Minimum advertised free disk, in bytes.
    pub min_free_disk: u64,
    /// Select vetted nodes when true, unvetted when false.
    pub vetted: bool,
    pub online_window: Duration,
    pub now: DateTime<Utc>,
}

/// Persistence seam for node dossiers.
#[async_trait]
pub trait OverlayStore: Send + Sync {
    async fn get(&self, node_id: NodeId) -> Result<NodeDossier, OverlayError>;

    /// Insert or replace identity/capacity fields; reputation and
    /// lifecycle state of an existing dossier are preserved.
    async fn upsert(&self, dossier: NodeDossier) -> Result<(), OverlayError>;

    /// Apply one observation set atomically under the node's lock and
    /// return the post-update dossier.
    async fn update_stats(
        &self,
        update: StatsUpdate,
        tuning: &ReputationTuning,
        now: DateTime<Utc>,
    ) -> Result<NodeDossier, OverlayError>;

    /// Page through dossiers in node-ID order. Returns the page and
    /// whether more pages follow.
    async fn paginate(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<NodeDossier>, bool), OverlayError>;

    /// Nodes matching the selection criteria, in unspecified order.
    async fn select_nodes(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<NodeDossier>, OverlayError>;

    /// IDs of all nodes currently online and not disqualified.
    async fn reliable(
        &self,
        online_window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<NodeId>, OverlayError>;
}

/// In-memory overlay store, keyed by node ID.
#[derive(Default)]
pub struct MemoryOverlayStore {
    nodes: RwLock<BTreeMap<NodeId, NodeDossier>>,
}

impl MemoryOverlayStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Overwrite a node's contact timestamp directly.
    ///
    /// Fixtures use this to move nodes in and out of the online window
    /// without fabricating uptime observations.
    pub fn set_last_contact_success(&self, node_id: NodeId, at: Option<DateTime<Utc>>) {
        if let Some(dossier) = self.nodes.write().get_mut(&node_id) {
            dossier.last_contact_success = at;
        }
    }
}

#[async_trait]
impl OverlayStore for MemoryOverlayStore {
    async fn get(&self, node_id: NodeId) -> Result<NodeDossier, OverlayError> {
        if node_id.is_zero() {
            return Err(OverlayError::ZeroNodeId);
        }
        self.nodes
            .read()
            .get(&node_id)
            .cloned()
            .ok_or(OverlayError::NodeNotFound { node_id })
    }

    async fn upsert(&self, dossier: NodeDossier) -> Result<(), OverlayError> {
        if dossier.id.is_zero() {
            return Err(OverlayError::ZeroNodeId);
        }
        let mut nodes = self.nodes.write();
        match nodes.get_mut(&dossier.id) {
            Some(existing) => {
                existing.address = dossier.address;
                existing.capacity = dossier.capacity;
            }
            None => {
                nodes.insert(dossier.id, dossier);
            }
        }
        Ok(())
    }

    async fn update_stats(
        &self,
        update: StatsUpdate,
        tuning: &ReputationTuning,
        now: DateTime<Utc>,
    ) -> Result<NodeDossier, OverlayError> {
        let mut nodes = self.nodes.write();
        let dossier = nodes
            .get_mut(&update.node_id)
            .ok_or(OverlayError::NodeNotFound {
                node_id: update.node_id,
            })?;

        if let Some(success) = update.audit_success {
            apply_observation(
                dossier,
                ObservationKind::Audit,
                success,
                &tuning.audit,
                tuning.vetting,
                now,
            );
        }
        if let Some(success) = update.uptime_success {
            apply_observation(
                dossier,
                ObservationKind::Uptime,
                success,
                &tuning.uptime,
                tuning.vetting,
                now,
            );
        }

        Ok(dossier.clone())
    }

    async fn paginate(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<NodeDossier>, bool), OverlayError> {
        let nodes = self.nodes.read();
        let page: Vec<NodeDossier> = nodes.values().skip(offset).take(limit).cloned().collect();
        let more = nodes.len() > offset + page.len();
        Ok((page, more))
    }

    async fn select_nodes(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<NodeDossier>, OverlayError> {
        let nodes = self.nodes.read();
        let matching = nodes
            .values()
            .filter(|node| {
                node.is_reliable(criteria.now, criteria.online_window)
                    && node.is_vetted() == criteria.vetted
                    && node.capacity.free_disk >= criteria.min_free_disk
                    && !criteria.excluded.contains(&node.id)
            })
            .take(criteria.count)
            .cloned()
            .collect();
        Ok(matching)
    }

    async fn reliable(
        &self,
        online_window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<NodeId>, OverlayError> {
        let nodes = self.nodes.read();
        Ok(nodes
            .values()
            .filter(|node| node.is_reliable(now, online_window))
            .map(|node| node.id)
            .collect())
    }
}
