//! Overlay service.
//!
//! Wraps an [`OverlayStore`] with the satellite's policy: reputation
//! tuning, the online window, vetting thresholds, and the vetted/new-node
//! split applied when selecting upload targets.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use tracing::debug;
use tracing::warn;

use warden_core::NodeId;

use crate::dossier::NodeDossier;
use crate::reputation::ReputationConfig;
use crate::reputation::VettingThresholds;
use crate::store::OverlayError;
use crate::store::OverlayStore;
use crate::store::ReputationTuning;
use crate::store::SelectionCriteria;
use crate::store::StatsUpdate;

/// Overlay policy knobs.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// How recently a node must have been heard from to count as online.
    pub online_window: Duration,
    pub audit_reputation: ReputationConfig,
    pub uptime_reputation: ReputationConfig,
    pub vetting: VettingThresholds,
    /// Fraction of each selection filled from unvetted nodes.
    pub new_node_fraction: f64,
    /// Batch size for reputation updates.
    pub update_batch_size: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            online_window: Duration::from_secs(3600),
            audit_reputation: ReputationConfig::default(),
            uptime_reputation: ReputationConfig::default(),
            vetting: VettingThresholds::default(),
            new_node_fraction: 0.05,
            update_batch_size: 100,
        }
    }
}

/// Request for upload targets.
#[derive(Debug, Clone)]
pub struct FindNodesRequest {
    pub requested_count: usize,
    /// Minimum free disk each selected node must advertise, in bytes.
    pub free_disk: u64,
    pub excluded: Vec<NodeId>,
}

/// Policy layer over the overlay store.
pub struct OverlayService {
    store: Arc<dyn OverlayStore>,
    config: OverlayConfig,
}

impl OverlayService {
    pub fn new(store: Arc<dyn OverlayStore>, config: OverlayConfig) -> Self {
        OverlayService { store, config }
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub async fn get(&self, node_id: NodeId) -> Result<NodeDossier, OverlayError> {
        self.store.get(node_id).await
    }

    /// Fetch a dossier and require the node to be usable for new work.
    pub async fn get_online(&self, node_id: NodeId) -> Result<NodeDossier, OverlayError> {
        let dossier = self.store.get(node_id).await?;
        if dossier.is_disqualified() {
            return Err(OverlayError::NodeDisqualified { node_id });
        }
        if !dossier.is_online(Utc::now(), self.config.online_window) {
            return Err(OverlayError::NodeOffline { node_id });
        }
        Ok(dossier)
    }

    pub async fn upsert(&self, dossier: NodeDossier) -> Result<(), OverlayError> {
        self.store.upsert(dossier).await
    }

    fn tuning(&self) -> ReputationTuning {
        ReputationTuning {
            audit: self.config.audit_reputation,
            uptime: self.config.uptime_reputation,
            vetting: self.config.vetting,
        }
    }

    /// Apply one observation set and return the post-update dossier.
    pub async fn update_stats(&self, update: StatsUpdate) -> Result<NodeDossier, OverlayError> {
        self.store
            .update_stats(update, &self.tuning(), Utc::now())
            .await
    }

    /// Record a single uptime observation.
    pub async fn update_uptime(
        &self,
        node_id: NodeId,
        online: bool,
    ) -> Result<NodeDossier, OverlayError> {
        self.update_stats(StatsUpdate {
            node_id,
            audit_success: None,
            uptime_success: Some(online),
        })
        .await
    }

    /// Apply a batch of observations in configured-size chunks.
    ///
    /// Returns the IDs whose updates failed; successes are not rolled back
    /// (repair and audit tolerate at-least-once application).
    pub async fn batch_update_stats(&self, updates: Vec<StatsUpdate>) -> Vec<NodeId> {
        let tuning = self.tuning();
        let now = Utc::now();
        let mut failed = Vec::new();

        for chunk in updates.chunks(self.config.update_batch_size.max(1)) {
            for update in chunk {
                if let Err(error) = self.store.update_stats(*update, &tuning, now).await {
                    warn!(node_id = %update.node_id, %error, "reputation update failed");
                    failed.push(update.node_id);
                }
            }
        }

        failed
    }

    /// Select upload targets, mixing unvetted nodes in at the configured
    /// fraction so new nodes can earn audit history.
    pub async fn find_storage_nodes(
        &self,
        request: FindNodesRequest,
    ) -> Result<Vec<NodeDossier>, OverlayError> {
        let excluded: HashSet<NodeId> = request.excluded.iter().copied().collect();
        let now = Utc::now();

        let new_count =
            (request.requested_count as f64 * self.config.new_node_fraction).ceil() as usize;
        let new_count = new_count.min(request.requested_count);

        let mut selected = self
            .store
            .select_nodes(&SelectionCriteria {
                count: new_count,
                excluded: excluded.clone(),
                min_free_disk: request.free_disk,
                vetted: false,
                online_window: self.config.online_window,
                now,
            })
            .await?;

        let mut excluded_with_new = excluded;
        excluded_with_new.extend(selected.iter().map(|node| node.id));

        let vetted = self
            .store
            .select_nodes(&SelectionCriteria {
                count: request.requested_count - selected.len(),
                excluded: excluded_with_new,
                min_free_disk: request.free_disk,
                vetted: true,
                online_window: self.config.online_window,
                now,
            })
            .await?;
        selected.extend(vetted);

        if selected.len() < request.requested_count {
            return Err(OverlayError::NotEnoughNodes {
                requested: request.requested_count,
                found: selected.len(),
            });
        }

        selected.shuffle(&mut rand::thread_rng());
        debug!(
            requested = request.requested_count,
            selected = selected.len(),
            "selected storage nodes"
        );
        Ok(selected)
    }

    /// IDs of every node currently online and not disqualified.
    pub async fn reliable(&self) -> Result<Vec<NodeId>, OverlayError> {
        self.store
            .reliable(self.config.online_window, Utc::now())
            .await
    }

    pub async fn paginate(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<NodeDossier>, bool), OverlayError> {
        self.store.paginate(offset, limit).await
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemoryOverlayStore;

    use super::*;

    async fn service_with_nodes(count: u8, vetted: bool) -> OverlayService {
        let store = Arc::new(MemoryOverlayStore::new());
        let config = OverlayConfig::default();
        let now = Utc::now();

        for seed in 1..=count {
            let mut node = NodeDossier::new(
                NodeId([seed; 32]),
                format!("node-{seed}:7777"),
                &config.audit_reputation,
                &config.uptime_reputation,
            );
            node.last_contact_success = Some(now);
            node.capacity.free_disk = 1 << 30;
            if vetted {
                node.vetted_at = Some(now);
            }
            store.upsert(node).await.unwrap();
        }

        OverlayService::new(store, config)
    }

    #[tokio::test]
    async fn find_nodes_excludes_requested() {
        let service = service_with_nodes(5, true).await;
        let excluded = vec![NodeId([1u8; 32]), NodeId([2u8; 32])];

        let found = service
            .find_storage_nodes(FindNodesRequest {
                requested_count: 3,
                free_disk: 0,
                excluded: excluded.clone(),
            })
            .await
            .unwrap();

        assert_eq!(found.len(), 3);
        for node in &found {
            assert!(!excluded.contains(&node.id));
        }
    }

    #[tokio::test]
    async fn find_nodes_fails_when_short() {
        let service = service_with_nodes(2, true).await;
        let result = service
            .find_storage_nodes(FindNodesRequest {
                requested_count: 5,
                free_disk: 0,
                excluded: Vec::new(),
            })
            .await;
        assert!(matches!(
            result,
            Err(OverlayError::NotEnoughNodes {
                requested: 5,
                found: 2
            })
        ));
    }

    #[tokio::test]
    async fn get_online_classifies_missing_and_disqualified() {
        let service = service_with_nodes(1, true).await;
        let node_id = NodeId([1u8; 32]);

        assert!(service.get_online(node_id).await.is_ok());

        // under default tuning a fresh node has no history to absorb a
        // failed audit; its score drops straight through the threshold
        let dq = service
            .update_stats(StatsUpdate {
                node_id,
                audit_success: Some(false),
                uptime_success: None,
            })
            .await
            .unwrap();
        assert!(dq.is_disqualified());
        assert!(matches!(
            service.get_online(node_id).await,
            Err(OverlayError::NodeDisqualified { .. })
        ));

        let missing = service.get_online(NodeId([9u8; 32])).await;
        assert!(matches!(missing, Err(OverlayError::NodeNotFound { .. })));
    }

    #[tokio::test]
    async fn batch_update_reports_failures() {
        let service = service_with_nodes(1, true).await;
        let updates = vec![
            StatsUpdate {
                node_id: NodeId([1u8; 32]),
                audit_success: Some(true),
                uptime_success: None,
            },
            StatsUpdate {
                node_id: NodeId([42u8; 32]),
                audit_success: Some(true),
                uptime_success: None,
            },
        ];

        let failed = service.batch_update_stats(updates).await;
        assert_eq!(failed, vec![NodeId([42u8; 32])]);
    }
}
