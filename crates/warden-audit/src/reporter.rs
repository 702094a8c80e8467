//! Audit reporter.
//!
//! Translates a [`Report`] into reputation observations and containment
//! changes: audit successes and failures update the audit Beta score,
//! offline nodes take an uptime failure, and contained nodes get (or keep)
//! a pending audit. Settled nodes leave containment. Application is
//! retried a bounded number of times; whatever still fails is surfaced so
//! the caller knows observations were dropped.

use std::sync::Arc;

use tracing::debug;
use tracing::warn;

use warden_core::NodeId;
use warden_overlay::OverlayService;
use warden_overlay::StatsUpdate;

use crate::containment::Containment;
use crate::containment::PendingAudit;
use crate::error::AuditError;
use crate::verifier::Report;

/// Applies audit reports to reputation and containment.
pub struct Reporter {
    overlay: Arc<OverlayService>,
    containment: Arc<dyn Containment>,
    max_retries: usize,
}

impl Reporter {
    pub fn new(
        overlay: Arc<OverlayService>,
        containment: Arc<dyn Containment>,
        max_retries: usize,
    ) -> Self {
        Reporter {
            overlay,
            containment,
            max_retries: max_retries.max(1),
        }
    }

    /// Apply a report. Partially applied batches are retried; leftovers
    /// surface as [`AuditError::ReportIncomplete`].
    pub async fn record(&self, report: &Report) -> Result<(), AuditError> {
        let mut successes = report.successes.clone();
        let mut fails = report.fails.clone();
        let mut offlines = report.offlines.clone();
        let mut pending = report.pending_audits.clone();

        for attempt in 0..self.max_retries {
            if successes.is_empty() && fails.is_empty() && offlines.is_empty() && pending.is_empty()
            {
                return Ok(());
            }
            if attempt > 0 {
                debug!(attempt, "retrying audit report application");
            }

            successes = self.record_audits(&successes, true).await;
            fails = self.record_audits(&fails, false).await;
            offlines = self.record_offlines(&offlines).await;
            pending = self.record_pending(&pending).await;
        }

        let remaining = successes.len() + fails.len() + offlines.len() + pending.len();
        if remaining > 0 {
            return Err(AuditError::ReportIncomplete { remaining });
        }
        Ok(())
    }

    /// Record audit outcomes and clear containment for settled nodes.
    /// Returns the nodes that still need recording.
    async fn record_audits(&self, nodes: &[NodeId], success: bool) -> Vec<NodeId> {
        if nodes.is_empty() {
            return Vec::new();
        }
        let updates: Vec<StatsUpdate> = nodes
            .iter()
            .map(|&node_id| StatsUpdate {
                node_id,
                audit_success: Some(success),
                uptime_success: Some(true),
            })
            .collect();
        let failed = self.overlay.batch_update_stats(updates).await;

        for node_id in nodes {
            if failed.contains(node_id) {
                continue;
            }
            // a definitive outcome settles any pending audit
            if let Err(error) = self.containment.delete(*node_id).await {
                warn!(node_id = %node_id, %error, "failed to clear containment");
            }
        }
        failed
    }

    async fn record_offlines(&self, nodes: &[NodeId]) -> Vec<NodeId> {
        if nodes.is_empty() {
            return Vec::new();
        }
        let updates: Vec<StatsUpdate> = nodes
            .iter()
            .map(|&node_id| StatsUpdate {
                node_id,
                audit_success: None,
                uptime_success: Some(false),
            })
            .collect();
        self.overlay.batch_update_stats(updates).await
    }

    async fn record_pending(&self, pending: &[PendingAudit]) -> Vec<PendingAudit> {
        let mut leftover = Vec::new();
        for audit in pending {
            if let Err(error) = self.containment.put(audit.clone()).await {
                warn!(node_id = %audit.node_id, %error, "failed to contain node");
                leftover.push(audit.clone());
            }
        }
        leftover
    }
}
