//! Audit service.
//!
//! On every cycle: reservoir-sample one remote segment from the pointer
//! namespace, pick a random stripe, settle any contained nodes holding
//! pieces of it, then verify the stripe with those nodes skipped. Both
//! reports go to the [`Reporter`]. The cycle rate-limits auditing by
//! itself; there is no extra backpressure mechanism.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use warden_core::NodeId;
use warden_core::SegmentPath;
use warden_metainfo::PointerStore;

use crate::containment::Containment;
use crate::error::AuditError;
use crate::reporter::Reporter;
use crate::verifier::select_stripe;
use crate::verifier::Stripe;
use crate::verifier::Verifier;

/// Audit cycle tuning.
#[derive(Debug, Clone)]
pub struct AuditServiceConfig {
    /// Delay between audits.
    pub interval: Duration,
    /// Pointers fetched per page while sampling.
    pub page_size: usize,
}

impl Default for AuditServiceConfig {
    fn default() -> Self {
        AuditServiceConfig {
            interval: Duration::from_secs(30),
            page_size: 100,
        }
    }
}

/// Periodically audits random stripes.
pub struct AuditService {
    metainfo: Arc<dyn PointerStore>,
    verifier: Verifier,
    reporter: Reporter,
    containment: Arc<dyn Containment>,
    config: AuditServiceConfig,
}

impl AuditService {
    pub fn new(
        metainfo: Arc<dyn PointerStore>,
        verifier: Verifier,
        reporter: Reporter,
        containment: Arc<dyn Containment>,
        config: AuditServiceConfig,
    ) -> Self {
        AuditService {
            metainfo,
            verifier,
            reporter,
            containment,
            config,
        }
    }

    /// Run audit cycles until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "audit service started"
        );
        let mut timer = tokio::time::interval(self.config.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut rng = rand::rngs::StdRng::from_entropy();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("audit service shutting down");
                    return;
                }
                _ = timer.tick() => {
                    if let Err(error) = self.audit_one(&mut rng).await {
                        match error {
                            AuditError::SegmentDeleted { .. }
                            | AuditError::NotEnoughShares { .. } => {
                                debug!(%error, "audit attempt inconclusive");
                            }
                            _ => warn!(%error, "audit attempt failed"),
                        }
                    }
                }
            }
        }
    }

    /// Sample and audit one stripe.
    pub async fn audit_one<R: Rng>(&self, rng: &mut R) -> Result<(), AuditError> {
        let Some(stripe) = self.sample_stripe(rng).await? else {
            debug!("no remote segments to audit");
            return Ok(());
        };
        self.audit_stripe(&stripe).await
    }

    /// Reverify contained holders of the stripe, then verify the rest.
    pub async fn audit_stripe(&self, stripe: &Stripe) -> Result<(), AuditError> {
        let skip = self.contained_nodes(stripe).await?;

        if !skip.is_empty() {
            let reverify_report = self.verifier.reverify(stripe).await?;
            debug!(
                path = %stripe.path,
                successes = reverify_report.successes.len(),
                fails = reverify_report.fails.len(),
                "reverification finished"
            );
            self.reporter.record(&reverify_report).await?;
        }

        let report = self.verifier.verify(stripe, &skip).await?;
        info!(
            path = %stripe.path,
            stripe = stripe.index,
            successes = report.successes.len(),
            fails = report.fails.len(),
            offlines = report.offlines.len(),
            contained = report.pending_audits.len(),
            "audit finished"
        );
        self.reporter.record(&report).await
    }

    async fn contained_nodes(&self, stripe: &Stripe) -> Result<HashSet<NodeId>, AuditError> {
        let mut contained = HashSet::new();
        let Some(remote) = stripe.pointer.remote() else {
            return Ok(contained);
        };
        for piece in &remote.pieces {
            if self.containment.get(piece.node_id).await?.is_some() {
                contained.insert(piece.node_id);
            }
        }
        Ok(contained)
    }

    /// Uniform reservoir sample of one remote segment.
    async fn sample_stripe<R: Rng>(&self, rng: &mut R) -> Result<Option<Stripe>, AuditError> {
        let mut chosen: Option<(SegmentPath, warden_core::Pointer)> = None;
        let mut seen = 0usize;
        let mut last: Option<SegmentPath> = None;

        loop {
            let page = self
                .metainfo
                .list_after(last.as_ref(), self.config.page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            last = page.last().map(|(path, _)| path.clone());

            for (path, pointer) in page {
                if !pointer.is_remote() {
                    continue;
                }
                seen += 1;
                if rng.gen_range(0..seen) == 0 {
                    chosen = Some((path, pointer));
                }
            }
        }

        Ok(chosen.and_then(|(path, pointer)| select_stripe(&path, &pointer, rng)))
    }
}
