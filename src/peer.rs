//! Durability core assembly.
//!
//! Wires the overlay, metainfo loop, checker, repairer, and auditor over
//! caller-provided backends and runs them as sibling tasks under one
//! cancellation token. This mirrors how a satellite process hosts the
//! subsystem; nothing here adds behavior of its own.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use warden_audit::AuditService;
use warden_audit::Containment;
use warden_audit::Reporter;
use warden_audit::Verifier;
use warden_ec::EcClient;
use warden_ec::PieceStore;
use warden_metainfo::MetainfoLoop;
use warden_metainfo::PointerStore;
use warden_orders::OrderService;
use warden_orders::SatelliteSigner;
use warden_overlay::OverlayService;
use warden_overlay::OverlayStore;
use warden_overlay::ReliabilityCache;
use warden_repair::Checker;
use warden_repair::CheckerStats;
use warden_repair::IrreparableStore;
use warden_repair::RepairQueue;
use warden_repair::RepairService;
use warden_repair::RepairerStats;
use warden_repair::SegmentRepairer;

use crate::config::Config;

/// Storage backends the core runs over.
pub struct Backends {
    pub overlay: Arc<dyn OverlayStore>,
    pub metainfo: Arc<dyn PointerStore>,
    pub repair_queue: Arc<dyn RepairQueue>,
    pub irreparable: Arc<dyn IrreparableStore>,
    pub containment: Arc<dyn Containment>,
    pub pieces: Arc<dyn PieceStore>,
}

/// Aggregated counters of the running core.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreStats {
    pub checker: CheckerStats,
    pub repairer: RepairerStats,
}

/// The assembled durability subsystem.
pub struct DurabilityCore {
    overlay: Arc<OverlayService>,
    reliability: Arc<ReliabilityCache>,
    metainfo: Arc<dyn PointerStore>,
    checker: Arc<Checker>,
    repairer: Arc<SegmentRepairer>,
    repair_service: Arc<RepairService>,
    audit_service: Arc<AuditService>,
    loop_cancel: CancellationToken,
    loop_task: tokio::task::JoinHandle<()>,
}

impl DurabilityCore {
    /// Assemble the core. The metainfo loop task starts immediately;
    /// everything else runs from [`DurabilityCore::run`].
    pub fn new(signer: SatelliteSigner, backends: Backends, config: Config) -> Self {
        let overlay = Arc::new(OverlayService::new(
            Arc::clone(&backends.overlay),
            config.overlay.clone(),
        ));
        let reliability = Arc::new(ReliabilityCache::new(
            Arc::clone(&overlay),
            config.reliability_staleness,
        ));
        let orders = Arc::new(OrderService::new(
            signer,
            Arc::clone(&overlay),
            config.orders.clone(),
        ));

        let loop_cancel = CancellationToken::new();
        let (metainfo_loop, loop_task) = MetainfoLoop::spawn(
            Arc::clone(&backends.metainfo),
            config.metainfo_loop.clone(),
            loop_cancel.clone(),
        );

        let checker = Arc::new(Checker::new(
            metainfo_loop,
            Arc::clone(&backends.repair_queue),
            Arc::clone(&backends.irreparable),
            Arc::clone(&reliability),
            config.checker.clone(),
        ));

        let repairer = Arc::new(SegmentRepairer::new(
            Arc::clone(&backends.metainfo),
            Arc::clone(&orders),
            Arc::clone(&overlay),
            Arc::clone(&reliability),
            EcClient::new(Arc::clone(&backends.pieces)),
            &config.repairer,
        ));
        let repair_service = Arc::new(RepairService::new(
            Arc::clone(&backends.repair_queue),
            Arc::clone(&backends.irreparable),
            Arc::clone(&repairer),
            Arc::clone(&backends.metainfo),
            config.repairer.clone(),
        ));

        let verifier = Verifier::new(
            Arc::clone(&backends.metainfo),
            Arc::clone(&orders),
            Arc::clone(&backends.containment),
            Arc::clone(&backends.pieces),
            config.audit.clone(),
        );
        let reporter = Reporter::new(
            Arc::clone(&overlay),
            Arc::clone(&backends.containment),
            3,
        );
        let audit_service = Arc::new(AuditService::new(
            Arc::clone(&backends.metainfo),
            verifier,
            reporter,
            Arc::clone(&backends.containment),
            config.audit_service.clone(),
        ));

        DurabilityCore {
            overlay,
            reliability,
            metainfo: backends.metainfo,
            checker,
            repairer,
            repair_service,
            audit_service,
            loop_cancel,
            loop_task,
        }
    }

    pub fn overlay(&self) -> &Arc<OverlayService> {
        &self.overlay
    }

    pub fn reliability(&self) -> &Arc<ReliabilityCache> {
        &self.reliability
    }

    pub fn metainfo(&self) -> &Arc<dyn PointerStore> {
        &self.metainfo
    }

    pub fn stats(&self) -> CoreStats {
        CoreStats {
            checker: self.checker.stats(),
            repairer: self.repairer.stats(),
        }
    }

    /// Run every service until `cancel` fires, then tear down the
    /// metainfo loop.
    pub async fn run(self, cancel: CancellationToken) {
        info!("durability core starting");

        let checker = Arc::clone(&self.checker);
        let checker_cancel = cancel.clone();
        let checker_task = tokio::spawn(async move { checker.run(checker_cancel).await });

        let repair = Arc::clone(&self.repair_service);
        let repair_cancel = cancel.clone();
        let repair_task = tokio::spawn(async move { repair.run(repair_cancel).await });

        let audit = Arc::clone(&self.audit_service);
        let audit_cancel = cancel.clone();
        let audit_task = tokio::spawn(async move { audit.run(audit_cancel).await });

        cancel.cancelled().await;

        // the loop is owned here, the rest stop on the shared token
        self.loop_cancel.cancel();
        let _ = tokio::join!(checker_task, repair_task, audit_task, self.loop_task);
        info!("durability core stopped");
    }
}
