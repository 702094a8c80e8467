//! Satellite test fixture.
//!
//! Wires every durability-core component against in-memory stores and the
//! [`SimSwarm`], the way a satellite process would wire them against real
//! backends. Tests drive the public service APIs; the fixture only adds
//! seeding and fault-injection helpers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use warden_audit::AuditConfig;
use warden_audit::MemoryContainment;
use warden_audit::Reporter;
use warden_audit::Verifier;
use warden_core::NodeId;
use warden_core::PieceId;
use warden_core::Pointer;
use warden_core::RedundancyScheme;
use warden_core::RemotePiece;
use warden_core::RemoteSegment;
use warden_core::Segment;
use warden_core::SegmentPath;
use warden_ec::EcClient;
use warden_ec::PieceStore;
use warden_ec::Scheme;
use warden_metainfo::MemoryPointerStore;
use warden_metainfo::PointerStore;
use warden_orders::OrderService;
use warden_orders::OrdersConfig;
use warden_orders::SatelliteSigner;
use warden_overlay::MemoryOverlayStore;
use warden_overlay::NodeDossier;
use warden_overlay::OverlayConfig;
use warden_overlay::OverlayService;
use warden_overlay::OverlayStore;
use warden_overlay::ReliabilityCache;
use warden_repair::Checker;
use warden_repair::CheckerConfig;
use warden_repair::HealthObserver;
use warden_repair::MemoryIrreparableStore;
use warden_repair::MemoryRepairQueue;
use warden_repair::RepairerConfig;
use warden_repair::SegmentRepairer;

use crate::swarm::SimSwarm;

/// Deterministic satellite identity for fixtures.
const SATELLITE_SEED: [u8; 32] = [0x5A; 32];

/// A fully wired durability core over in-memory backends.
pub struct TestSatellite {
    pub overlay_store: Arc<MemoryOverlayStore>,
    pub overlay: Arc<OverlayService>,
    pub metainfo: Arc<MemoryPointerStore>,
    pub orders: Arc<OrderService>,
    pub swarm: Arc<SimSwarm>,
    pub queue: Arc<MemoryRepairQueue>,
    pub irreparable: Arc<MemoryIrreparableStore>,
    pub containment: Arc<MemoryContainment>,
    pub reliability: Arc<ReliabilityCache>,
}

impl TestSatellite {
    /// Build a satellite with `node_count` online, vetted storage nodes.
    pub async fn new(node_count: u8) -> Self {
        Self::with_overlay_config(node_count, OverlayConfig::default()).await
    }

    pub async fn with_overlay_config(node_count: u8, overlay_config: OverlayConfig) -> Self {
        let overlay_store = Arc::new(MemoryOverlayStore::new());
        let now = Utc::now();
        for seed in 1..=node_count {
            let mut dossier = NodeDossier::new(
                Self::node_id(seed),
                format!("sim-{seed}:7777"),
                &overlay_config.audit_reputation,
                &overlay_config.uptime_reputation,
            );
            dossier.last_contact_success = Some(now);
            dossier.vetted_at = Some(now);
            dossier.capacity.free_disk = 1 << 30;
            dossier.capacity.free_bandwidth = 1 << 30;
            overlay_store.upsert(dossier).await.expect("seed overlay");
        }

        let overlay = Arc::new(OverlayService::new(
            Arc::clone(&overlay_store) as Arc<dyn OverlayStore>,
            overlay_config,
        ));
        let signer = SatelliteSigner::from_seed(NodeId([0xEE; 32]), SATELLITE_SEED);
        let swarm = Arc::new(SimSwarm::new(signer.public_key_bytes()));
        for seed in 1..=node_count {
            swarm.add_node(Self::node_id(seed));
        }

        let orders = Arc::new(OrderService::new(
            signer,
            Arc::clone(&overlay),
            OrdersConfig::default(),
        ));
        let reliability = Arc::new(ReliabilityCache::new(
            Arc::clone(&overlay),
            Duration::from_millis(50),
        ));

        TestSatellite {
            overlay_store,
            overlay,
            metainfo: Arc::new(MemoryPointerStore::new()),
            orders,
            swarm,
            queue: Arc::new(MemoryRepairQueue::default()),
            irreparable: Arc::new(MemoryIrreparableStore::new()),
            containment: Arc::new(MemoryContainment::new()),
            reliability,
        }
    }

    pub fn node_id(seed: u8) -> NodeId {
        NodeId([seed; 32])
    }

    /// A signer for the same satellite identity the swarm trusts.
    pub fn satellite_signer(&self) -> SatelliteSigner {
        SatelliteSigner::from_seed(NodeId([0xEE; 32]), SATELLITE_SEED)
    }

    /// Erasure-code `data` onto the given nodes and commit the pointer.
    pub async fn upload_segment(
        &self,
        path: &str,
        redundancy: RedundancyScheme,
        data: &[u8],
        node_seeds: &[u8],
    ) -> (SegmentPath, Pointer) {
        assert_eq!(
            node_seeds.len(),
            usize::from(redundancy.total),
            "one node per piece"
        );

        let scheme = Scheme::new(redundancy).expect("valid scheme");
        let pieces_data = scheme.encode(data).expect("encode segment");

        let mut root = [0u8; 32];
        rand::thread_rng().fill(&mut root);
        let root_piece_id = PieceId(root);

        let mut pieces = Vec::new();
        for (piece_num, (&seed, piece_data)) in
            node_seeds.iter().zip(pieces_data.into_iter()).enumerate()
        {
            let node_id = Self::node_id(seed);
            let piece_id = root_piece_id.derive(node_id, piece_num as u16);
            self.swarm.seed_piece(node_id, piece_id, piece_data);
            pieces.push(RemotePiece {
                piece_num: piece_num as u16,
                node_id,
                hash: None,
            });
        }

        let pointer = Pointer {
            segment: Segment::Remote(RemoteSegment {
                root_piece_id,
                redundancy,
                pieces,
            }),
            created_at: Utc::now(),
            expires_at: None,
            segment_size: data.len() as u64,
            metadata: Vec::new(),
        };
        let path = SegmentPath::from(path);
        self.metainfo
            .put(&path, pointer.clone())
            .await
            .expect("commit pointer");
        (path, pointer)
    }

    /// Take a node offline for both the swarm and the overlay, then
    /// refresh the reliability snapshot.
    pub async fn set_node_offline(&self, seed: u8, offline: bool) {
        let node_id = Self::node_id(seed);
        self.swarm.set_offline(node_id, offline);
        let contact = if offline { None } else { Some(Utc::now()) };
        self.overlay_store.set_last_contact_success(node_id, contact);
        self.reliability.refresh().await.expect("refresh reliability");
    }

    pub fn ec_client(&self) -> EcClient {
        EcClient::new(Arc::clone(&self.swarm) as Arc<dyn PieceStore>)
    }

    pub fn segment_repairer(&self, config: &RepairerConfig) -> SegmentRepairer {
        SegmentRepairer::new(
            Arc::clone(&self.metainfo) as Arc<dyn PointerStore>,
            Arc::clone(&self.orders),
            Arc::clone(&self.overlay),
            Arc::clone(&self.reliability),
            self.ec_client(),
            config,
        )
    }

    pub fn health_observer(&self) -> HealthObserver {
        HealthObserver::new(
            Arc::clone(&self.queue) as _,
            Arc::clone(&self.irreparable) as _,
            Arc::clone(&self.reliability),
        )
    }

    pub fn checker(&self, metainfo_loop: warden_metainfo::MetainfoLoop, config: CheckerConfig) -> Checker {
        Checker::new(
            metainfo_loop,
            Arc::clone(&self.queue) as _,
            Arc::clone(&self.irreparable) as _,
            Arc::clone(&self.reliability),
            config,
        )
    }

    pub fn verifier(&self, config: AuditConfig) -> Verifier {
        Verifier::new(
            Arc::clone(&self.metainfo) as Arc<dyn PointerStore>,
            Arc::clone(&self.orders),
            Arc::clone(&self.containment) as _,
            Arc::clone(&self.swarm) as Arc<dyn PieceStore>,
            config,
        )
    }

    pub fn reporter(&self) -> Reporter {
        Reporter::new(
            Arc::clone(&self.overlay),
            Arc::clone(&self.containment) as _,
            3,
        )
    }

    /// Derived piece ID of piece `piece_num` in `pointer`.
    pub fn piece_id_of(pointer: &Pointer, piece_num: u16) -> PieceId {
        let remote = pointer.remote().expect("remote pointer");
        let piece = remote.piece_for_num(piece_num).expect("piece present");
        remote.root_piece_id.derive(piece.node_id, piece_num)
    }
}
