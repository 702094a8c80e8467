//! Simulated storage-node swarm.
//!
//! Implements [`PieceStore`] over a population of in-memory nodes that
//! behave like the real thing where the durability core cares: every
//! request passes full order-limit verification (signature, grace window,
//! single-use serials) and order settlement before any byte moves. Tests
//! flip per-node behavior to make nodes drop offline, stall, reject
//! requests, or serve corrupted bytes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use parking_lot::RwLock;
use sha2::Digest;
use sha2::Sha256;

use warden_core::NodeId;
use warden_core::PieceHash;
use warden_core::PieceId;
use warden_ec::PieceStore;
use warden_ec::PieceStoreError;
use warden_orders::verify_order;
use warden_orders::verify_order_limit;
use warden_orders::verify_piece_hash;
use warden_orders::AddressedOrderLimit;
use warden_orders::OrdersError;
use warden_orders::PieceAction;
use warden_orders::PiecePrivateKey;
use warden_orders::UsedSerials;
use warden_orders::VerifierConfig;

#[derive(Default)]
struct NodeState {
    pieces: HashMap<PieceId, Vec<u8>>,
    /// Refuse dials entirely.
    offline: bool,
    /// Delay every request by this much before answering.
    stall: Option<Duration>,
    /// Answer dials but reject download requests.
    reject_downloads: bool,
}

struct SimNode {
    state: Mutex<NodeState>,
    serials: UsedSerials,
}

impl SimNode {
    fn new() -> Self {
        SimNode {
            state: Mutex::new(NodeState::default()),
            serials: UsedSerials::new(),
        }
    }
}

/// In-memory storage-node population.
pub struct SimSwarm {
    satellite_public_key: [u8; 32],
    verifier_config: VerifierConfig,
    nodes: RwLock<HashMap<NodeId, Arc<SimNode>>>,
}

impl SimSwarm {
    pub fn new(satellite_public_key: [u8; 32]) -> Self {
        SimSwarm {
            satellite_public_key,
            verifier_config: VerifierConfig::default(),
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_node(&self, node_id: NodeId) {
        self.nodes
            .write()
            .entry(node_id)
            .or_insert_with(|| Arc::new(SimNode::new()));
    }

    pub fn set_offline(&self, node_id: NodeId, offline: bool) {
        if let Some(node) = self.node(node_id) {
            node.state.lock().offline = offline;
        }
    }

    pub fn set_stall(&self, node_id: NodeId, stall: Option<Duration>) {
        if let Some(node) = self.node(node_id) {
            node.state.lock().stall = stall;
        }
    }

    pub fn set_reject_downloads(&self, node_id: NodeId, reject: bool) {
        if let Some(node) = self.node(node_id) {
            node.state.lock().reject_downloads = reject;
        }
    }

    /// Place piece bytes on a node directly, as an uplink upload would.
    pub fn seed_piece(&self, node_id: NodeId, piece_id: PieceId, data: Vec<u8>) {
        if let Some(node) = self.node(node_id) {
            node.state.lock().pieces.insert(piece_id, data);
        }
    }

    /// Flip every byte of a stored piece, preserving its length.
    pub fn corrupt_piece(&self, node_id: NodeId, piece_id: PieceId) -> bool {
        let Some(node) = self.node(node_id) else {
            return false;
        };
        let mut state = node.state.lock();
        match state.pieces.get_mut(&piece_id) {
            Some(data) => {
                for byte in data.iter_mut() {
                    *byte ^= 0xFF;
                }
                true
            }
            None => false,
        }
    }

    pub fn drop_piece(&self, node_id: NodeId, piece_id: PieceId) -> bool {
        match self.node(node_id) {
            Some(node) => node.state.lock().pieces.remove(&piece_id).is_some(),
            None => false,
        }
    }

    pub fn piece_data(&self, node_id: NodeId, piece_id: PieceId) -> Option<Vec<u8>> {
        self.node(node_id)?.state.lock().pieces.get(&piece_id).cloned()
    }

    fn node(&self, node_id: NodeId) -> Option<Arc<SimNode>> {
        self.nodes.read().get(&node_id).cloned()
    }

    /// Dial checks shared by every request.
    async fn dial(
        &self,
        limit: &AddressedOrderLimit,
    ) -> Result<Arc<SimNode>, PieceStoreError> {
        let node_id = limit.limit.storage_node_id;
        let Some(node) = self.node(node_id) else {
            return Err(PieceStoreError::DialFailed {
                address: limit.node_address.clone(),
                message: "unknown node".to_string(),
            });
        };

        let (offline, stall) = {
            let state = node.state.lock();
            (state.offline, state.stall)
        };
        if offline {
            return Err(PieceStoreError::DialTimeout {
                address: limit.node_address.clone(),
            });
        }
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        Ok(node)
    }

    fn admit(
        &self,
        node: &SimNode,
        limit: &AddressedOrderLimit,
        allowed: &[PieceAction],
    ) -> Result<(), PieceStoreError> {
        if !allowed.contains(&limit.limit.action) {
            return Err(PieceStoreError::Rejected {
                message: format!("action {:?} not allowed here", limit.limit.action),
            });
        }
        verify_order_limit(
            &limit.limit,
            limit.limit.storage_node_id,
            &self.satellite_public_key,
            &node.serials,
            &self.verifier_config,
            Utc::now(),
        )
        .map_err(reject)
    }
}

fn reject(error: OrdersError) -> PieceStoreError {
    match error {
        OrdersError::DuplicateSerial { serial } => PieceStoreError::Rejected {
            message: format!("duplicate request: serial {serial} already used"),
        },
        other => PieceStoreError::Rejected {
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl PieceStore for SimSwarm {
    async fn upload(
        &self,
        limit: &AddressedOrderLimit,
        piece_key: &PiecePrivateKey,
        data: &[u8],
    ) -> Result<PieceHash, PieceStoreError> {
        let node = self.dial(limit).await?;
        self.admit(&node, limit, &[PieceAction::Put, PieceAction::PutRepair])?;

        if data.len() as i64 > limit.limit.limit {
            return Err(PieceStoreError::Rejected {
                message: format!(
                    "upload of {} bytes exceeds limit {}",
                    data.len(),
                    limit.limit.limit
                ),
            });
        }

        // the client settles its order and signs the piece hash
        let order = piece_key
            .sign_order(limit.limit.serial, data.len() as i64)
            .map_err(reject)?;
        verify_order(&limit.limit, &order, 0).map_err(reject)?;

        let hash: [u8; 32] = Sha256::digest(data).into();
        let piece_hash = piece_key
            .sign_piece_hash(limit.limit.piece_id, hash)
            .map_err(reject)?;
        verify_piece_hash(&limit.limit, &piece_hash, &hash).map_err(reject)?;

        node.state
            .lock()
            .pieces
            .insert(limit.limit.piece_id, data.to_vec());
        Ok(piece_hash)
    }

    async fn download(
        &self,
        limit: &AddressedOrderLimit,
        piece_key: &PiecePrivateKey,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, PieceStoreError> {
        let node = self.dial(limit).await?;

        if node.state.lock().reject_downloads {
            return Err(PieceStoreError::Rejected {
                message: "download refused".to_string(),
            });
        }

        self.admit(
            &node,
            limit,
            &[PieceAction::Get, PieceAction::GetRepair, PieceAction::GetAudit],
        )?;

        let order = piece_key
            .sign_order(limit.limit.serial, length as i64)
            .map_err(reject)?;
        verify_order(&limit.limit, &order, 0).map_err(reject)?;

        let state = node.state.lock();
        let Some(data) = state.pieces.get(&limit.limit.piece_id) else {
            return Err(PieceStoreError::NotFound {
                piece_id: limit.limit.piece_id,
            });
        };

        let start = offset as usize;
        let end = start + length as usize;
        if end > data.len() {
            return Err(PieceStoreError::Transfer {
                message: format!(
                    "range {start}..{end} out of bounds for piece of {} bytes",
                    data.len()
                ),
            });
        }
        Ok(data[start..end].to_vec())
    }

    async fn delete(
        &self,
        limit: &AddressedOrderLimit,
        _piece_key: &PiecePrivateKey,
    ) -> Result<(), PieceStoreError> {
        let node = self.dial(limit).await?;
        self.admit(&node, limit, &[PieceAction::Delete])?;
        node.state.lock().pieces.remove(&limit.limit.piece_id);
        Ok(())
    }
}
