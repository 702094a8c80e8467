//! Order authority.
//!
//! Mints the ticket sets the repair and audit paths need. Every creator
//! returns a slice of optional addressed limits aligned by piece number
//! (slot `i` authorizes piece `i`, `None` where no transfer is authorized)
//! plus the fresh ephemeral piece key whose holder signs orders against
//! the set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use rand::Rng;
use tracing::debug;

use warden_core::NodeId;
use warden_core::PieceId;
use warden_core::Pointer;
use warden_core::RemotePiece;
use warden_core::SerialNumber;
use warden_overlay::NodeDossier;
use warden_overlay::OverlayError;
use warden_overlay::OverlayService;

use crate::limit::AddressedOrderLimit;
use crate::limit::OrderLimit;
use crate::limit::PieceAction;
use crate::limit::PiecePrivateKey;
use crate::limit::PiecePublicKey;
use crate::limit::SatelliteSigner;
use crate::OrdersError;

/// Satellite-side order tuning.
#[derive(Debug, Clone)]
pub struct OrdersConfig {
    /// Validity window stamped into each ticket.
    pub order_expiration: Duration,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        OrdersConfig {
            order_expiration: Duration::from_secs(24 * 3600),
        }
    }
}

/// Mints signed, single-use order limits.
pub struct OrderService {
    signer: SatelliteSigner,
    overlay: Arc<OverlayService>,
    config: OrdersConfig,
}

impl OrderService {
    pub fn new(signer: SatelliteSigner, overlay: Arc<OverlayService>, config: OrdersConfig) -> Self {
        OrderService {
            signer,
            overlay,
            config,
        }
    }

    pub fn satellite_id(&self) -> NodeId {
        self.signer.id()
    }

    pub fn satellite_public_key(&self) -> [u8; 32] {
        self.signer.public_key_bytes()
    }

    /// Tickets for an uplink download. Errors unless at least `required`
    /// pieces are orderable.
    pub async fn create_get_order_limits(
        &self,
        pointer: &Pointer,
    ) -> Result<(Vec<Option<AddressedOrderLimit>>, PiecePrivateKey), OrdersError> {
        let remote = remote_of(pointer)?;
        let piece_size = remote.redundancy.piece_size(pointer.segment_size) as i64;
        let (limits, key) = self
            .limits_for_pieces(pointer, &remote.pieces, PieceAction::Get, piece_size, &HashSet::new())
            .await?;

        let found = limits.iter().flatten().count();
        let required = usize::from(remote.redundancy.required);
        if found < required {
            return Err(OrdersError::NotEnoughNodes { required, found });
        }
        Ok((limits, key))
    }

    /// Tickets for the repairer's download of healthy pieces.
    pub async fn create_get_repair_order_limits(
        &self,
        pointer: &Pointer,
        healthy: &[RemotePiece],
    ) -> Result<(Vec<Option<AddressedOrderLimit>>, PiecePrivateKey), OrdersError> {
        let remote = remote_of(pointer)?;
        let piece_size = remote.redundancy.piece_size(pointer.segment_size) as i64;
        let (limits, key) = self
            .limits_for_pieces(pointer, healthy, PieceAction::GetRepair, piece_size, &HashSet::new())
            .await?;

        let found = limits.iter().flatten().count();
        let required = usize::from(remote.redundancy.required);
        if found < required {
            return Err(OrdersError::NotEnoughNodes { required, found });
        }
        Ok((limits, key))
    }

    /// Tickets for uploading repaired pieces to `new_nodes`.
    ///
    /// New nodes are assigned the piece numbers left vacant by the GET
    /// repair set, so a repaired piece replaces the unhealthy piece that
    /// previously held its number.
    pub async fn create_put_repair_order_limits(
        &self,
        pointer: &Pointer,
        get_limits: &[Option<AddressedOrderLimit>],
        new_nodes: &[NodeDossier],
    ) -> Result<(Vec<Option<AddressedOrderLimit>>, PiecePrivateKey), OrdersError> {
        let remote = remote_of(pointer)?;
        let total = usize::from(remote.redundancy.total);
        let piece_size = remote.redundancy.piece_size(pointer.segment_size) as i64;
        let (key, public) = PiecePrivateKey::generate();
        let now = Utc::now();

        let mut limits: Vec<Option<AddressedOrderLimit>> = vec![None; total];
        let mut piece_num = 0usize;
        for node in new_nodes {
            while piece_num < total && get_limits.get(piece_num).is_some_and(Option::is_some) {
                piece_num += 1;
            }
            if piece_num >= total {
                let vacant = total - get_limits.iter().flatten().count();
                return Err(OrdersError::Protocol {
                    message: format!(
                        "requested {} repair targets but only {vacant} piece slots are vacant",
                        new_nodes.len(),
                    ),
                });
            }

            let limit = self.build_limit(
                remote.root_piece_id,
                node.id,
                piece_num as u16,
                public,
                PieceAction::PutRepair,
                piece_size,
                pointer.expires_at,
                now,
            )?;
            limits[piece_num] = Some(AddressedOrderLimit {
                limit,
                node_address: node.address.clone(),
            });
            piece_num += 1;
        }

        Ok((limits, key))
    }

    /// Tickets for downloading one share per piece of an audited segment.
    ///
    /// Never fails for lack of nodes: offline, disqualified, unknown, and
    /// skipped nodes simply yield `None` slots, and the verifier reports
    /// them from the pointer.
    pub async fn create_audit_order_limits(
        &self,
        pointer: &Pointer,
        skip: &HashSet<NodeId>,
    ) -> Result<(Vec<Option<AddressedOrderLimit>>, PiecePrivateKey), OrdersError> {
        let remote = remote_of(pointer)?;
        let share_size = i64::from(remote.redundancy.share_size);
        self.limits_for_pieces(pointer, &remote.pieces, PieceAction::GetAudit, share_size, skip)
            .await
    }

    /// A single audit ticket, used by reverification.
    pub async fn create_audit_order_limit(
        &self,
        root_piece_id: PieceId,
        node_id: NodeId,
        piece_num: u16,
        share_size: u32,
    ) -> Result<(AddressedOrderLimit, PiecePrivateKey), OrdersError> {
        let dossier = self
            .overlay
            .get_online(node_id)
            .await
            .map_err(|source| OrdersError::Overlay { source })?;

        let (key, public) = PiecePrivateKey::generate();
        let limit = self.build_limit(
            root_piece_id,
            node_id,
            piece_num,
            public,
            PieceAction::GetAudit,
            i64::from(share_size),
            None,
            Utc::now(),
        )?;

        Ok((
            AddressedOrderLimit {
                limit,
                node_address: dossier.address,
            },
            key,
        ))
    }

    async fn limits_for_pieces(
        &self,
        pointer: &Pointer,
        pieces: &[RemotePiece],
        action: PieceAction,
        limit_bytes: i64,
        skip: &HashSet<NodeId>,
    ) -> Result<(Vec<Option<AddressedOrderLimit>>, PiecePrivateKey), OrdersError> {
        let remote = remote_of(pointer)?;
        let total = usize::from(remote.redundancy.total);
        let (key, public) = PiecePrivateKey::generate();
        let now = Utc::now();

        let mut limits: Vec<Option<AddressedOrderLimit>> = vec![None; total];
        for piece in pieces {
            if skip.contains(&piece.node_id) {
                continue;
            }
            let dossier = match self.overlay.get_online(piece.node_id).await {
                Ok(dossier) => dossier,
                Err(
                    OverlayError::NodeOffline { .. }
                    | OverlayError::NodeDisqualified { .. }
                    | OverlayError::NodeNotFound { .. },
                ) => {
                    debug!(node_id = %piece.node_id, piece_num = piece.piece_num,
                        "no order limit: node not orderable");
                    continue;
                }
                Err(source) => return Err(OrdersError::Overlay { source }),
            };

            let limit = self.build_limit(
                remote.root_piece_id,
                piece.node_id,
                piece.piece_num,
                public,
                action,
                limit_bytes,
                pointer.expires_at,
                now,
            )?;
            limits[usize::from(piece.piece_num)] = Some(AddressedOrderLimit {
                limit,
                node_address: dossier.address,
            });
        }

        Ok((limits, key))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_limit(
        &self,
        root_piece_id: PieceId,
        node_id: NodeId,
        piece_num: u16,
        uplink_public_key: PiecePublicKey,
        action: PieceAction,
        limit_bytes: i64,
        piece_expiration: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<OrderLimit, OrdersError> {
        let serial = SerialNumber(rand::thread_rng().gen());
        let order_expiration = now
            + chrono::Duration::from_std(self.config.order_expiration)
                .unwrap_or_else(|_| chrono::Duration::hours(24));

        self.signer.sign(OrderLimit {
            serial,
            satellite_id: self.signer.id(),
            storage_node_id: node_id,
            piece_id: root_piece_id.derive(node_id, piece_num),
            uplink_public_key,
            action,
            limit: limit_bytes,
            piece_expiration,
            order_expiration,
            order_creation: now,
            satellite_signature: Vec::new(),
        })
    }
}

fn remote_of(pointer: &Pointer) -> Result<&warden_core::RemoteSegment, OrdersError> {
    pointer.remote().ok_or_else(|| OrdersError::Protocol {
        message: "order limits require a remote segment".to_string(),
    })
}
