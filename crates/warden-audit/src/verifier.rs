//! Audit verifier.
//!
//! Audits work on stripes: one `share_size` slice of every piece at the
//! same stripe index forms a codeword of the segment's erasure scheme, so
//! downloading the shares and running erasure correction exposes any node
//! that served tampered bytes without ever reconstructing the whole
//! segment.
//!
//! `verify` challenges every piece of a stripe at once and classifies each
//! node as success, fail (missing or corrupt data), offline, or contained
//! (inconclusive; a pending audit pins the share it owes). `reverify`
//! settles contained nodes: the node either produces the exact share it
//! stalled on or is failed.
//!
//! Neither function touches reputation itself; they emit a [`Report`] the
//! [`crate::Reporter`] applies.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sha2::Digest;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use warden_core::NodeId;
use warden_core::Pointer;
use warden_core::RemotePiece;
use warden_core::SegmentPath;
use warden_ec::PieceStore;
use warden_ec::PieceStoreError;
use warden_ec::Scheme;
use warden_metainfo::MetainfoError;
use warden_metainfo::PointerStore;
use warden_orders::AddressedOrderLimit;
use warden_orders::OrderService;
use warden_orders::OrdersError;
use warden_orders::PiecePrivateKey;
use warden_overlay::OverlayError;

use crate::containment::Containment;
use crate::containment::PendingAudit;
use crate::error::AuditError;

/// One randomly chosen stripe of one segment.
#[derive(Debug, Clone)]
pub struct Stripe {
    pub path: SegmentPath,
    pub pointer: Pointer,
    pub index: u64,
}

/// Pick a random stripe of a remote segment.
pub fn select_stripe<R: Rng>(path: &SegmentPath, pointer: &Pointer, rng: &mut R) -> Option<Stripe> {
    let remote = pointer.remote()?;
    let stripes = remote.redundancy.stripe_count(pointer.segment_size);
    if stripes == 0 {
        return None;
    }
    Some(Stripe {
        path: path.clone(),
        pointer: pointer.clone(),
        index: rng.gen_range(0..stripes),
    })
}

/// One downloaded (or failed) share.
#[derive(Debug)]
pub struct Share {
    pub piece_num: u16,
    pub node_id: NodeId,
    pub result: Result<Vec<u8>, PieceStoreError>,
}

/// Audit outcome for one stripe.
///
/// The four sets partition the segment's piece set minus the skip set.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub successes: Vec<NodeId>,
    pub fails: Vec<NodeId>,
    pub offlines: Vec<NodeId>,
    pub pending_audits: Vec<PendingAudit>,
}

impl Report {
    pub fn total_audited(&self) -> usize {
        self.successes.len() + self.fails.len() + self.offlines.len() + self.pending_audits.len()
    }
}

/// Audit download tuning.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Floor on assumed node throughput when sizing share deadlines.
    pub min_bytes_per_second: u64,
    /// Floor on the per-share download deadline.
    pub min_download_timeout: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            min_bytes_per_second: 128 * 1024,
            min_download_timeout: Duration::from_secs(25),
        }
    }
}

impl AuditConfig {
    /// `max(share_size / min_bytes_per_second, min_download_timeout)`
    fn share_deadline(&self, share_size: u32) -> Duration {
        let transfer = Duration::from_secs_f64(
            f64::from(share_size) / self.min_bytes_per_second.max(1) as f64,
        );
        transfer.max(self.min_download_timeout)
    }
}

/// Checks stripe correctness and settles contained nodes.
#[derive(Clone)]
pub struct Verifier {
    metainfo: Arc<dyn PointerStore>,
    orders: Arc<OrderService>,
    containment: Arc<dyn Containment>,
    pieces: Arc<dyn PieceStore>,
    config: AuditConfig,
}

impl Verifier {
    pub fn new(
        metainfo: Arc<dyn PointerStore>,
        orders: Arc<OrderService>,
        containment: Arc<dyn Containment>,
        pieces: Arc<dyn PieceStore>,
        config: AuditConfig,
    ) -> Self {
        Verifier {
            metainfo,
            orders,
            containment,
            pieces,
            config,
        }
    }

    /// Download one share per piece of the stripe and cross-check them.
    ///
    /// Nodes in `skip` are already being reverified and are left out
    /// entirely.
    pub async fn verify(
        &self,
        stripe: &Stripe,
        skip: &HashSet<NodeId>,
    ) -> Result<Report, AuditError> {
        let Some(remote) = stripe.pointer.remote() else {
            return Err(AuditError::InlineSegment {
                path: stripe.path.clone(),
            });
        };
        let redundancy = remote.redundancy;
        let share_size = redundancy.share_size;

        let (limits, piece_key) = self
            .orders
            .create_audit_order_limits(&stripe.pointer, skip)
            .await?;

        // pieces with no limit are on offline/disqualified/unknown nodes
        let mut offlines = offline_nodes(remote.pieces.as_slice(), &limits, skip);
        if !offlines.is_empty() {
            debug!(path = %stripe.path, offline = offlines.len(),
                "order limits not created for some nodes");
        }

        let shares = self
            .download_shares(&limits, &piece_key, stripe.index, share_size)
            .await;

        // a pointer rewritten mid-download invalidates everything we hold
        self.check_segment_unchanged(&stripe.path, &stripe.pointer)
            .await?;

        let mut fails: Vec<NodeId> = Vec::new();
        let mut contained: HashMap<u16, NodeId> = HashMap::new();
        let mut shares_to_audit: Vec<(u16, Vec<u8>)> = Vec::new();

        for share in shares.values() {
            match &share.result {
                Ok(data) => shares_to_audit.push((share.piece_num, data.clone())),
                Err(error) if error.is_dial_failure() => {
                    debug!(node_id = %share.node_id, %error, "share download: node offline");
                    offlines.push(share.node_id);
                }
                Err(PieceStoreError::NotFound { .. }) => {
                    debug!(node_id = %share.node_id, "share download: piece missing");
                    fails.push(share.node_id);
                }
                Err(error) => {
                    debug!(node_id = %share.node_id, %error,
                        "share download inconclusive, containing node");
                    contained.insert(share.piece_num, share.node_id);
                }
            }
        }

        let required = usize::from(redundancy.required);
        if shares_to_audit.len() < required {
            return Err(AuditError::NotEnoughShares {
                got: shares_to_audit.len(),
                required,
                offlines,
                fails,
            });
        }

        let scheme = Scheme::new(redundancy)?;
        let correction = scheme.correct(&shares_to_audit)?;
        for bad in &correction.bad_piece_nums {
            if let Some(share) = shares.get(bad) {
                warn!(node_id = %share.node_id, piece_num = bad,
                    "share disagrees with corrected stripe");
                fails.push(share.node_id);
            }
        }

        // drop failed pieces from the pointer so each node is penalized
        // only once for the same loss
        if let Err(error) = self
            .remove_failed_pieces(&stripe.path, &stripe.pointer, &fails)
            .await
        {
            warn!(path = %stripe.path, %error, "failed to drop failed pieces");
        }

        let not_success: HashSet<NodeId> = fails
            .iter()
            .chain(offlines.iter())
            .chain(contained.values())
            .copied()
            .collect();
        let successes: Vec<NodeId> = shares
            .values()
            .filter(|share| share.result.is_ok() && !not_success.contains(&share.node_id))
            .map(|share| share.node_id)
            .collect();

        let mut pending_audits = Vec::new();
        for (piece_num, node_id) in contained {
            let expected = &correction.shards[usize::from(piece_num)];
            pending_audits.push(PendingAudit {
                node_id,
                piece_id: remote.root_piece_id,
                stripe_index: stripe.index,
                share_size,
                expected_share_hash: sha256(expected),
                path: stripe.path.clone(),
            });
        }

        Ok(Report {
            successes,
            fails,
            offlines,
            pending_audits,
        })
    }

    /// Settle every contained node holding a piece of this segment.
    pub async fn reverify(&self, stripe: &Stripe) -> Result<Report, AuditError> {
        let Some(remote) = stripe.pointer.remote() else {
            return Err(AuditError::InlineSegment {
                path: stripe.path.clone(),
            });
        };

        let (tx, mut rx) = mpsc::channel(remote.pieces.len().max(1));
        let mut spawned = 0;
        for piece in &remote.pieces {
            let Some(pending) = self.containment.get(piece.node_id).await? else {
                continue;
            };
            spawned += 1;
            let verifier = self.clone();
            let piece = piece.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let status = verifier.reverify_node(pending, &piece).await;
                let _ = tx.send((piece.node_id, status)).await;
            });
        }
        drop(tx);

        let mut report = Report::default();
        for _ in 0..spawned {
            let Some((node_id, status)) = rx.recv().await else {
                break;
            };
            match status {
                ReverifyStatus::Skipped => {}
                ReverifyStatus::Success => report.successes.push(node_id),
                ReverifyStatus::Offline => report.offlines.push(node_id),
                ReverifyStatus::Failed => report.fails.push(node_id),
                ReverifyStatus::Contained(pending) => report.pending_audits.push(pending),
                ReverifyStatus::Erred(message) => {
                    warn!(node_id = %node_id, message, "reverification errored");
                }
            }
        }
        Ok(report)
    }

    async fn reverify_node(&self, pending: PendingAudit, piece: &RemotePiece) -> ReverifyStatus {
        let node_id = pending.node_id;

        let (limit, piece_key) = match self
            .orders
            .create_audit_order_limit(
                pending.piece_id,
                node_id,
                piece.piece_num,
                pending.share_size,
            )
            .await
        {
            Ok(minted) => minted,
            Err(OrdersError::Overlay {
                source: OverlayError::NodeDisqualified { .. },
            }) => {
                // a disqualified node will never answer; drop the record
                if let Err(error) = self.containment.delete(node_id).await {
                    warn!(node_id = %node_id, %error, "failed to clear containment");
                }
                return ReverifyStatus::Erred("node disqualified".to_string());
            }
            Err(OrdersError::Overlay {
                source: OverlayError::NodeOffline { .. },
            }) => return ReverifyStatus::Offline,
            Err(error) => return ReverifyStatus::Erred(error.to_string()),
        };

        let share = self
            .get_share(
                &limit,
                &piece_key,
                pending.stripe_index,
                pending.share_size,
                piece.piece_num,
                node_id,
            )
            .await;

        // the record may have been settled while we were downloading
        match self.containment.get(node_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(node_id = %node_id, "pending audit cleared during reverification");
                return ReverifyStatus::Skipped;
            }
            Err(error) => return ReverifyStatus::Erred(error.to_string()),
        }

        match share.result {
            Err(error) if error.is_dial_failure() => {
                debug!(node_id = %node_id, %error, "reverify: node offline");
                ReverifyStatus::Offline
            }
            Err(PieceStoreError::NotFound { .. }) => {
                if self.piece_still_expected(&pending, node_id).await {
                    debug!(node_id = %node_id, "reverify: piece missing");
                    ReverifyStatus::Failed
                } else {
                    debug!(node_id = %node_id, "reverify: segment gone, not penalizing");
                    ReverifyStatus::Success
                }
            }
            Err(error) => {
                debug!(node_id = %node_id, %error, "reverify: still inconclusive");
                ReverifyStatus::Contained(pending)
            }
            Ok(data) => {
                if sha256(&data) == pending.expected_share_hash {
                    debug!(node_id = %node_id, "reverify: hashes match");
                    ReverifyStatus::Success
                } else if self.piece_still_expected(&pending, node_id).await {
                    debug!(node_id = %node_id, "reverify: hash mismatch");
                    ReverifyStatus::Failed
                } else {
                    debug!(node_id = %node_id, "reverify: segment gone, not penalizing");
                    ReverifyStatus::Success
                }
            }
        }
    }

    /// Whether the pending audit's segment still holds a piece on the
    /// node. When it does and the answer was wrong, the piece is removed
    /// so the node is penalized only once.
    async fn piece_still_expected(&self, pending: &PendingAudit, node_id: NodeId) -> bool {
        let pointer = match self.metainfo.get(&pending.path).await {
            Ok(pointer) => pointer,
            Err(MetainfoError::PointerNotFound { .. }) => return false,
            Err(error) => {
                warn!(path = %pending.path, %error, "reverify pointer check failed");
                return false;
            }
        };
        let still_there = pointer
            .remote()
            .is_some_and(|remote| remote.piece_for_node(node_id).is_some());
        if still_there {
            if let Err(error) = self
                .remove_failed_pieces(&pending.path, &pointer, &[node_id])
                .await
            {
                warn!(path = %pending.path, %error, "failed to drop reverify-failed piece");
            }
        }
        still_there
    }

    async fn download_shares(
        &self,
        limits: &[Option<AddressedOrderLimit>],
        piece_key: &PiecePrivateKey,
        stripe_index: u64,
        share_size: u32,
    ) -> HashMap<u16, Share> {
        let (tx, mut rx) = mpsc::channel(limits.len().max(1));
        let mut spawned = 0;
        for (piece_num, limit) in limits.iter().enumerate() {
            let Some(limit) = limit else { continue };
            spawned += 1;
            let verifier = self.clone();
            let limit = limit.clone();
            let key = piece_key.clone();
            let tx = tx.clone();
            let node_id = limit.limit.storage_node_id;
            tokio::spawn(async move {
                let share = verifier
                    .get_share(&limit, &key, stripe_index, share_size, piece_num as u16, node_id)
                    .await;
                let _ = tx.send(share).await;
            });
        }
        drop(tx);

        let mut shares = HashMap::with_capacity(spawned);
        for _ in 0..spawned {
            let Some(share) = rx.recv().await else { break };
            shares.insert(share.piece_num, share);
        }
        shares
    }

    async fn get_share(
        &self,
        limit: &AddressedOrderLimit,
        piece_key: &PiecePrivateKey,
        stripe_index: u64,
        share_size: u32,
        piece_num: u16,
        node_id: NodeId,
    ) -> Share {
        let offset = u64::from(share_size) * stripe_index;
        let deadline = self.config.share_deadline(share_size);

        let result = match tokio::time::timeout(
            deadline,
            self.pieces
                .download(limit, piece_key, offset, u64::from(share_size)),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PieceStoreError::DeadlineExceeded),
        };

        Share {
            piece_num,
            node_id,
            result,
        }
    }

    async fn check_segment_unchanged(
        &self,
        path: &SegmentPath,
        pointer: &Pointer,
    ) -> Result<(), AuditError> {
        match self.metainfo.get(path).await {
            Ok(current) if current.created_at == pointer.created_at => Ok(()),
            Ok(_) | Err(MetainfoError::PointerNotFound { .. }) => {
                Err(AuditError::SegmentDeleted { path: path.clone() })
            }
            Err(source) => Err(AuditError::Metainfo { source }),
        }
    }

    async fn remove_failed_pieces(
        &self,
        path: &SegmentPath,
        pointer: &Pointer,
        failed: &[NodeId],
    ) -> Result<(), AuditError> {
        if failed.is_empty() {
            return Ok(());
        }
        let Some(remote) = pointer.remote() else {
            return Ok(());
        };
        let to_remove: Vec<RemotePiece> = remote
            .pieces
            .iter()
            .filter(|piece| failed.contains(&piece.node_id))
            .cloned()
            .collect();

        self.metainfo
            .update_pieces(path, pointer.created_at, Vec::new(), to_remove)
            .await?;
        Ok(())
    }
}

enum ReverifyStatus {
    Skipped,
    Success,
    Offline,
    Failed,
    Contained(PendingAudit),
    Erred(String),
}

/// Pointer pieces that got no order limit and are not skipped.
fn offline_nodes(
    pieces: &[RemotePiece],
    limits: &[Option<AddressedOrderLimit>],
    skip: &HashSet<NodeId>,
) -> Vec<NodeId> {
    let with_limit: HashSet<NodeId> = limits
        .iter()
        .flatten()
        .map(|limit| limit.limit.storage_node_id)
        .collect();
    pieces
        .iter()
        .filter(|piece| !with_limit.contains(&piece.node_id) && !skip.contains(&piece.node_id))
        .map(|piece| piece.node_id)
        .collect()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use warden_core::PieceId;
    use warden_core::RedundancyScheme;
    use warden_core::RemoteSegment;
    use warden_core::Segment;

    use super::*;

    fn pointer(num_pieces: u16) -> Pointer {
        let pieces = (0..num_pieces)
            .map(|num| RemotePiece {
                piece_num: num,
                node_id: NodeId([(num + 1) as u8; 32]),
                hash: None,
            })
            .collect();
        Pointer {
            segment: Segment::Remote(RemoteSegment {
                root_piece_id: PieceId([9u8; 32]),
                redundancy: RedundancyScheme::new(2, 3, 4, 5, 16),
                pieces,
            }),
            created_at: chrono::Utc::now(),
            expires_at: None,
            segment_size: 256,
            metadata: Vec::new(),
        }
    }

    #[test]
    fn select_stripe_stays_in_range() {
        let path = SegmentPath::from("p/s0/b/obj");
        let pointer = pointer(5);
        // 256 bytes / (2 * 16) stripe = 8 stripes
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let stripe = select_stripe(&path, &pointer, &mut rng).unwrap();
            assert!(stripe.index < 8);
        }
    }

    #[test]
    fn select_stripe_rejects_inline() {
        let path = SegmentPath::from("p/s0/b/obj");
        let inline = Pointer {
            segment: Segment::Inline(b"x".to_vec()),
            created_at: chrono::Utc::now(),
            expires_at: None,
            segment_size: 1,
            metadata: Vec::new(),
        };
        assert!(select_stripe(&path, &inline, &mut rand::thread_rng()).is_none());
    }

    #[test]
    fn offline_nodes_excludes_skip_and_limited() {
        let pointer = pointer(5);
        let remote = pointer.remote().unwrap();

        // no limits at all; node 2 skipped
        let limits: Vec<Option<AddressedOrderLimit>> = vec![None; 5];
        let skip: HashSet<NodeId> = [NodeId([2u8; 32])].into_iter().collect();

        let offline = offline_nodes(&remote.pieces, &limits, &skip);
        assert_eq!(offline.len(), 4);
        assert!(!offline.contains(&NodeId([2u8; 32])));
    }

    #[test]
    fn share_deadline_has_floor() {
        let config = AuditConfig {
            min_bytes_per_second: 1024,
            min_download_timeout: Duration::from_secs(5),
        };
        // tiny share: the floor wins
        assert_eq!(config.share_deadline(16), Duration::from_secs(5));
        // large share: the throughput term wins
        assert_eq!(
            config.share_deadline(1024 * 1024),
            Duration::from_secs(1024)
        );
    }
}
