//! Erasure client.
//!
//! Uploads and downloads erasure-coded pieces in parallel against a
//! [`PieceStore`]. Uploads race: once enough pieces have landed, the
//! long tail is cancelled rather than awaited. The repair variant trades
//! the success-threshold trigger for a wall-clock deadline so a repair
//! collects as many pieces as the window allows. Downloads with forced
//! error detection pull one share more than strictly needed and run the
//! scheme's correction to catch silent tampering.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use snafu::Snafu;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use warden_core::NodeId;
use warden_core::PieceHash;
use warden_core::RedundancyScheme;
use warden_orders::AddressedOrderLimit;
use warden_orders::PiecePrivateKey;

use crate::scheme::Scheme;
use crate::scheme::SchemeError;
use crate::store::PieceStore;
use crate::store::PieceStoreError;

/// Errors from erasure client operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EcError {
    /// The limit slice is not aligned with the scheme.
    #[snafu(display("got {got} order limits for a scheme of {expected} pieces"))]
    WrongLimitCount { got: usize, expected: usize },

    /// Too few non-nil limits to possibly reach the thresholds.
    #[snafu(display(
        "number of non-nil limits ({non_nil}) is at or below the repair threshold ({repair})"
    ))]
    NotEnoughLimits { non_nil: usize, repair: usize },

    /// Two limits point at the same node.
    #[snafu(display("duplicate nodes are not allowed in one limit set"))]
    DuplicateNodes,

    /// The upload finished below its success threshold.
    #[snafu(display(
        "successful uploads ({successes}) did not reach the success threshold ({optimal})"
    ))]
    UploadThreshold { successes: usize, optimal: usize },

    /// Every repair upload failed.
    #[snafu(display("repair upload failed on all nodes"))]
    AllUploadsFailed,

    /// Too few pieces could be downloaded.
    #[snafu(display("not enough pieces downloaded: got {got}, needed {needed}"))]
    NotEnoughPieces { got: usize, needed: usize },

    /// Erasure coding failed (including undetermined corruption).
    #[snafu(display("erasure coding failed: {source}"))]
    Erasure { source: SchemeError },

    /// Every delete failed.
    #[snafu(display("delete failed on all nodes"))]
    AllDeletesFailed,
}

/// One successfully stored piece.
#[derive(Debug, Clone)]
pub struct SuccessfulPut {
    pub node_id: NodeId,
    pub hash: PieceHash,
}

/// Upload outcome, aligned by piece number.
///
/// Slots for cancelled or failed uploads are `None`.
#[derive(Debug, Clone, Default)]
pub struct PutResult {
    pub pieces: Vec<Option<SuccessfulPut>>,
}

impl PutResult {
    pub fn success_count(&self) -> usize {
        self.pieces.iter().flatten().count()
    }
}

/// Parallel erasure-coded piece client.
pub struct EcClient {
    store: Arc<dyn PieceStore>,
    force_error_detection: bool,
}

impl EcClient {
    pub fn new(store: Arc<dyn PieceStore>) -> Self {
        EcClient {
            store,
            force_error_detection: false,
        }
    }

    /// Download one extra piece and run erasure correction on every read.
    pub fn with_force_error_detection(mut self, force: bool) -> Self {
        self.force_error_detection = force;
        self
    }

    /// Encode `data` and upload pieces in parallel, cancelling the long
    /// tail once the success threshold is reached.
    pub async fn put(
        &self,
        limits: &[Option<AddressedOrderLimit>],
        piece_key: &PiecePrivateKey,
        redundancy: &RedundancyScheme,
        data: &[u8],
    ) -> Result<PutResult, EcError> {
        let optimal = usize::from(redundancy.optimal);
        let repair = usize::from(redundancy.repair);
        check_limits(limits, redundancy)?;

        let non_nil = limits.iter().flatten().count();
        if non_nil <= repair && non_nil < optimal {
            return Err(EcError::NotEnoughLimits { non_nil, repair });
        }

        let (mut rx, spawned, cancel) = self.spawn_uploads(limits, piece_key, redundancy, data)?;

        let mut result = PutResult {
            pieces: vec![None; limits.len()],
        };
        let mut received = 0;
        while received < spawned {
            let Some((piece_num, outcome)) = rx.recv().await else {
                break;
            };
            received += 1;
            self.record_upload(&mut result, limits, piece_num, outcome);

            if result.success_count() >= optimal && !cancel.is_cancelled() {
                info!(
                    optimal,
                    "success threshold reached, cancelling remaining uploads"
                );
                cancel.cancel();
            }
        }

        let successes = result.success_count();
        if successes < optimal {
            return Err(EcError::UploadThreshold { successes, optimal });
        }
        Ok(result)
    }

    /// Upload repaired pieces until the wall-clock deadline.
    ///
    /// Unlike [`EcClient::put`], nothing is cancelled early on success:
    /// the point of the window is to land as many pieces as it allows.
    pub async fn put_repair(
        &self,
        limits: &[Option<AddressedOrderLimit>],
        piece_key: &PiecePrivateKey,
        redundancy: &RedundancyScheme,
        data: &[u8],
        timeout: Duration,
    ) -> Result<PutResult, EcError> {
        check_limits(limits, redundancy)?;

        let (mut rx, spawned, cancel) = self.spawn_uploads(limits, piece_key, redundancy, data)?;
        debug!(
            targets = spawned,
            timeout_ms = timeout.as_millis() as u64,
            "repair upload started"
        );

        let mut result = PutResult {
            pieces: vec![None; limits.len()],
        };
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut received = 0;
        while received < spawned {
            tokio::select! {
                _ = &mut deadline, if !cancel.is_cancelled() => {
                    info!(
                        successes = result.success_count(),
                        "repair window expired, cancelling the long tail"
                    );
                    cancel.cancel();
                }
                outcome = rx.recv() => {
                    let Some((piece_num, outcome)) = outcome else { break };
                    received += 1;
                    self.record_upload(&mut result, limits, piece_num, outcome);
                }
            }
        }

        if result.success_count() == 0 {
            return Err(EcError::AllUploadsFailed);
        }
        Ok(result)
    }

    /// Download and decode the segment.
    ///
    /// With error detection forced, `required + 1` pieces are pulled and
    /// the erasure correction must agree before any bytes are returned.
    pub async fn get(
        &self,
        limits: &[Option<AddressedOrderLimit>],
        piece_key: &PiecePrivateKey,
        redundancy: &RedundancyScheme,
        segment_size: u64,
    ) -> Result<Vec<u8>, EcError> {
        let required = usize::from(redundancy.required);
        if limits.len() != usize::from(redundancy.total) {
            return Err(EcError::WrongLimitCount {
                got: limits.len(),
                expected: usize::from(redundancy.total),
            });
        }

        let needed = if self.force_error_detection {
            required + 1
        } else {
            required
        };
        let non_nil = limits.iter().flatten().count();
        if non_nil < needed {
            return Err(EcError::NotEnoughPieces {
                got: non_nil,
                needed,
            });
        }

        let piece_size = redundancy.piece_size(segment_size);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(limits.len().max(1));
        let mut spawned = 0;
        for (piece_num, limit) in limits.iter().enumerate() {
            let Some(limit) = limit else { continue };
            spawned += 1;
            let store = Arc::clone(&self.store);
            let limit = limit.clone();
            let key = piece_key.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => Err(PieceStoreError::Cancelled),
                    result = store.download(&limit, &key, 0, piece_size) => result,
                };
                let _ = tx.send((piece_num as u16, outcome)).await;
            });
        }
        drop(tx);

        let mut shares: Vec<(u16, Vec<u8>)> = Vec::with_capacity(needed);
        let mut received = 0;
        while received < spawned {
            let Some((piece_num, outcome)) = rx.recv().await else {
                break;
            };
            received += 1;
            match outcome {
                Ok(bytes) => {
                    shares.push((piece_num, bytes));
                    if shares.len() >= needed && !cancel.is_cancelled() {
                        cancel.cancel();
                    }
                }
                Err(PieceStoreError::Cancelled) => {}
                Err(error) => {
                    debug!(piece_num, %error, "piece download failed");
                }
            }
        }

        if shares.len() < needed {
            return Err(EcError::NotEnoughPieces {
                got: shares.len(),
                needed,
            });
        }

        let scheme = Scheme::new(*redundancy).map_err(|source| EcError::Erasure { source })?;
        if self.force_error_detection {
            let correction = scheme
                .correct(&shares)
                .map_err(|source| EcError::Erasure { source })?;
            if !correction.bad_piece_nums.is_empty() {
                warn!(
                    bad = ?correction.bad_piece_nums,
                    "erasure correction discarded tampered pieces"
                );
            }
            let mut data = correction.data(redundancy.required);
            data.truncate(segment_size as usize);
            Ok(data)
        } else {
            let mut shards: Vec<Option<Vec<u8>>> = vec![None; usize::from(redundancy.total)];
            for (piece_num, bytes) in shares {
                shards[usize::from(piece_num)] = Some(bytes);
            }
            scheme
                .decode(shards, segment_size)
                .map_err(|source| EcError::Erasure { source })
        }
    }

    /// Delete pieces on a best-effort basis.
    ///
    /// Individual failures are logged and ignored; only a complete failure
    /// is an error.
    pub async fn delete(
        &self,
        limits: &[Option<AddressedOrderLimit>],
        piece_key: &PiecePrivateKey,
    ) -> Result<(), EcError> {
        let targets: Vec<&AddressedOrderLimit> = limits.iter().flatten().collect();
        if targets.is_empty() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel(targets.len());
        for limit in targets.iter() {
            let store = Arc::clone(&self.store);
            let limit = (*limit).clone();
            let key = piece_key.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = store.delete(&limit, &key).await;
                if let Err(error) = &result {
                    warn!(node_id = %limit.limit.storage_node_id, %error, "piece delete failed");
                }
                let _ = tx.send(result.is_ok()).await;
            });
        }
        drop(tx);

        let mut any_ok = false;
        while let Some(ok) = rx.recv().await {
            any_ok |= ok;
        }
        if any_ok {
            Ok(())
        } else {
            Err(EcError::AllDeletesFailed)
        }
    }

    #[allow(clippy::type_complexity)]
    fn spawn_uploads(
        &self,
        limits: &[Option<AddressedOrderLimit>],
        piece_key: &PiecePrivateKey,
        redundancy: &RedundancyScheme,
        data: &[u8],
    ) -> Result<
        (
            mpsc::Receiver<(u16, Result<PieceHash, PieceStoreError>)>,
            usize,
            CancellationToken,
        ),
        EcError,
    > {
        let scheme = Scheme::new(*redundancy).map_err(|source| EcError::Erasure { source })?;
        let mut pieces = scheme
            .encode(data)
            .map_err(|source| EcError::Erasure { source })?;

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(limits.len().max(1));
        let mut spawned = 0;
        for (piece_num, limit) in limits.iter().enumerate() {
            let Some(limit) = limit else { continue };
            spawned += 1;
            let store = Arc::clone(&self.store);
            let limit = limit.clone();
            let key = piece_key.clone();
            let piece = std::mem::take(&mut pieces[piece_num]);
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => Err(PieceStoreError::Cancelled),
                    result = store.upload(&limit, &key, &piece) => result,
                };
                let _ = tx.send((piece_num as u16, outcome)).await;
            });
        }

        Ok((rx, spawned, cancel))
    }

    fn record_upload(
        &self,
        result: &mut PutResult,
        limits: &[Option<AddressedOrderLimit>],
        piece_num: u16,
        outcome: Result<PieceHash, PieceStoreError>,
    ) {
        let slot = usize::from(piece_num);
        let Some(limit) = limits.get(slot).and_then(Option::as_ref) else {
            return;
        };
        match outcome {
            Ok(hash) => {
                result.pieces[slot] = Some(SuccessfulPut {
                    node_id: limit.limit.storage_node_id,
                    hash,
                });
            }
            Err(PieceStoreError::Cancelled) => {
                debug!(piece_num, node_id = %limit.limit.storage_node_id,
                    "upload cut from the long tail");
            }
            Err(error) => {
                debug!(piece_num, node_id = %limit.limit.storage_node_id, %error,
                    "piece upload failed");
            }
        }
    }
}

fn check_limits(
    limits: &[Option<AddressedOrderLimit>],
    redundancy: &RedundancyScheme,
) -> Result<(), EcError> {
    if limits.len() != usize::from(redundancy.total) {
        return Err(EcError::WrongLimitCount {
            got: limits.len(),
            expected: usize::from(redundancy.total),
        });
    }

    let mut nodes = HashSet::new();
    for limit in limits.iter().flatten() {
        if !nodes.insert(limit.limit.storage_node_id) {
            return Err(EcError::DuplicateNodes);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;

    use warden_core::PieceId;
    use warden_core::SerialNumber;
    use warden_orders::OrderLimit;
    use warden_orders::PieceAction;

    use crate::scheme::Scheme;

    use super::*;

    /// Piece store with scripted per-node behavior; no order checks.
    #[derive(Default)]
    struct ScriptedStore {
        delays: HashMap<NodeId, Duration>,
        failing: std::collections::HashSet<NodeId>,
        stored: Mutex<HashMap<PieceId, Vec<u8>>>,
    }

    impl ScriptedStore {
        fn seed(&self, piece_id: PieceId, data: Vec<u8>) {
            self.stored.lock().insert(piece_id, data);
        }
    }

    #[async_trait]
    impl PieceStore for ScriptedStore {
        async fn upload(
            &self,
            limit: &AddressedOrderLimit,
            piece_key: &PiecePrivateKey,
            data: &[u8],
        ) -> Result<PieceHash, PieceStoreError> {
            let node = limit.limit.storage_node_id;
            if let Some(delay) = self.delays.get(&node) {
                tokio::time::sleep(*delay).await;
            }
            if self.failing.contains(&node) {
                return Err(PieceStoreError::Transfer {
                    message: "scripted failure".to_string(),
                });
            }
            self.stored.lock().insert(limit.limit.piece_id, data.to_vec());
            piece_key
                .sign_piece_hash(limit.limit.piece_id, [0u8; 32])
                .map_err(|e| PieceStoreError::Transfer {
                    message: e.to_string(),
                })
        }

        async fn download(
            &self,
            limit: &AddressedOrderLimit,
            _piece_key: &PiecePrivateKey,
            offset: u64,
            length: u64,
        ) -> Result<Vec<u8>, PieceStoreError> {
            let node = limit.limit.storage_node_id;
            if let Some(delay) = self.delays.get(&node) {
                tokio::time::sleep(*delay).await;
            }
            if self.failing.contains(&node) {
                return Err(PieceStoreError::Transfer {
                    message: "scripted failure".to_string(),
                });
            }
            let stored = self.stored.lock();
            let data = stored
                .get(&limit.limit.piece_id)
                .ok_or(PieceStoreError::NotFound {
                    piece_id: limit.limit.piece_id,
                })?;
            Ok(data[offset as usize..(offset + length) as usize].to_vec())
        }

        async fn delete(
            &self,
            limit: &AddressedOrderLimit,
            _piece_key: &PiecePrivateKey,
        ) -> Result<(), PieceStoreError> {
            let node = limit.limit.storage_node_id;
            if self.failing.contains(&node) {
                return Err(PieceStoreError::Transfer {
                    message: "scripted failure".to_string(),
                });
            }
            self.stored.lock().remove(&limit.limit.piece_id);
            Ok(())
        }
    }

    const ROOT: PieceId = PieceId([9u8; 32]);

    fn scheme() -> RedundancyScheme {
        RedundancyScheme::new(2, 3, 4, 5, 8)
    }

    fn limit_for(node_seed: u8, piece_num: u16) -> AddressedOrderLimit {
        let node_id = NodeId([node_seed; 32]);
        AddressedOrderLimit {
            limit: OrderLimit {
                serial: SerialNumber([piece_num as u8; 16]),
                satellite_id: NodeId([0xEE; 32]),
                storage_node_id: node_id,
                piece_id: ROOT.derive(node_id, piece_num),
                uplink_public_key: PiecePrivateKey::generate().1,
                action: PieceAction::PutRepair,
                limit: 1 << 20,
                piece_expiration: None,
                order_expiration: Utc::now() + chrono::Duration::hours(1),
                order_creation: Utc::now(),
                satellite_signature: vec![1],
            },
            node_address: format!("node-{node_seed}:7777"),
        }
    }

    fn limits(seeds: [u8; 5]) -> Vec<Option<AddressedOrderLimit>> {
        seeds
            .iter()
            .enumerate()
            .map(|(num, &seed)| Some(limit_for(seed, num as u16)))
            .collect()
    }

    fn data() -> Vec<u8> {
        (0u8..64).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn put_cancels_long_tail_at_success_threshold() {
        let mut store = ScriptedStore::default();
        // node 5 would take forever; the put must not wait for it
        store.delays.insert(NodeId([5u8; 32]), Duration::from_secs(3600));
        let client = EcClient::new(Arc::new(store));
        let (key, _) = PiecePrivateKey::generate();

        let result = client
            .put(&limits([1, 2, 3, 4, 5]), &key, &scheme(), &data())
            .await
            .unwrap();

        assert_eq!(result.success_count(), 4);
        assert!(result.pieces[4].is_none(), "slow node was cut from the tail");
    }

    #[tokio::test]
    async fn put_fails_below_success_threshold() {
        let mut store = ScriptedStore::default();
        for seed in [3u8, 4, 5] {
            store.failing.insert(NodeId([seed; 32]));
        }
        let client = EcClient::new(Arc::new(store));
        let (key, _) = PiecePrivateKey::generate();

        let result = client
            .put(&limits([1, 2, 3, 4, 5]), &key, &scheme(), &data())
            .await;
        assert!(matches!(
            result,
            Err(EcError::UploadThreshold { successes: 2, optimal: 4 })
        ));
    }

    #[tokio::test]
    async fn put_rejects_duplicate_nodes() {
        let client = EcClient::new(Arc::new(ScriptedStore::default()));
        let (key, _) = PiecePrivateKey::generate();

        let result = client
            .put(&limits([1, 2, 3, 4, 4]), &key, &scheme(), &data())
            .await;
        assert!(matches!(result, Err(EcError::DuplicateNodes)));
    }

    #[tokio::test(start_paused = true)]
    async fn put_repair_collects_until_deadline() {
        let mut store = ScriptedStore::default();
        store.delays.insert(NodeId([4u8; 32]), Duration::from_secs(30));
        store.delays.insert(NodeId([5u8; 32]), Duration::from_secs(30));
        let client = EcClient::new(Arc::new(store));
        let (key, _) = PiecePrivateKey::generate();

        let result = client
            .put_repair(
                &limits([1, 2, 3, 4, 5]),
                &key,
                &scheme(),
                &data(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        // the two slow nodes were cancelled at the deadline
        assert_eq!(result.success_count(), 3);
        assert!(result.pieces[3].is_none());
        assert!(result.pieces[4].is_none());
    }

    #[tokio::test]
    async fn put_repair_fails_only_when_nothing_lands() {
        let mut store = ScriptedStore::default();
        for seed in 1u8..=5 {
            store.failing.insert(NodeId([seed; 32]));
        }
        let client = EcClient::new(Arc::new(store));
        let (key, _) = PiecePrivateKey::generate();

        let result = client
            .put_repair(
                &limits([1, 2, 3, 4, 5]),
                &key,
                &scheme(),
                &data(),
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(result, Err(EcError::AllUploadsFailed)));
    }

    #[tokio::test]
    async fn get_roundtrips_after_put() {
        let client = EcClient::new(Arc::new(ScriptedStore::default()))
            .with_force_error_detection(true);
        let (key, _) = PiecePrivateKey::generate();
        let limits = limits([1, 2, 3, 4, 5]);

        client.put(&limits, &key, &scheme(), &data()).await.unwrap();
        let read = client
            .get(&limits, &key, &scheme(), data().len() as u64)
            .await
            .unwrap();
        assert_eq!(read, data());
    }

    #[tokio::test]
    async fn forced_error_detection_needs_one_spare_piece() {
        let store = ScriptedStore::default();
        let scheme_cfg = scheme();
        // seed only the two data pieces
        let full = Scheme::new(scheme_cfg).unwrap().encode(&data()).unwrap();
        for (num, piece) in full.iter().enumerate().take(2) {
            let node_id = NodeId([(num + 1) as u8; 32]);
            store.seed(ROOT.derive(node_id, num as u16), piece.clone());
        }
        let client = EcClient::new(Arc::new(store)).with_force_error_detection(true);
        let (key, _) = PiecePrivateKey::generate();

        let mut two_limits = limits([1, 2, 3, 4, 5]);
        two_limits[2] = None;
        two_limits[3] = None;
        two_limits[4] = None;

        let result = client
            .get(&two_limits, &key, &scheme_cfg, data().len() as u64)
            .await;
        assert!(matches!(
            result,
            Err(EcError::NotEnoughPieces { got: 2, needed: 3 })
        ));
    }

    #[tokio::test]
    async fn delete_tolerates_partial_failure() {
        let mut store = ScriptedStore::default();
        store.failing.insert(NodeId([1u8; 32]));
        let client = EcClient::new(Arc::new(store));
        let (key, _) = PiecePrivateKey::generate();

        client.delete(&limits([1, 2, 3, 4, 5]), &key).await.unwrap();
    }

    #[tokio::test]
    async fn delete_fails_when_all_fail() {
        let mut store = ScriptedStore::default();
        for seed in 1u8..=5 {
            store.failing.insert(NodeId([seed; 32]));
        }
        let client = EcClient::new(Arc::new(store));
        let (key, _) = PiecePrivateKey::generate();

        let result = client.delete(&limits([1, 2, 3, 4, 5]), &key).await;
        assert!(matches!(result, Err(EcError::AllDeletesFailed)));
    }
}
