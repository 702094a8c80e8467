//! Pointer store.
//!
//! The pointer namespace is a flat ordered key space with one record per
//! segment. All mutation after the initial commit goes through
//! [`PointerStore::update_pieces`], which is compare-and-swap on the
//! pointer's `created_at`: a repair or audit racing against an uplink
//! overwrite loses silently instead of resurrecting stale placement.
//!
//! [`MemoryPointerStore`] keeps the encoded record bytes, not the decoded
//! struct, so the persisted binary format is exercised on every access.

use std::collections::BTreeMap;
use std::collections::HashSet;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use parking_lot::RwLock;
use snafu::Snafu;

use warden_core::Pointer;
use warden_core::PointerError;
use warden_core::RemotePiece;
use warden_core::SegmentPath;

/// Errors from the pointer namespace.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetainfoError {
    /// No pointer exists at the path.
    #[snafu(display("pointer not found: {path}"))]
    PointerNotFound { path: SegmentPath },

    /// The operation only applies to remote segments.
    #[snafu(display("segment {path} is inline"))]
    InlineSegment { path: SegmentPath },

    /// Adding the given pieces would violate pointer invariants.
    #[snafu(display("invalid piece update at {path}: {source}"))]
    InvalidUpdate {
        path: SegmentPath,
        source: PointerError,
    },

    /// The persisted record could not be encoded or decoded.
    #[snafu(display("pointer codec failure at {path}: {source}"))]
    Codec {
        path: SegmentPath,
        source: PointerError,
    },

    /// Backend failure.
    #[snafu(display("pointer store error: {message}"))]
    Store { message: String },
}

/// Result of a compare-and-swap piece update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The update was written; carries the new pointer.
    Applied(Pointer),
    /// The pointer was rewritten by an uplink since it was read; nothing
    /// was written.
    Superseded,
}

/// Persistence seam for the pointer namespace.
#[async_trait]
pub trait PointerStore: Send + Sync {
    async fn get(&self, path: &SegmentPath) -> Result<Pointer, MetainfoError>;

    /// Insert or overwrite a pointer (uplink commit). Overwrites replace
    /// the record wholesale, including `created_at`.
    async fn put(&self, path: &SegmentPath, pointer: Pointer) -> Result<(), MetainfoError>;

    async fn delete(&self, path: &SegmentPath) -> Result<(), MetainfoError>;

    /// Atomically remove `remove` from and add `add` to the pointer's
    /// piece set, guarded by `expected_created_at`.
    ///
    /// Pieces in `remove` are matched by piece number and node ID; entries
    /// that are no longer present are ignored. The pointer's `created_at`
    /// is not changed by this operation.
    async fn update_pieces(
        &self,
        path: &SegmentPath,
        expected_created_at: DateTime<Utc>,
        add: Vec<RemotePiece>,
        remove: Vec<RemotePiece>,
    ) -> Result<UpdateOutcome, MetainfoError>;

    /// Pointers strictly after `after` in key order, up to `limit`.
    async fn list_after(
        &self,
        after: Option<&SegmentPath>,
        limit: usize,
    ) -> Result<Vec<(SegmentPath, Pointer)>, MetainfoError>;
}

/// In-memory pointer store over encoded records.
#[derive(Default)]
pub struct MemoryPointerStore {
    records: RwLock<BTreeMap<SegmentPath, Vec<u8>>>,
}

impl MemoryPointerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn decode(path: &SegmentPath, bytes: &[u8]) -> Result<Pointer, MetainfoError> {
        Pointer::decode(bytes).map_err(|source| MetainfoError::Codec {
            path: path.clone(),
            source,
        })
    }

    fn encode(path: &SegmentPath, pointer: &Pointer) -> Result<Vec<u8>, MetainfoError> {
        pointer.encode().map_err(|source| MetainfoError::Codec {
            path: path.clone(),
            source,
        })
    }
}

#[async_trait]
impl PointerStore for MemoryPointerStore {
    async fn get(&self, path: &SegmentPath) -> Result<Pointer, MetainfoError> {
        let records = self.records.read();
        let bytes = records
            .get(path)
            .ok_or_else(|| MetainfoError::PointerNotFound { path: path.clone() })?;
        Self::decode(path, bytes)
    }

    async fn put(&self, path: &SegmentPath, pointer: Pointer) -> Result<(), MetainfoError> {
        if let Some(remote) = pointer.remote() {
            remote.validate().map_err(|source| MetainfoError::InvalidUpdate {
                path: path.clone(),
                source,
            })?;
        }
        let bytes = Self::encode(path, &pointer)?;
        self.records.write().insert(path.clone(), bytes);
        Ok(())
    }

    async fn delete(&self, path: &SegmentPath) -> Result<(), MetainfoError> {
        self.records
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| MetainfoError::PointerNotFound { path: path.clone() })
    }

    async fn update_pieces(
        &self,
        path: &SegmentPath,
        expected_created_at: DateTime<Utc>,
        add: Vec<RemotePiece>,
        remove: Vec<RemotePiece>,
    ) -> Result<UpdateOutcome, MetainfoError> {
        let mut records = self.records.write();
        let bytes = records
            .get(path)
            .ok_or_else(|| MetainfoError::PointerNotFound { path: path.clone() })?;
        let mut pointer = Self::decode(path, bytes)?;

        if pointer.created_at != expected_created_at {
            return Ok(UpdateOutcome::Superseded);
        }

        let remote = match pointer.remote_mut() {
            Some(remote) => remote,
            None => return Err(MetainfoError::InlineSegment { path: path.clone() }),
        };

        let removed: HashSet<(u16, _)> = remove
            .iter()
            .map(|piece| (piece.piece_num, piece.node_id))
            .collect();
        remote
            .pieces
            .retain(|piece| !removed.contains(&(piece.piece_num, piece.node_id)));
        remote.pieces.extend(add);
        remote.pieces.sort_by_key(|piece| piece.piece_num);

        remote.validate().map_err(|source| MetainfoError::InvalidUpdate {
            path: path.clone(),
            source,
        })?;

        let bytes = Self::encode(path, &pointer)?;
        records.insert(path.clone(), bytes);
        Ok(UpdateOutcome::Applied(pointer))
    }

    async fn list_after(
        &self,
        after: Option<&SegmentPath>,
        limit: usize,
    ) -> Result<Vec<(SegmentPath, Pointer)>, MetainfoError> {
        let records = self.records.read();
        let iter: Box<dyn Iterator<Item = (&SegmentPath, &Vec<u8>)> + '_> = match after {
            Some(after) => Box::new(
                records
                    .range(after.clone()..)
                    .filter(move |(path, _)| **path != *after),
            ),
            None => Box::new(records.iter()),
        };

        let mut page = Vec::with_capacity(limit.min(records.len()));
        for (path, bytes) in iter.take(limit) {
            page.push((path.clone(), Self::decode(path, bytes)?));
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use warden_core::NodeId;
    use warden_core::PieceId;
    use warden_core::RedundancyScheme;
    use warden_core::RemoteSegment;
    use warden_core::Segment;

    use super::*;

    fn piece(num: u16, node: u8) -> RemotePiece {
        RemotePiece {
            piece_num: num,
            node_id: NodeId([node; 32]),
            hash: None,
        }
    }

    fn remote_pointer(pieces: Vec<RemotePiece>) -> Pointer {
        Pointer {
            segment: Segment::Remote(RemoteSegment {
                root_piece_id: PieceId([9u8; 32]),
                redundancy: RedundancyScheme::new(2, 3, 4, 5, 256),
                pieces,
            }),
            created_at: Utc::now(),
            expires_at: None,
            segment_size: 1024,
            metadata: Vec::new(),
        }
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = MemoryPointerStore::new();
        let path = SegmentPath::from("p/s0/b/obj");
        let pointer = remote_pointer(vec![piece(0, 1), piece(1, 2)]);

        store.put(&path, pointer.clone()).await.unwrap();
        assert_eq!(store.get(&path).await.unwrap(), pointer);
    }

    #[tokio::test]
    async fn update_pieces_applies_and_preserves_created_at() {
        let store = MemoryPointerStore::new();
        let path = SegmentPath::from("p/s0/b/obj");
        let pointer = remote_pointer(vec![piece(0, 1), piece(1, 2), piece(2, 3)]);
        let created_at = pointer.created_at;
        store.put(&path, pointer).await.unwrap();

        let outcome = store
            .update_pieces(&path, created_at, vec![piece(3, 4)], vec![piece(1, 2)])
            .await
            .unwrap();

        let updated = match outcome {
            UpdateOutcome::Applied(pointer) => pointer,
            UpdateOutcome::Superseded => panic!("unexpected CAS miss"),
        };
        assert_eq!(updated.created_at, created_at);

        let remote = updated.remote().unwrap();
        let nums: Vec<u16> = remote.pieces.iter().map(|p| p.piece_num).collect();
        assert_eq!(nums, vec![0, 2, 3]);
    }

    #[tokio::test]
    async fn update_pieces_cas_miss_is_noop() {
        let store = MemoryPointerStore::new();
        let path = SegmentPath::from("p/s0/b/obj");
        let original = remote_pointer(vec![piece(0, 1)]);
        let stale_created_at = original.created_at;
        store.put(&path, original).await.unwrap();

        // uplink overwrite: fresh created_at
        let overwrite = remote_pointer(vec![piece(0, 7)]);
        store.put(&path, overwrite.clone()).await.unwrap();

        let outcome = store
            .update_pieces(&path, stale_created_at, vec![piece(1, 8)], Vec::new())
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Superseded);
        assert_eq!(store.get(&path).await.unwrap(), overwrite);
    }

    #[tokio::test]
    async fn update_pieces_rejects_duplicate_nodes() {
        let store = MemoryPointerStore::new();
        let path = SegmentPath::from("p/s0/b/obj");
        let pointer = remote_pointer(vec![piece(0, 1)]);
        let created_at = pointer.created_at;
        store.put(&path, pointer).await.unwrap();

        let result = store
            .update_pieces(&path, created_at, vec![piece(1, 1)], Vec::new())
            .await;
        assert!(matches!(result, Err(MetainfoError::InvalidUpdate { .. })));
    }

    #[tokio::test]
    async fn list_after_pages_in_order() {
        let store = MemoryPointerStore::new();
        for name in ["p/s0/b/a", "p/s0/b/b", "p/s0/b/c"] {
            store
                .put(&SegmentPath::from(name), remote_pointer(vec![piece(0, 1)]))
                .await
                .unwrap();
        }

        let first = store.list_after(None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].0.as_str(), "p/s0/b/a");

        let rest = store.list_after(Some(&first[1].0), 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].0.as_str(), "p/s0/b/c");
    }

    #[tokio::test]
    async fn delete_missing_pointer_errors() {
        let store = MemoryPointerStore::new();
        let result = store.delete(&SegmentPath::from("p/s0/b/missing")).await;
        assert!(matches!(result, Err(MetainfoError::PointerNotFound { .. })));
    }
}
