//! Containment.
//!
//! A node that produced inconclusive audit evidence (a timeout after a
//! successful dial, an unclassifiable error) is *contained*: a pending
//! audit pins the exact share it owes, and future audits skip the node
//! until reverification settles the question. At most one pending audit
//! exists per node, and the first one wins: the node must answer for the
//! share it originally stalled on.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use warden_core::NodeId;
use warden_core::PieceId;
use warden_core::SegmentPath;

use crate::error::AuditError;

/// The share a contained node must produce on reverification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAudit {
    pub node_id: NodeId,
    /// Root piece ID of the audited segment.
    pub piece_id: PieceId,
    pub stripe_index: u64,
    pub share_size: u32,
    /// SHA-256 of the expected share content.
    pub expected_share_hash: [u8; 32],
    pub path: SegmentPath,
}

/// Store of pending audits, keyed by node.
#[async_trait]
pub trait Containment: Send + Sync {
    async fn get(&self, node_id: NodeId) -> Result<Option<PendingAudit>, AuditError>;

    /// Record a pending audit. Idempotent: if the node is already
    /// contained, the existing record is kept unchanged.
    async fn put(&self, pending: PendingAudit) -> Result<(), AuditError>;

    /// Clear a node's pending audit. Returns whether one existed.
    async fn delete(&self, node_id: NodeId) -> Result<bool, AuditError>;

    async fn count(&self) -> Result<usize, AuditError>;
}

/// In-memory containment store.
#[derive(Default)]
pub struct MemoryContainment {
    pending: Mutex<HashMap<NodeId, PendingAudit>>,
}

impl MemoryContainment {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Containment for MemoryContainment {
    async fn get(&self, node_id: NodeId) -> Result<Option<PendingAudit>, AuditError> {
        Ok(self.pending.lock().get(&node_id).cloned())
    }

    async fn put(&self, pending: PendingAudit) -> Result<(), AuditError> {
        self.pending
            .lock()
            .entry(pending.node_id)
            .or_insert(pending);
        Ok(())
    }

    async fn delete(&self, node_id: NodeId) -> Result<bool, AuditError> {
        Ok(self.pending.lock().remove(&node_id).is_some())
    }

    async fn count(&self) -> Result<usize, AuditError> {
        Ok(self.pending.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(node: u8, hash: u8) -> PendingAudit {
        PendingAudit {
            node_id: NodeId([node; 32]),
            piece_id: PieceId([9u8; 32]),
            stripe_index: 3,
            share_size: 256,
            expected_share_hash: [hash; 32],
            path: SegmentPath::from("p/s0/b/obj"),
        }
    }

    #[tokio::test]
    async fn put_is_first_writer_wins() {
        let containment = MemoryContainment::new();
        containment.put(pending(1, 0xAA)).await.unwrap();
        containment.put(pending(1, 0xBB)).await.unwrap();

        let got = containment.get(NodeId([1u8; 32])).await.unwrap().unwrap();
        assert_eq!(got.expected_share_hash, [0xAA; 32]);
        assert_eq!(containment.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let containment = MemoryContainment::new();
        containment.put(pending(1, 0xAA)).await.unwrap();

        assert!(containment.delete(NodeId([1u8; 32])).await.unwrap());
        assert!(!containment.delete(NodeId([1u8; 32])).await.unwrap());
        assert_eq!(containment.get(NodeId([1u8; 32])).await.unwrap(), None);
    }
}
