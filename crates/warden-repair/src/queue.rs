//! Repair queue.
//!
//! A durable priority queue of injured segments. Priority is fewest
//! healthy pieces first (the closest to loss repairs first), FIFO on ties.
//! `select` hands out an exclusive lease so the same path is never
//! repaired twice concurrently; a worker that dies simply lets its lease
//! expire and the item becomes selectable again. Delivery is therefore
//! at-least-once, and repair itself is idempotent.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;

use warden_core::SegmentPath;

use crate::error::RepairError;

/// One injured segment awaiting repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjuredSegment {
    pub path: SegmentPath,
    /// Piece numbers on unreliable nodes at check time.
    pub lost_piece_nums: Vec<u16>,
    /// Healthy piece count at check time; the queue's priority key.
    pub num_healthy: usize,
    pub inserted_at: DateTime<Utc>,
}

/// Priority queue of injured segments with lease semantics.
#[async_trait]
pub trait RepairQueue: Send + Sync {
    /// Insert or refresh an item. Idempotent by path: re-inserting keeps
    /// the worst (lowest) observed health, the newest timestamp, and the
    /// newest lost-piece set.
    async fn insert(&self, segment: InjuredSegment) -> Result<(), RepairError>;

    /// Lease the highest-priority item, if any is available.
    async fn select(&self) -> Result<Option<InjuredSegment>, RepairError>;

    /// Remove a completed item and its lease.
    async fn remove(&self, path: &SegmentPath) -> Result<(), RepairError>;

    /// Return a leased item for redelivery.
    async fn release(&self, path: &SegmentPath) -> Result<(), RepairError>;

    async fn count(&self) -> Result<usize, RepairError>;
}

#[derive(Default)]
struct State {
    items: HashMap<SegmentPath, InjuredSegment>,
    leases: HashMap<SegmentPath, Instant>,
}

/// In-memory repair queue.
pub struct MemoryRepairQueue {
    lease_timeout: Duration,
    state: Mutex<State>,
}

impl MemoryRepairQueue {
    pub fn new(lease_timeout: Duration) -> Self {
        MemoryRepairQueue {
            lease_timeout,
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for MemoryRepairQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl RepairQueue for MemoryRepairQueue {
    async fn insert(&self, segment: InjuredSegment) -> Result<(), RepairError> {
        let mut state = self.state.lock();
        match state.items.get_mut(&segment.path) {
            Some(existing) => {
                existing.num_healthy = existing.num_healthy.min(segment.num_healthy);
                existing.inserted_at = existing.inserted_at.max(segment.inserted_at);
                existing.lost_piece_nums = segment.lost_piece_nums;
            }
            None => {
                state.items.insert(segment.path.clone(), segment);
            }
        }
        Ok(())
    }

    async fn select(&self) -> Result<Option<InjuredSegment>, RepairError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let timeout = self.lease_timeout;

        // expired leases fall away implicitly
        let State { items, leases } = &mut *state;
        let best = items
            .values()
            .filter(|item| {
                leases
                    .get(&item.path)
                    .is_none_or(|leased_at| now.duration_since(*leased_at) >= timeout)
            })
            .min_by(|a, b| {
                a.num_healthy
                    .cmp(&b.num_healthy)
                    .then(a.inserted_at.cmp(&b.inserted_at))
                    .then(a.path.cmp(&b.path))
            })
            .cloned();

        if let Some(item) = &best {
            leases.insert(item.path.clone(), now);
        }
        Ok(best)
    }

    async fn remove(&self, path: &SegmentPath) -> Result<(), RepairError> {
        let mut state = self.state.lock();
        state.items.remove(path);
        state.leases.remove(path);
        Ok(())
    }

    async fn release(&self, path: &SegmentPath) -> Result<(), RepairError> {
        self.state.lock().leases.remove(path);
        Ok(())
    }

    async fn count(&self) -> Result<usize, RepairError> {
        Ok(self.state.lock().items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(path: &str, healthy: usize, at: DateTime<Utc>) -> InjuredSegment {
        InjuredSegment {
            path: SegmentPath::from(path),
            lost_piece_nums: vec![0],
            num_healthy: healthy,
            inserted_at: at,
        }
    }

    #[tokio::test]
    async fn select_orders_by_health_then_fifo() {
        let queue = MemoryRepairQueue::default();
        let base = Utc::now();

        queue.insert(segment("p/s0/b/late", 3, base + chrono::Duration::seconds(2))).await.unwrap();
        queue.insert(segment("p/s0/b/worst", 2, base + chrono::Duration::seconds(3))).await.unwrap();
        queue.insert(segment("p/s0/b/early", 3, base)).await.unwrap();

        let first = queue.select().await.unwrap().unwrap();
        assert_eq!(first.path.as_str(), "p/s0/b/worst");
        let second = queue.select().await.unwrap().unwrap();
        assert_eq!(second.path.as_str(), "p/s0/b/early");
        let third = queue.select().await.unwrap().unwrap();
        assert_eq!(third.path.as_str(), "p/s0/b/late");
        assert!(queue.select().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_is_idempotent_by_path() {
        let queue = MemoryRepairQueue::default();
        let base = Utc::now();

        queue.insert(segment("p/s0/b/obj", 3, base)).await.unwrap();
        queue
            .insert(segment("p/s0/b/obj", 2, base + chrono::Duration::seconds(1)))
            .await
            .unwrap();

        assert_eq!(queue.count().await.unwrap(), 1);
        let item = queue.select().await.unwrap().unwrap();
        assert_eq!(item.num_healthy, 2);
        assert_eq!(item.inserted_at, base + chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn leased_item_is_not_reselected() {
        let queue = MemoryRepairQueue::default();
        queue.insert(segment("p/s0/b/obj", 2, Utc::now())).await.unwrap();

        assert!(queue.select().await.unwrap().is_some());
        assert!(queue.select().await.unwrap().is_none());

        // release puts it back into view
        queue.release(&SegmentPath::from("p/s0/b/obj")).await.unwrap();
        assert!(queue.select().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_is_reselected() {
        let queue = MemoryRepairQueue::new(Duration::from_millis(10));
        queue.insert(segment("p/s0/b/obj", 2, Utc::now())).await.unwrap();

        assert!(queue.select().await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.select().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn remove_clears_item_and_lease() {
        let queue = MemoryRepairQueue::default();
        let path = SegmentPath::from("p/s0/b/obj");
        queue.insert(segment("p/s0/b/obj", 2, Utc::now())).await.unwrap();

        queue.select().await.unwrap().unwrap();
        queue.remove(&path).await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 0);
        assert!(queue.select().await.unwrap().is_none());
    }
}
