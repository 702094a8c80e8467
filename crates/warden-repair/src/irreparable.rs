//! Irreparable store.
//!
//! Segments that dropped at or below the reconstruction floor are parked
//! here with a snapshot of their pointer. A second loop re-examines them
//! in pages: nodes coming back online can lift a segment back to injured,
//! at which point it is promoted to the repair queue and removed.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use parking_lot::RwLock;

use warden_core::Pointer;
use warden_core::SegmentPath;

use crate::error::RepairError;

/// Record of a segment considered unrepairable.
#[derive(Debug, Clone, PartialEq)]
pub struct IrreparableSegment {
    pub path: SegmentPath,
    /// Pointer snapshot taken when the segment was classified.
    pub pointer: Pointer,
    pub lost_pieces: usize,
    pub last_attempt_at: DateTime<Utc>,
    pub attempts: u64,
}

/// Store of irreparable segment records, keyed by path.
#[async_trait]
pub trait IrreparableStore: Send + Sync {
    /// Insert the record, or refresh an existing one and bump its attempt
    /// counter.
    async fn upsert(&self, segment: IrreparableSegment) -> Result<(), RepairError>;

    async fn get(&self, path: &SegmentPath) -> Result<Option<IrreparableSegment>, RepairError>;

    /// Records strictly after `after` in path order, up to `limit`.
    async fn list_after(
        &self,
        after: Option<&SegmentPath>,
        limit: usize,
    ) -> Result<Vec<IrreparableSegment>, RepairError>;

    /// Delete a record; deleting an absent record is not an error.
    async fn delete(&self, path: &SegmentPath) -> Result<(), RepairError>;

    async fn count(&self) -> Result<usize, RepairError>;
}

/// In-memory irreparable store.
#[derive(Default)]
pub struct MemoryIrreparableStore {
    records: RwLock<BTreeMap<SegmentPath, IrreparableSegment>>,
}

impl MemoryIrreparableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IrreparableStore for MemoryIrreparableStore {
    async fn upsert(&self, segment: IrreparableSegment) -> Result<(), RepairError> {
        let mut records = self.records.write();
        match records.get_mut(&segment.path) {
            Some(existing) => {
                existing.attempts += 1;
                existing.last_attempt_at = segment.last_attempt_at;
                existing.lost_pieces = segment.lost_pieces;
                existing.pointer = segment.pointer;
            }
            None => {
                records.insert(segment.path.clone(), segment);
            }
        }
        Ok(())
    }

    async fn get(&self, path: &SegmentPath) -> Result<Option<IrreparableSegment>, RepairError> {
        Ok(self.records.read().get(path).cloned())
    }

    async fn list_after(
        &self,
        after: Option<&SegmentPath>,
        limit: usize,
    ) -> Result<Vec<IrreparableSegment>, RepairError> {
        let records = self.records.read();
        let page = match after {
            Some(after) => records
                .range(after.clone()..)
                .filter(|(path, _)| **path != *after)
                .take(limit)
                .map(|(_, record)| record.clone())
                .collect(),
            None => records.values().take(limit).cloned().collect(),
        };
        Ok(page)
    }

    async fn delete(&self, path: &SegmentPath) -> Result<(), RepairError> {
        self.records.write().remove(path);
        Ok(())
    }

    async fn count(&self) -> Result<usize, RepairError> {
        Ok(self.records.read().len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use warden_core::Segment;

    use super::*;

    fn record(path: &str) -> IrreparableSegment {
        IrreparableSegment {
            path: SegmentPath::from(path),
            pointer: Pointer {
                segment: Segment::Inline(Vec::new()),
                created_at: Utc::now(),
                expires_at: None,
                segment_size: 0,
                metadata: Vec::new(),
            },
            lost_pieces: 3,
            last_attempt_at: Utc::now(),
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn upsert_increments_attempts() {
        let store = MemoryIrreparableStore::new();
        store.upsert(record("p/s0/b/obj")).await.unwrap();
        store.upsert(record("p/s0/b/obj")).await.unwrap();
        store.upsert(record("p/s0/b/obj")).await.unwrap();

        let got = store.get(&SegmentPath::from("p/s0/b/obj")).await.unwrap().unwrap();
        assert_eq!(got.attempts, 3);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pagination_walks_all_records() {
        let store = MemoryIrreparableStore::new();
        for name in ["p/s0/b/a", "p/s0/b/b", "p/s0/b/c", "p/s0/b/d"] {
            store.upsert(record(name)).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut last: Option<SegmentPath> = None;
        loop {
            let page = store.list_after(last.as_ref(), 3).await.unwrap();
            if page.is_empty() {
                break;
            }
            last = Some(page.last().unwrap().path.clone());
            seen.extend(page.into_iter().map(|r| r.path.as_str().to_string()));
        }
        assert_eq!(seen, vec!["p/s0/b/a", "p/s0/b/b", "p/s0/b/c", "p/s0/b/d"]);
    }

    #[tokio::test]
    async fn delete_absent_is_ok() {
        let store = MemoryIrreparableStore::new();
        store.delete(&SegmentPath::from("p/s0/b/none")).await.unwrap();
    }
}
