//! Used-serials store.
//!
//! Storage nodes track every serial they have settled so a ticket can be
//! used at most once. Entries carry an expiry so the set stays bounded:
//! once the order itself can no longer be accepted, remembering its serial
//! is pointless.

use std::collections::BTreeMap;
use std::collections::HashSet;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;

use warden_core::NodeId;
use warden_core::SerialNumber;

use crate::OrdersError;

#[derive(Default)]
struct State {
    seen: HashSet<(NodeId, SerialNumber)>,
    expiry: BTreeMap<DateTime<Utc>, Vec<(NodeId, SerialNumber)>>,
}

/// Deduplicating store of settled serials, with an expiry index.
#[derive(Default)]
pub struct UsedSerials {
    state: Mutex<State>,
}

impl UsedSerials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a serial. Fails if the satellite has already settled it.
    pub fn add(
        &self,
        satellite_id: NodeId,
        serial: SerialNumber,
        expires_at: DateTime<Utc>,
    ) -> Result<(), OrdersError> {
        let mut state = self.state.lock();
        if !state.seen.insert((satellite_id, serial)) {
            return Err(OrdersError::DuplicateSerial { serial });
        }
        state
            .expiry
            .entry(expires_at)
            .or_default()
            .push((satellite_id, serial));
        Ok(())
    }

    /// Drop expired serials; returns how many were removed.
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<DateTime<Utc>> = state
            .expiry
            .range(..=now)
            .map(|(stamp, _)| *stamp)
            .collect();

        let mut removed = 0;
        for stamp in expired {
            if let Some(entries) = state.expiry.remove(&stamp) {
                for entry in entries {
                    state.seen.remove(&entry);
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.state.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAT: NodeId = NodeId([1u8; 32]);

    #[test]
    fn duplicate_serial_rejected() {
        let serials = UsedSerials::new();
        let serial = SerialNumber([7u8; 16]);
        let expires = Utc::now() + chrono::Duration::hours(1);

        serials.add(SAT, serial, expires).unwrap();
        assert!(matches!(
            serials.add(SAT, serial, expires),
            Err(OrdersError::DuplicateSerial { .. })
        ));
    }

    #[test]
    fn same_serial_different_satellite_is_distinct() {
        let serials = UsedSerials::new();
        let serial = SerialNumber([7u8; 16]);
        let expires = Utc::now() + chrono::Duration::hours(1);

        serials.add(SAT, serial, expires).unwrap();
        serials.add(NodeId([2u8; 32]), serial, expires).unwrap();
        assert_eq!(serials.len(), 2);
    }

    #[test]
    fn cleanup_frees_expired_serials() {
        let serials = UsedSerials::new();
        let now = Utc::now();
        let serial = SerialNumber([7u8; 16]);

        serials.add(SAT, serial, now + chrono::Duration::seconds(10)).unwrap();
        assert_eq!(serials.cleanup(now), 0);

        let removed = serials.cleanup(now + chrono::Duration::seconds(11));
        assert_eq!(removed, 1);
        assert!(serials.is_empty());

        // after expiry the serial may be recorded again
        serials.add(SAT, serial, now + chrono::Duration::hours(1)).unwrap();
    }
}
