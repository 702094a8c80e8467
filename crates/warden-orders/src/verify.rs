//! Storage-node-side order verification.
//!
//! A storage node serves no bytes until the presented ticket passes these
//! checks: sane values, a valid satellite signature, an order-creation
//! stamp inside the grace window, and a serial that has never been settled
//! before. Orders submitted against a ticket must carry a monotonically
//! non-decreasing amount within the ticket's limit, signed by the
//! ephemeral uplink key named in the ticket.

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;

use warden_core::NodeId;
use warden_core::PieceHash;

use crate::limit::order_signable_bytes;
use crate::limit::piece_hash_signable_bytes;
use crate::limit::verify_order_limit_signature;
use crate::limit::Order;
use crate::limit::OrderLimit;
use crate::serial::UsedSerials;
use crate::OrdersError;

/// Node-side verification tuning.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Tickets older than this (by `order_creation`) are rejected.
    pub grace_period: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            grace_period: Duration::from_secs(3600),
        }
    }
}

/// Full ticket admission check, including serial dedup.
///
/// On success the serial is recorded in `used_serials` with an expiry no
/// later than the end of the grace window, so the dedup set stays bounded
/// even for long-lived tickets.
pub fn verify_order_limit(
    limit: &OrderLimit,
    expected_node: NodeId,
    satellite_public_key: &[u8; 32],
    used_serials: &UsedSerials,
    config: &VerifierConfig,
    now: DateTime<Utc>,
) -> Result<(), OrdersError> {
    if limit.limit < 0 {
        return Err(OrdersError::Protocol {
            message: "order limit is negative".to_string(),
        });
    }
    if limit.storage_node_id != expected_node {
        return Err(OrdersError::Protocol {
            message: format!("order intended for other node: {}", limit.storage_node_id),
        });
    }
    if limit.satellite_id.is_zero() {
        return Err(OrdersError::Protocol {
            message: "missing satellite id".to_string(),
        });
    }
    if limit.piece_id.is_zero() {
        return Err(OrdersError::Protocol {
            message: "missing piece id".to_string(),
        });
    }
    if limit.uplink_public_key.is_zero() {
        return Err(OrdersError::Protocol {
            message: "missing uplink public key".to_string(),
        });
    }
    if limit.satellite_signature.is_empty() {
        return Err(OrdersError::Protocol {
            message: "missing satellite signature".to_string(),
        });
    }
    if let Some(piece_expiration) = limit.piece_expiration {
        if piece_expiration <= now {
            return Err(OrdersError::Expired {
                message: format!("piece expired at {piece_expiration}"),
            });
        }
    }
    if limit.order_expiration <= now {
        return Err(OrdersError::Expired {
            message: format!("order expired at {}", limit.order_expiration),
        });
    }
    let grace = chrono::Duration::from_std(config.grace_period)
        .unwrap_or_else(|_| chrono::Duration::hours(1));
    if now.signed_duration_since(limit.order_creation) > grace {
        return Err(OrdersError::Expired {
            message: format!("order created too long ago: {}", limit.order_creation),
        });
    }

    verify_order_limit_signature(limit, satellite_public_key)?;

    // expire the serial when the ticket can no longer be presented anyway
    let serial_expiration = limit.order_expiration.min(now + grace);
    used_serials.add(limit.satellite_id, limit.serial, serial_expiration)?;

    Ok(())
}

/// Check an order against its ticket and the largest amount seen so far.
pub fn verify_order(
    limit: &OrderLimit,
    order: &Order,
    largest_prior_amount: i64,
) -> Result<(), OrdersError> {
    if order.serial != limit.serial {
        return Err(OrdersError::Protocol {
            message: "order serial does not match limit".to_string(),
        });
    }
    if order.amount < largest_prior_amount {
        return Err(OrdersError::Protocol {
            message: format!(
                "order amount decreased: {} after {largest_prior_amount}",
                order.amount
            ),
        });
    }
    if order.amount > limit.limit {
        return Err(OrdersError::Protocol {
            message: format!("order amount {} exceeds limit {}", order.amount, limit.limit),
        });
    }

    let message = order_signable_bytes(order.serial, order.amount)?;
    limit
        .uplink_public_key
        .verify(&message, &order.uplink_signature)
}

/// Check an uploaded piece's signed hash against the locally computed one.
pub fn verify_piece_hash(
    limit: &OrderLimit,
    piece_hash: &PieceHash,
    expected_hash: &[u8; 32],
) -> Result<(), OrdersError> {
    if piece_hash.piece_id != limit.piece_id {
        return Err(OrdersError::Protocol {
            message: "piece id changed between limit and hash".to_string(),
        });
    }
    if &piece_hash.hash != expected_hash {
        return Err(OrdersError::Protocol {
            message: "piece hash does not match uploaded data".to_string(),
        });
    }

    let message = piece_hash_signable_bytes(piece_hash.piece_id, &piece_hash.hash)?;
    limit
        .uplink_public_key
        .verify(&message, &piece_hash.signature)
}

#[cfg(test)]
mod tests {
    use warden_core::PieceId;
    use warden_core::SerialNumber;

    use crate::limit::PieceAction;
    use crate::limit::PiecePrivateKey;
    use crate::limit::SatelliteSigner;

    use super::*;

    const NODE: NodeId = NodeId([2u8; 32]);

    struct Fixture {
        signer: SatelliteSigner,
        key: PiecePrivateKey,
        limit: OrderLimit,
        serials: UsedSerials,
    }

    fn fixture() -> Fixture {
        let signer = SatelliteSigner::from_seed(NodeId([9u8; 32]), [42u8; 32]);
        let (key, public) = PiecePrivateKey::generate();
        let now = Utc::now();
        let limit = signer
            .sign(OrderLimit {
                serial: SerialNumber([5u8; 16]),
                satellite_id: signer.id(),
                storage_node_id: NODE,
                piece_id: PieceId([3u8; 32]),
                uplink_public_key: public,
                action: PieceAction::Get,
                limit: 4096,
                piece_expiration: None,
                order_expiration: now + chrono::Duration::hours(1),
                order_creation: now,
                satellite_signature: Vec::new(),
            })
            .unwrap();
        Fixture {
            signer,
            key,
            limit,
            serials: UsedSerials::new(),
        }
    }

    #[test]
    fn valid_limit_passes_once() {
        let f = fixture();
        let config = VerifierConfig::default();
        let now = Utc::now();

        verify_order_limit(&f.limit, NODE, &f.signer.public_key_bytes(), &f.serials, &config, now)
            .unwrap();

        // replay with the same serial is refused
        let replay = verify_order_limit(
            &f.limit,
            NODE,
            &f.signer.public_key_bytes(),
            &f.serials,
            &config,
            now,
        );
        assert!(matches!(replay, Err(OrdersError::DuplicateSerial { .. })));
    }

    #[test]
    fn limit_for_other_node_rejected() {
        let f = fixture();
        let result = verify_order_limit(
            &f.limit,
            NodeId([7u8; 32]),
            &f.signer.public_key_bytes(),
            &f.serials,
            &VerifierConfig::default(),
            Utc::now(),
        );
        assert!(matches!(result, Err(OrdersError::Protocol { .. })));
    }

    #[test]
    fn limit_outside_grace_window_rejected() {
        let f = fixture();
        let config = VerifierConfig {
            grace_period: Duration::from_secs(60),
        };
        let late = Utc::now() + chrono::Duration::minutes(5);
        let result = verify_order_limit(
            &f.limit,
            NODE,
            &f.signer.public_key_bytes(),
            &f.serials,
            &config,
            late,
        );
        assert!(matches!(result, Err(OrdersError::Expired { .. })));
    }

    #[test]
    fn order_amounts_are_monotone_and_bounded() {
        let f = fixture();

        let order = f.key.sign_order(f.limit.serial, 100).unwrap();
        verify_order(&f.limit, &order, 0).unwrap();
        verify_order(&f.limit, &order, 100).unwrap();

        // shrinking amount is a protocol violation
        assert!(matches!(
            verify_order(&f.limit, &order, 200),
            Err(OrdersError::Protocol { .. })
        ));

        // exceeding the ticket limit is a protocol violation
        let too_big = f.key.sign_order(f.limit.serial, 5000).unwrap();
        assert!(matches!(
            verify_order(&f.limit, &too_big, 0),
            Err(OrdersError::Protocol { .. })
        ));
    }

    #[test]
    fn order_signed_by_wrong_key_rejected() {
        let f = fixture();
        let (other_key, _) = PiecePrivateKey::generate();
        let order = other_key.sign_order(f.limit.serial, 100).unwrap();
        assert!(matches!(
            verify_order(&f.limit, &order, 0),
            Err(OrdersError::Untrusted { .. })
        ));
    }

    #[test]
    fn piece_hash_checks_id_hash_and_signature() {
        let f = fixture();
        let hash = [8u8; 32];
        let signed = f.key.sign_piece_hash(f.limit.piece_id, hash).unwrap();

        verify_piece_hash(&f.limit, &signed, &hash).unwrap();
        assert!(matches!(
            verify_piece_hash(&f.limit, &signed, &[9u8; 32]),
            Err(OrdersError::Protocol { .. })
        ));

        let wrong_piece = f.key.sign_piece_hash(PieceId([1u8; 32]), hash).unwrap();
        assert!(matches!(
            verify_piece_hash(&f.limit, &wrong_piece, &hash),
            Err(OrdersError::Protocol { .. })
        ));
    }
}
