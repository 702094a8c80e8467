//! Order limits and orders.
//!
//! An order limit is a short-lived ticket signed by the satellite that
//! authorizes one bounded byte transfer between a client and a storage
//! node. The client proves it holds the ticket by signing orders with the
//! ephemeral piece key minted alongside the ticket set; the storage node
//! verifies both signatures and refuses serials it has already settled.

use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use ed25519_dalek::Signature;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use ed25519_dalek::Verifier;
use ed25519_dalek::VerifyingKey;
use serde::Deserialize;
use serde::Serialize;

use warden_core::NodeId;
use warden_core::PieceHash;
use warden_core::PieceId;
use warden_core::SerialNumber;

use crate::OrdersError;

/// What a ticket authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PieceAction {
    Put,
    Get,
    GetAudit,
    GetRepair,
    PutRepair,
    Delete,
}

/// Ephemeral public key bound into a ticket set.
///
/// Whoever holds the matching [`PiecePrivateKey`] may sign orders and
/// piece hashes against the tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PiecePublicKey(pub [u8; 32]);

impl PiecePublicKey {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), OrdersError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| OrdersError::Untrusted {
            message: "malformed piece public key".to_string(),
        })?;
        let signature =
            Signature::from_slice(signature).map_err(|_| OrdersError::Untrusted {
                message: "malformed signature".to_string(),
            })?;
        key.verify(message, &signature)
            .map_err(|_| OrdersError::Untrusted {
                message: "signature does not verify".to_string(),
            })
    }
}

/// Ephemeral signing key for one ticket set.
#[derive(Clone)]
pub struct PiecePrivateKey(SigningKey);

impl PiecePrivateKey {
    /// Mint a fresh keypair.
    pub fn generate() -> (PiecePrivateKey, PiecePublicKey) {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let public = PiecePublicKey(signing.verifying_key().to_bytes());
        (PiecePrivateKey(signing), public)
    }

    pub fn public(&self) -> PiecePublicKey {
        PiecePublicKey(self.0.verifying_key().to_bytes())
    }

    /// Sign an order for `serial` over `amount` bytes.
    pub fn sign_order(&self, serial: SerialNumber, amount: i64) -> Result<Order, OrdersError> {
        let message = order_signable_bytes(serial, amount)?;
        let signature = self.0.sign(&message).to_bytes().to_vec();
        Ok(Order {
            serial,
            amount,
            uplink_signature: signature,
        })
    }

    /// Sign the hash of an uploaded piece.
    pub fn sign_piece_hash(
        &self,
        piece_id: PieceId,
        hash: [u8; 32],
    ) -> Result<PieceHash, OrdersError> {
        let message = piece_hash_signable_bytes(piece_id, &hash)?;
        let signature = self.0.sign(&message).to_bytes().to_vec();
        Ok(PieceHash {
            piece_id,
            hash,
            signature,
        })
    }
}

impl fmt::Debug for PiecePrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never leak key material into logs
        f.write_str("PiecePrivateKey(..)")
    }
}

/// Signed single-use authorization for one piece transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLimit {
    pub serial: SerialNumber,
    pub satellite_id: NodeId,
    pub storage_node_id: NodeId,
    pub piece_id: PieceId,
    /// Public half of the ephemeral key minted with this ticket set.
    pub uplink_public_key: PiecePublicKey,
    pub action: PieceAction,
    /// Maximum bytes the ticket authorizes.
    pub limit: i64,
    pub piece_expiration: Option<DateTime<Utc>>,
    pub order_expiration: DateTime<Utc>,
    pub order_creation: DateTime<Utc>,
    pub satellite_signature: Vec<u8>,
}

impl OrderLimit {
    /// Bytes covered by the satellite signature.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, OrdersError> {
        #[derive(Serialize)]
        struct Unsigned<'a> {
            serial: &'a SerialNumber,
            satellite_id: &'a NodeId,
            storage_node_id: &'a NodeId,
            piece_id: &'a PieceId,
            uplink_public_key: &'a PiecePublicKey,
            action: &'a PieceAction,
            limit: i64,
            piece_expiration: Option<i64>,
            order_expiration: i64,
            order_creation: i64,
        }
        let unsigned = Unsigned {
            serial: &self.serial,
            satellite_id: &self.satellite_id,
            storage_node_id: &self.storage_node_id,
            piece_id: &self.piece_id,
            uplink_public_key: &self.uplink_public_key,
            action: &self.action,
            limit: self.limit,
            piece_expiration: self.piece_expiration.map(|t| t.timestamp_micros()),
            order_expiration: self.order_expiration.timestamp_micros(),
            order_creation: self.order_creation.timestamp_micros(),
        };
        postcard::to_stdvec(&unsigned).map_err(|e| OrdersError::Encode {
            message: e.to_string(),
        })
    }
}

/// An order limit paired with the node's dial address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressedOrderLimit {
    pub limit: OrderLimit,
    pub node_address: String,
}

/// A client's settlement claim against one ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub serial: SerialNumber,
    /// Bytes actually transferred; never decreases across revisions.
    pub amount: i64,
    pub uplink_signature: Vec<u8>,
}

pub(crate) fn order_signable_bytes(
    serial: SerialNumber,
    amount: i64,
) -> Result<Vec<u8>, OrdersError> {
    postcard::to_stdvec(&(serial, amount)).map_err(|e| OrdersError::Encode {
        message: e.to_string(),
    })
}

pub(crate) fn piece_hash_signable_bytes(
    piece_id: PieceId,
    hash: &[u8; 32],
) -> Result<Vec<u8>, OrdersError> {
    postcard::to_stdvec(&(piece_id, hash)).map_err(|e| OrdersError::Encode {
        message: e.to_string(),
    })
}

/// Satellite-held signing identity for order limits.
pub struct SatelliteSigner {
    id: NodeId,
    key: SigningKey,
}

impl SatelliteSigner {
    pub fn new(id: NodeId, key: SigningKey) -> Self {
        SatelliteSigner { id, key }
    }

    /// Deterministic signer for tests and fixtures.
    pub fn from_seed(id: NodeId, seed: [u8; 32]) -> Self {
        SatelliteSigner {
            id,
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    /// Sign the limit in place.
    pub fn sign(&self, mut limit: OrderLimit) -> Result<OrderLimit, OrdersError> {
        let message = limit.signable_bytes()?;
        limit.satellite_signature = self.key.sign(&message).to_bytes().to_vec();
        Ok(limit)
    }
}

/// Verify a limit's satellite signature against the given public key.
pub fn verify_order_limit_signature(
    limit: &OrderLimit,
    satellite_public_key: &[u8; 32],
) -> Result<(), OrdersError> {
    let message = limit.signable_bytes()?;
    let key = VerifyingKey::from_bytes(satellite_public_key).map_err(|_| OrdersError::Untrusted {
        message: "malformed satellite public key".to_string(),
    })?;
    let signature = Signature::from_slice(&limit.satellite_signature).map_err(|_| {
        OrdersError::Untrusted {
            message: "malformed satellite signature".to_string(),
        }
    })?;
    key.verify(&message, &signature)
        .map_err(|_| OrdersError::Untrusted {
            message: "invalid order limit signature".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(signer: &SatelliteSigner) -> OrderLimit {
        let (_, public) = PiecePrivateKey::generate();
        let now = Utc::now();
        signer
            .sign(OrderLimit {
                serial: SerialNumber([1u8; 16]),
                satellite_id: signer.id(),
                storage_node_id: NodeId([2u8; 32]),
                piece_id: PieceId([3u8; 32]),
                uplink_public_key: public,
                action: PieceAction::Get,
                limit: 4096,
                piece_expiration: None,
                order_expiration: now + chrono::Duration::hours(1),
                order_creation: now,
                satellite_signature: Vec::new(),
            })
            .unwrap()
    }

    #[test]
    fn satellite_signature_roundtrip() {
        let signer = SatelliteSigner::from_seed(NodeId([9u8; 32]), [42u8; 32]);
        let limit = limit(&signer);
        verify_order_limit_signature(&limit, &signer.public_key_bytes()).unwrap();
    }

    #[test]
    fn tampered_limit_fails_verification() {
        let signer = SatelliteSigner::from_seed(NodeId([9u8; 32]), [42u8; 32]);
        let mut limit = limit(&signer);
        limit.limit = 1 << 40;
        assert!(matches!(
            verify_order_limit_signature(&limit, &signer.public_key_bytes()),
            Err(OrdersError::Untrusted { .. })
        ));
    }

    #[test]
    fn wrong_satellite_key_fails_verification() {
        let signer = SatelliteSigner::from_seed(NodeId([9u8; 32]), [42u8; 32]);
        let other = SatelliteSigner::from_seed(NodeId([9u8; 32]), [43u8; 32]);
        let limit = limit(&signer);
        assert!(verify_order_limit_signature(&limit, &other.public_key_bytes()).is_err());
    }

    #[test]
    fn order_signature_verifies_with_piece_key() {
        let (private, public) = PiecePrivateKey::generate();
        let order = private.sign_order(SerialNumber([5u8; 16]), 100).unwrap();

        let message = order_signable_bytes(order.serial, order.amount).unwrap();
        public.verify(&message, &order.uplink_signature).unwrap();

        // a different amount must not verify
        let forged = order_signable_bytes(order.serial, 101).unwrap();
        assert!(public.verify(&forged, &order.uplink_signature).is_err());
    }

    #[test]
    fn piece_hash_signature_verifies() {
        let (private, public) = PiecePrivateKey::generate();
        let signed = private.sign_piece_hash(PieceId([3u8; 32]), [7u8; 32]).unwrap();

        let message = piece_hash_signable_bytes(signed.piece_id, &signed.hash).unwrap();
        public.verify(&message, &signed.signature).unwrap();
    }
}
