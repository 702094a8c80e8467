//! Order authority: signed, single-use transfer authorizations.
//!
//! Storage nodes serve bytes only against a ticket (an order limit) signed
//! by the satellite. This crate mints ticket sets for the repair and audit
//! paths, and carries the storage-node-side verification logic the test
//! swarm enforces: signature checks, the order-creation grace window,
//! serial dedup, and monotone order amounts.

pub mod error;
pub mod limit;
pub mod serial;
pub mod service;
pub mod verify;

pub use error::OrdersError;
pub use limit::AddressedOrderLimit;
pub use limit::Order;
pub use limit::OrderLimit;
pub use limit::PieceAction;
pub use limit::PiecePrivateKey;
pub use limit::PiecePublicKey;
pub use limit::SatelliteSigner;
pub use limit::verify_order_limit_signature;
pub use serial::UsedSerials;
pub use service::OrderService;
pub use service::OrdersConfig;
pub use verify::verify_order;
pub use verify::verify_order_limit;
pub use verify::verify_piece_hash;
pub use verify::VerifierConfig;
