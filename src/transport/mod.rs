//! Framed duplex transport
//!
//! - `frame`: the read loop, single-writer send path, and handler table
//! - `state`: validated connection lifecycle
//! - `signature`: signed payload boundary
//! - `connect`: `tcp://` and `quic://` connection establishment
//! - `quic`: QUIC endpoints and self-signed certificates

pub mod connect;
pub mod frame;
pub mod quic;
pub mod signature;
pub mod state;

pub use connect::{FrameListener, TransportUri};
pub use frame::{FrameTransport, MessageHandlers, TransportOptions, TransportStats};
pub use quic::CertPair;
pub use signature::{
    Ed25519Signer, Ed25519Verifier, PayloadSigner, RejectSigned, SignatureVerifier,
};
pub use state::{TransportState, TransportStateMachine};
