//! Signed payload boundary
//!
//! Signed envelopes carry an Ed25519 signature over the kind code followed
//! by the body bytes. Verification happens before dispatch; a payload that
//! fails it is dropped without closing the connection.

use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use tracing::debug;

use crate::error::{TransportError, TransportResult};
use crate::protocol::{PayloadKind, SignedPayload};

/// Bytes covered by the signature
pub fn signing_input(kind: PayloadKind, payload: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(payload.len() + 1);
    input.push(kind.code());
    input.extend_from_slice(payload);
    input
}

/// Produces signed envelopes
pub trait PayloadSigner: Send + Sync {
    /// Signs an encoded body
    ///
    /// # Errors
    ///
    /// Returns `SigningFailed` if the key cannot sign
    fn sign(&self, kind: PayloadKind, payload: Vec<u8>) -> TransportResult<SignedPayload>;
}

/// Checks signed envelopes before dispatch
pub trait SignatureVerifier: Send + Sync {
    /// Returns true if the envelope may be dispatched
    fn verify(&self, signed: &SignedPayload) -> bool;
}

/// Ed25519 signer
#[derive(Debug)]
pub struct Ed25519Signer {
    key_pair: Ed25519KeyPair,
}

impl Ed25519Signer {
    /// Generates a fresh key; returns the signer and its PKCS#8 document
    ///
    /// # Errors
    ///
    /// Returns error if the system RNG fails
    pub fn generate() -> TransportResult<(Self, Vec<u8>)> {
        let rng = SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| TransportError::SigningFailed("key generation failed".to_string()))?;
        let pkcs8 = document.as_ref().to_vec();
        Ok((Self::from_pkcs8(&pkcs8)?, pkcs8))
    }

    /// Loads a key from a PKCS#8 document
    ///
    /// # Errors
    ///
    /// Returns error if the document is not an Ed25519 key
    pub fn from_pkcs8(pkcs8: &[u8]) -> TransportResult<Self> {
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| TransportError::SigningFailed(format!("rejected key: {}", e)))?;
        Ok(Self { key_pair })
    }

    /// Raw 32-byte public key
    pub fn public_key(&self) -> Vec<u8> {
        self.key_pair.public_key().as_ref().to_vec()
    }
}

impl PayloadSigner for Ed25519Signer {
    fn sign(&self, kind: PayloadKind, payload: Vec<u8>) -> TransportResult<SignedPayload> {
        let signature = self.key_pair.sign(&signing_input(kind, &payload));
        Ok(SignedPayload {
            kind,
            payload,
            signature: signature.as_ref().to_vec(),
            public_key: self.public_key(),
        })
    }
}

/// Ed25519 verifier, optionally pinned to a set of public keys
#[derive(Debug, Clone, Default)]
pub struct Ed25519Verifier {
    trusted: Vec<Vec<u8>>,
}

impl Ed25519Verifier {
    /// Accepts any key whose signature checks out
    pub fn accept_any_key() -> Self {
        Self::default()
    }

    /// Accepts only the given public keys
    pub fn trusting(keys: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            trusted: keys.into_iter().collect(),
        }
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, signed: &SignedPayload) -> bool {
        if !self.trusted.is_empty() && !self.trusted.contains(&signed.public_key) {
            debug!("Signed {:?} payload from an untrusted key", signed.kind);
            return false;
        }

        UnparsedPublicKey::new(&ED25519, &signed.public_key)
            .verify(&signing_input(signed.kind, &signed.payload), &signed.signature)
            .is_ok()
    }
}

/// Verifier used when none is configured: no signed payload is accepted
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectSigned;

impl SignatureVerifier for RejectSigned {
    fn verify(&self, _signed: &SignedPayload) -> bool {
        false
    }
}
