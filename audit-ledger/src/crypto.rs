//! Entry signing
//!
//! This module provides:
//! - The [`Signer`] contract consumed by the ledger
//! - Ed25519 signing with base64 signatures and hex public keys
//! - M-of-N multi-signature over a set of named identities

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature as DalekSignature, Signer as _, SigningKey, Verifier, VerifyingKey};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// External signer contract.
///
/// The ledger passes the raw digest bytes of an entry's hash to `sign` and
/// stores the returned string verbatim in the entry's `signature` field.
pub trait Signer: Send + Sync + fmt::Debug {
    /// Sign raw bytes
    fn sign(&self, data: &[u8]) -> Result<String>;

    /// Check a signature produced by `sign`
    fn verify(&self, data: &[u8], signature: &str) -> bool;

    /// Public key identifying this signer
    fn public_key(&self) -> String;
}

/// Ed25519 signer
pub struct Ed25519Signer {
    signing_key: Option<SigningKey>,
    verifying_key: VerifyingKey,
}

impl Ed25519Signer {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key: Some(signing_key),
            verifying_key,
        }
    }

    /// Verify-only signer from a hex public key
    pub fn from_public_key(public_key_hex: &str) -> Result<Self> {
        let bytes: [u8; 32] = hex::decode(public_key_hex)
            .map_err(|e| Error::Signature(format!("Invalid public key hex: {}", e)))?
            .try_into()
            .map_err(|_| Error::Signature("Public key must be 32 bytes".to_string()))?;
        let verifying_key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| Error::Signature(format!("Invalid public key: {}", e)))?;

        Ok(Self {
            signing_key: None,
            verifying_key,
        })
    }

    /// Can this instance produce signatures
    pub fn can_sign(&self) -> bool {
        self.signing_key.is_some()
    }
}

impl fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &self.public_key())
            .field("can_sign", &self.can_sign())
            .finish()
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, data: &[u8]) -> Result<String> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| Error::Signature("Signer has no private key".to_string()))?;
        Ok(BASE64.encode(signing_key.sign(data).to_bytes()))
    }

    fn verify(&self, data: &[u8], signature: &str) -> bool {
        let Ok(raw) = BASE64.decode(signature) else {
            return false;
        };
        let Ok(bytes) = <[u8; 64]>::try_from(raw.as_slice()) else {
            return false;
        };
        let signature = DalekSignature::from_bytes(&bytes);
        self.verifying_key.verify(data, &signature).is_ok()
    }

    fn public_key(&self) -> String {
        hex::encode(self.verifying_key.to_bytes())
    }
}

/// M-of-N signer over named identities.
///
/// The combined signature is a canonical JSON object mapping identity name to
/// that identity's signature, so it fits in a single `signature` field.
#[derive(Debug)]
pub struct MultiSigner {
    signers: BTreeMap<String, Arc<dyn Signer>>,
    threshold: usize,
}

impl MultiSigner {
    /// Create with a required signature count
    pub fn new(threshold: usize) -> Result<Self> {
        if threshold == 0 {
            return Err(Error::Validation(
                "Multi-signature threshold must be positive".to_string(),
            ));
        }
        Ok(Self {
            signers: BTreeMap::new(),
            threshold,
        })
    }

    /// Register a named identity
    pub fn add_signer(&mut self, name: impl Into<String>, signer: Arc<dyn Signer>) {
        self.signers.insert(name.into(), signer);
    }

    /// Builder form of [`add_signer`](Self::add_signer)
    pub fn with_signer(mut self, name: impl Into<String>, signer: Arc<dyn Signer>) -> Self {
        self.add_signer(name, signer);
        self
    }

    /// Required signature count
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Registered identities
    pub fn signer_names(&self) -> impl Iterator<Item = &str> {
        self.signers.keys().map(String::as_str)
    }

    /// Decode a combined signature into per-identity signatures
    pub fn decode(signature: &str) -> Result<BTreeMap<String, String>> {
        serde_json::from_str(signature)
            .map_err(|e| Error::Signature(format!("Malformed multi-signature: {}", e)))
    }

    /// Identities whose signature in `signature` is valid for `data`
    pub fn valid_signers(&self, data: &[u8], signature: &str) -> Vec<String> {
        let Ok(parts) = Self::decode(signature) else {
            return Vec::new();
        };
        parts
            .iter()
            .filter(|(name, sig)| {
                self.signers
                    .get(name.as_str())
                    .map(|signer| signer.verify(data, sig))
                    .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl Signer for MultiSigner {
    fn sign(&self, data: &[u8]) -> Result<String> {
        let mut parts = BTreeMap::new();
        for (name, signer) in &self.signers {
            match signer.sign(data) {
                Ok(sig) => {
                    parts.insert(name.clone(), sig);
                }
                Err(e) => tracing::warn!(signer = %name, error = %e, "Signer failed"),
            }
        }

        if parts.len() < self.threshold {
            return Err(Error::Signature(format!(
                "Collected {} of {} required signatures",
                parts.len(),
                self.threshold
            )));
        }

        // BTreeMap serializes with sorted keys
        Ok(serde_json::to_string(&parts)?)
    }

    fn verify(&self, data: &[u8], signature: &str) -> bool {
        self.valid_signers(data, signature).len() >= self.threshold
    }

    fn public_key(&self) -> String {
        let keys: BTreeMap<&str, String> = self
            .signers
            .iter()
            .map(|(name, signer)| (name.as_str(), signer.public_key()))
            .collect();
        serde_json::to_string(&keys).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = Ed25519Signer::generate();
        let message = b"test message";

        let signature = signer.sign(message).unwrap();
        assert!(signer.verify(message, &signature));
        assert!(!signer.verify(b"wrong message", &signature));
        assert!(!signer.verify(message, "not base64!"));
    }

    #[test]
    fn test_from_seed_is_deterministic() {
        let seed = [42u8; 32];
        let a = Ed25519Signer::from_seed(&seed);
        let b = Ed25519Signer::from_seed(&seed);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.sign(b"m").unwrap(), b.sign(b"m").unwrap());
    }

    #[test]
    fn test_known_public_key_vector() {
        // RFC 8032 test 1
        let seed: [u8; 32] =
            hex::decode("9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60")
                .unwrap()
                .try_into()
                .unwrap();
        let signer = Ed25519Signer::from_seed(&seed);
        assert_eq!(
            signer.public_key(),
            "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a"
        );
    }

    #[test]
    fn test_verify_only_signer() {
        let signer = Ed25519Signer::generate();
        let signature = signer.sign(b"data").unwrap();

        let verifier = Ed25519Signer::from_public_key(&signer.public_key()).unwrap();
        assert!(!verifier.can_sign());
        assert!(verifier.verify(b"data", &signature));
        assert!(matches!(verifier.sign(b"data"), Err(Error::Signature(_))));

        assert!(Ed25519Signer::from_public_key("abcd").is_err());
    }

    #[test]
    fn test_multisig_threshold() {
        let alice: Arc<dyn Signer> = Arc::new(Ed25519Signer::from_seed(&[1u8; 32]));
        let bob: Arc<dyn Signer> = Arc::new(Ed25519Signer::from_seed(&[2u8; 32]));
        let verify_only: Arc<dyn Signer> =
            Arc::new(Ed25519Signer::from_public_key(&alice.public_key()).unwrap());

        let multi = MultiSigner::new(2)
            .unwrap()
            .with_signer("alice", alice.clone())
            .with_signer("bob", bob.clone());
        let signature = multi.sign(b"digest").unwrap();
        assert!(multi.verify(b"digest", &signature));
        assert!(!multi.verify(b"other", &signature));
        assert_eq!(multi.valid_signers(b"digest", &signature), vec!["alice", "bob"]);

        // Only one identity can actually sign
        let short = MultiSigner::new(2)
            .unwrap()
            .with_signer("alice", alice)
            .with_signer("auditor", verify_only);
        assert!(matches!(short.sign(b"digest"), Err(Error::Signature(_))));
    }

    #[test]
    fn test_multisig_rejects_unknown_identity() {
        let alice: Arc<dyn Signer> = Arc::new(Ed25519Signer::from_seed(&[1u8; 32]));
        let mallory = Ed25519Signer::from_seed(&[9u8; 32]);

        let multi = MultiSigner::new(1).unwrap().with_signer("alice", alice);
        let forged = serde_json::json!({ "mallory": mallory.sign(b"digest").unwrap() });
        assert!(!multi.verify(b"digest", &forged.to_string()));
        assert!(MultiSigner::new(0).is_err());
    }
}
