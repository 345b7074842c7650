//! Canonical hashing for ledger entries
//!
//! Entries are hashed over a canonical JSON rendering of every field except
//! `hash` and `signature`:
//! - object keys sorted, arrays in positional order
//! - compact separators, no insignificant whitespace
//! - timestamps rendered as RFC 3339 / ISO-8601 strings
//!
//! The digest algorithm is chosen once per ledger and never changes mid-chain.

use crate::{types::Entry, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use sha3::{Sha3_256, Sha3_512};
use std::fmt;
use std::str::FromStr;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// SHA-256 (default)
    #[serde(rename = "sha256")]
    Sha256,
    /// SHA-512
    #[serde(rename = "sha512")]
    Sha512,
    /// SHA3-256
    #[serde(rename = "sha3_256")]
    Sha3_256,
    /// SHA3-512
    #[serde(rename = "sha3_512")]
    Sha3_512,
    /// BLAKE3 (256-bit output)
    #[serde(rename = "blake3")]
    Blake3,
}

impl HashAlgorithm {
    /// Configuration name
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Sha3_256 => "sha3_256",
            HashAlgorithm::Sha3_512 => "sha3_512",
            HashAlgorithm::Blake3 => "blake3",
        }
    }

    /// Digest length in bytes
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 | HashAlgorithm::Sha3_256 | HashAlgorithm::Blake3 => 32,
            HashAlgorithm::Sha512 | HashAlgorithm::Sha3_512 => 64,
        }
    }

    /// Raw digest of arbitrary bytes
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
            HashAlgorithm::Sha3_256 => Sha3_256::digest(data).to_vec(),
            HashAlgorithm::Sha3_512 => Sha3_512::digest(data).to_vec(),
            HashAlgorithm::Blake3 => blake3::hash(data).as_bytes().to_vec(),
        }
    }

    /// Hex digest of arbitrary bytes
    pub fn hex_digest(&self, data: &[u8]) -> HexDigest {
        HexDigest(hex::encode(self.digest(data)))
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Sha256
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            "sha3_256" => Ok(HashAlgorithm::Sha3_256),
            "sha3_512" => Ok(HashAlgorithm::Sha3_512),
            "blake3" => Ok(HashAlgorithm::Blake3),
            other => Err(Error::Validation(format!(
                "Unsupported hash algorithm: {} (supported: sha256, sha512, sha3_256, sha3_512, blake3)",
                other
            ))),
        }
    }
}

/// Lowercase hex-encoded digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HexDigest(String);

impl HexDigest {
    /// Wrap an existing hex string (normalized to lowercase)
    pub fn from_hex(hex_str: impl AsRef<str>) -> Result<Self> {
        let s = hex_str.as_ref().to_ascii_lowercase();
        hex::decode(&s).map_err(|e| Error::Validation(format!("Invalid hex digest: {}", e)))?;
        Ok(Self(s))
    }

    /// Hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw digest bytes (what signers sign)
    pub fn to_bytes(&self) -> Vec<u8> {
        // Constructed only from valid hex, see `from_hex` and `hex_digest`
        hex::decode(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for HexDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for HexDigest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Render a JSON value canonically: sorted keys, compact separators.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Deterministic hasher for entries and arbitrary structured values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalHasher {
    algorithm: HashAlgorithm,
}

impl CanonicalHasher {
    /// Create a hasher bound to one algorithm
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Bound algorithm
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hash raw bytes
    pub fn hash_bytes(&self, data: &[u8]) -> HexDigest {
        self.algorithm.hex_digest(data)
    }

    /// Hash a structured value through its canonical rendering
    pub fn hash_value(&self, value: &Value) -> HexDigest {
        self.hash_bytes(canonical_json(value).as_bytes())
    }

    /// Hash an entry over all fields except `hash` and `signature`
    pub fn calculate_hash(&self, entry: &Entry) -> HexDigest {
        self.hash_value(&entry.hash_input())
    }

    /// Recompute and compare
    pub fn verify_hash(&self, entry: &Entry, expected: &HexDigest) -> bool {
        self.calculate_hash(entry) == *expected
    }

    /// Fixed sentinel for an empty chain.
    ///
    /// Hashes a record whose field set (`genesis`, `algorithm`, `timestamp`)
    /// cannot be produced by any entry.
    pub fn genesis_hash(&self) -> HexDigest {
        let sentinel = serde_json::json!({
            "genesis": true,
            "algorithm": self.algorithm.name(),
            "timestamp": "1970-01-01T00:00:00+00:00",
        });
        self.hash_value(&sentinel)
    }
}

impl Default for CanonicalHasher {
    fn default() -> Self {
        Self::new(HashAlgorithm::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let a = json!({"b": 1, "a": {"z": [3, 1, {"y": 2, "x": 1}], "c": null}});
        let rendered = canonical_json(&a);
        assert_eq!(rendered, r#"{"a":{"c":null,"z":[3,1,{"x":1,"y":2}]},"b":1}"#);
    }

    #[test]
    fn test_canonical_json_escapes_keys_and_strings() {
        let v = json!({"quo\"te": "line\nbreak"});
        assert_eq!(canonical_json(&v), r#"{"quo\"te":"line\nbreak"}"#);
    }

    #[test]
    fn test_hash_value_order_independent() {
        let hasher = CanonicalHasher::default();
        let mut m1 = serde_json::Map::new();
        m1.insert("event".into(), json!("login"));
        m1.insert("user".into(), json!("alice"));
        let mut m2 = serde_json::Map::new();
        m2.insert("user".into(), json!("alice"));
        m2.insert("event".into(), json!("login"));
        assert_eq!(
            hasher.hash_value(&Value::Object(m1)),
            hasher.hash_value(&Value::Object(m2))
        );
    }

    #[test]
    fn test_known_sha256_vector() {
        let digest = HashAlgorithm::Sha256.hex_digest(b"abc");
        assert_eq!(
            digest.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_output_lengths() {
        for algorithm in [
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha512,
            HashAlgorithm::Sha3_256,
            HashAlgorithm::Sha3_512,
            HashAlgorithm::Blake3,
        ] {
            let digest = algorithm.hex_digest(b"payload");
            assert_eq!(digest.as_str().len(), algorithm.output_len() * 2);
            assert_eq!(digest.to_bytes().len(), algorithm.output_len());
        }
    }

    #[test]
    fn test_genesis_hash_is_algorithm_bound() {
        let sha = CanonicalHasher::new(HashAlgorithm::Sha256).genesis_hash();
        let sha3 = CanonicalHasher::new(HashAlgorithm::Sha3_256).genesis_hash();
        assert_ne!(sha, sha3);
        assert_eq!(sha, CanonicalHasher::new(HashAlgorithm::Sha256).genesis_hash());
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("SHA3-512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha3_512);
        assert_eq!("blake3".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Blake3);
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn test_hex_digest_from_hex() {
        let d = HexDigest::from_hex("ABCDEF").unwrap();
        assert_eq!(d.as_str(), "abcdef");
        assert_eq!(d.to_bytes(), vec![0xab, 0xcd, 0xef]);
        assert!(HexDigest::from_hex("xyz").is_err());
    }
}
