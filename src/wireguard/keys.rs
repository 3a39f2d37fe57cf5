//! WireGuard key material
//!
//! Keys arrive already provisioned (device management is outside this
//! crate); this module only parses them, keeps secrets zeroised, and hands
//! raw bytes to the protocol core.

use crate::error::{AdapterError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

fn decode_key(s: &str, what: &str) -> Result<[u8; 32]> {
    let decoded = BASE64
        .decode(s.trim())
        .map_err(|e| AdapterError::Configuration(format!("Invalid base64 {}: {}", what, e)))?;

    if decoded.len() != 32 {
        return Err(AdapterError::Configuration(format!(
            "Invalid {} length: expected 32 bytes, got {}",
            what,
            decoded.len()
        )));
    }

    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&decoded);
    Ok(bytes)
}

/// WireGuard private key (32 bytes, x25519)
#[derive(Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct PrivateKey {
    secret: Zeroizing<[u8; 32]>,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self {
            secret: Zeroizing::new(secret.to_bytes()),
        }
    }

    /// Create a private key from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: Zeroizing::new(bytes),
        }
    }

    /// Parse a private key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key(s, "private key").map(Self::from_bytes)
    }

    /// Convert to base64-encoded string
    pub fn to_base64(&self) -> String {
        BASE64.encode(*self.secret)
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(*self.secret);
        PublicKey {
            key: X25519PublicKey::from(&secret).to_bytes(),
        }
    }

    /// Secret in the form boringtun consumes
    pub fn to_static_secret(&self) -> StaticSecret {
        StaticSecret::from(*self.secret)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl TryFrom<String> for PrivateKey {
    type Error = AdapterError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_base64(&value)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

// Ensure private keys are never accidentally logged
impl fmt::Display for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// WireGuard public key (32 bytes, x25519)
#[derive(Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct PublicKey {
    key: [u8; 32],
}

impl PublicKey {
    /// Create a public key from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { key: bytes }
    }

    /// Parse a public key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key(s, "public key").map(Self::from_bytes)
    }

    /// Convert to base64-encoded string
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key)
    }

    /// Key in the form boringtun consumes
    pub fn to_x25519(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.key)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl TryFrom<String> for PublicKey {
    type Error = AdapterError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_base64(&value)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// Optional symmetric key mixed into the handshake
#[derive(Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct PresharedKey {
    key: Zeroizing<[u8; 32]>,
}

impl PresharedKey {
    /// Create a pre-shared key from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(bytes),
        }
    }

    /// Parse a pre-shared key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key(s, "pre-shared key").map(Self::from_bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl TryFrom<String> for PresharedKey {
    type Error = AdapterError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_base64(&value)
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PresharedKey([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_key_to_base64() {
        let private = PrivateKey::generate();
        let base64_str = private.to_base64();
        assert_eq!(base64_str.len(), 44); // Base64 of 32 bytes
    }

    #[test]
    fn test_private_key_from_base64() {
        let private = PrivateKey::generate();
        let restored = PrivateKey::from_base64(&private.to_base64()).unwrap();
        assert_eq!(private.as_bytes(), restored.as_bytes());
    }

    #[test]
    fn test_public_key_derivation_is_stable() {
        let private = PrivateKey::generate();
        assert_eq!(private.public_key(), private.public_key());
        assert_eq!(
            private.public_key().to_x25519().to_bytes(),
            *private.public_key().as_bytes()
        );
    }

    #[test]
    fn test_private_key_not_logged() {
        let private = PrivateKey::generate();
        let debug_str = format!("{:?}", private);
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains(&private.to_base64()));

        let psk = PresharedKey::from_bytes([7u8; 32]);
        assert_eq!(format!("{:?}", psk), "PresharedKey([REDACTED])");
    }

    #[test]
    fn test_invalid_base64() {
        assert!(PrivateKey::from_base64("invalid!@#$").is_err());
        assert!(PublicKey::from_base64("").is_err());
    }

    #[test]
    fn test_invalid_length() {
        let short_key = BASE64.encode([0u8; 16]);
        let err = PublicKey::from_base64(&short_key).unwrap_err();
        assert!(matches!(err, AdapterError::Configuration(_)));
        assert!(err.to_string().contains("got 16"));
    }

    #[test]
    fn test_keys_deserialize_from_strings() {
        #[derive(Deserialize)]
        struct Keys {
            public: PublicKey,
            psk: PresharedKey,
        }

        let public = PrivateKey::generate().public_key();
        let json = format!(
            r#"{{"public":"{}","psk":"{}"}}"#,
            public.to_base64(),
            BASE64.encode([1u8; 32])
        );
        let keys: Keys = serde_json::from_str(&json).unwrap();
        assert_eq!(keys.public, public);
        assert_eq!(keys.psk.as_bytes(), &[1u8; 32]);
    }
}
