//! Device identity: x25519 keypair generation and derivation.
//!
//! The engine's cryptographic identity is an x25519 keypair. The public key is
//! always derived from the secret; a [`KeyPair`] is superseded as a whole on
//! rotation, never mutated in place, so a snapshot can never observe a
//! half-rotated identity.

use crate::error::{EngineError, EngineResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An x25519 keypair (secret + derived public key).
#[derive(Clone)]
pub struct KeyPair {
    /// The secret key (never exposed in debug output).
    secret: StaticSecret,
    /// The public key, deterministically derived from the secret.
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair from the OS entropy source.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Create a keypair from an existing secret key.
    pub fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Create a keypair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    /// Create a keypair from a base64-encoded secret key.
    pub fn from_secret_base64(base64: &str) -> EngineResult<Self> {
        Ok(Self::from_secret_bytes(decode_key32(base64)?))
    }

    /// Get the secret key.
    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Get the public key.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Get the secret key as bytes.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Get the public key as bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Encode the secret key as base64.
    pub fn secret_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.secret_bytes())
    }

    /// Encode the public key as base64.
    pub fn public_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.public_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only show the public key in debug output for security
        f.debug_struct("KeyPair")
            .field("public", &self.public_base64())
            .finish()
    }
}

/// Decode a base64 string into exactly 32 key bytes.
pub fn decode_key32(base64: &str) -> EngineResult<[u8; 32]> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(base64.trim())
        .map_err(|e| EngineError::InvalidKey(format!("Invalid base64: {}", e)))?;

    if bytes.len() != 32 {
        return Err(EngineError::InvalidKey(format!(
            "Invalid key length: expected 32 bytes, got {}",
            bytes.len()
        )));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// A peer's public key as it appears in configs, events, and status output.
///
/// Serialized as base64, compared and hashed as raw bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerPublicKey(#[serde(with = "base64_bytes")] pub [u8; 32]);

impl PeerPublicKey {
    /// Parse from a base64 string.
    pub fn from_base64(base64: &str) -> EngineResult<Self> {
        Ok(Self(decode_key32(base64)?))
    }

    /// Convert to an x25519 PublicKey.
    pub fn to_public_key(&self) -> PublicKey {
        PublicKey::from(self.0)
    }

    /// Encode as base64.
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }
}

impl From<PublicKey> for PeerPublicKey {
    fn from(key: PublicKey) -> Self {
        Self(key.to_bytes())
    }
}

impl From<&PublicKey> for PeerPublicKey {
    fn from(key: &PublicKey) -> Self {
        Self(key.to_bytes())
    }
}

impl fmt::Display for PeerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// Serde module for base64 encoding of 32-byte keys.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let base64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        serializer.serialize_str(&base64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let base64_str = String::deserialize(deserializer)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&base64_str)
            .map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom(format!(
                "Expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(arr)
    }
}
