//! Key material for the gateway and its peers
//!
//! AmneziaWG keeps WireGuard's cryptographic identity model: every peer owns an
//! X25519 keypair, and each tunnel additionally carries a 32-byte preshared
//! key. This module generates and validates that material, and seals private
//! keys for at-rest retention.
//!
//! All keys cross module boundaries as Base64 strings (44 characters for a
//! 32-byte key), matching the daemon's own config format.
//!
//! # Entropy failures
//!
//! Key generation draws from the operating system RNG. A failure there is not
//! a request-level error: a process that cannot produce keys must stop handing
//! out enrollments, so [`KeyError::EntropyFailure`] is classified as fatal by
//! the top-level error type.
//!
//! # Private keys at rest
//!
//! A peer's private key is returned to the caller exactly once, at enrollment.
//! If the deployment wants to re-issue client configs later, the key is kept
//! sealed with [`SecretBox`] (AES-256-GCM under a master key supplied from
//! outside the peer store) and never stored in plaintext.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Key length in bytes (X25519 and preshared keys alike)
pub const KEY_LENGTH: usize = 32;

/// AES-GCM nonce length in bytes
const NONCE_LENGTH: usize = 12;

/// Error types for key operations
#[derive(Debug, Error)]
pub enum KeyError {
    /// The system entropy source failed
    #[error("entropy source failure: {0}")]
    EntropyFailure(String),

    /// A key string is not valid Base64 or has the wrong length
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The master key for at-rest sealing is malformed
    #[error("master key must be {KEY_LENGTH} Base64-encoded bytes, got {0} bytes")]
    InvalidMasterKey(usize),

    /// Sealing or opening a private key failed
    #[error("secret seal operation failed: {0}")]
    Seal(String),
}

/// An X25519 keypair, Base64 encoded
///
/// `Debug` redacts the private half so keypairs can appear in error context
/// and log fields without leaking secrets.
#[derive(Clone)]
pub struct Keypair {
    /// Base64-encoded private key
    pub private_key: String,
    /// Base64-encoded public key
    pub public_key: String,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Generate a new X25519 keypair
///
/// # Errors
///
/// Returns [`KeyError::EntropyFailure`] if the OS RNG fails. There is no
/// other failure mode.
pub fn generate_keypair() -> Result<Keypair, KeyError> {
    let mut key_bytes = [0u8; KEY_LENGTH];
    OsRng
        .try_fill_bytes(&mut key_bytes)
        .map_err(|e| KeyError::EntropyFailure(e.to_string()))?;

    // StaticSecret handles X25519 clamping
    let secret = StaticSecret::from(key_bytes);
    let public = PublicKey::from(&secret);

    Ok(Keypair {
        private_key: BASE64.encode(secret.as_bytes()),
        public_key: BASE64.encode(public.as_bytes()),
    })
}

/// Generate a preshared key (32 random bytes, Base64 encoded)
///
/// # Errors
///
/// Returns [`KeyError::EntropyFailure`] if the OS RNG fails.
pub fn generate_preshared_key() -> Result<String, KeyError> {
    let mut bytes = [0u8; KEY_LENGTH];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| KeyError::EntropyFailure(e.to_string()))?;
    Ok(BASE64.encode(bytes))
}

/// Derive the public key for a Base64-encoded private key
///
/// # Errors
///
/// Returns [`KeyError::InvalidKey`] if the input is not a Base64-encoded
/// 32-byte value.
pub fn derive_public_key(private_key: &str) -> Result<String, KeyError> {
    let secret = decode_private_key(private_key)?;
    let public = PublicKey::from(&secret);
    Ok(BASE64.encode(public.as_bytes()))
}

/// Validate a Base64-encoded key (private, public, or preshared)
///
/// Returns `true` if the key decodes to exactly 32 bytes.
pub fn validate_key(key: &str) -> bool {
    BASE64
        .decode(key)
        .map(|bytes| bytes.len() == KEY_LENGTH)
        .unwrap_or(false)
}

fn decode_private_key(key: &str) -> Result<StaticSecret, KeyError> {
    let bytes = BASE64
        .decode(key)
        .map_err(|e| KeyError::InvalidKey(format!("invalid Base64: {e}")))?;

    if bytes.len() != KEY_LENGTH {
        return Err(KeyError::InvalidKey(format!(
            "expected {KEY_LENGTH} bytes, got {}",
            bytes.len()
        )));
    }

    let mut key_array = [0u8; KEY_LENGTH];
    key_array.copy_from_slice(&bytes);
    Ok(StaticSecret::from(key_array))
}

/// AES-256-GCM seal for private keys retained at rest
///
/// The master key lives outside the peer store (environment or service
/// configuration), so a dump of stored records alone cannot recover private
/// keys. Sealed output is `Base64(nonce || ciphertext)` with a fresh random
/// nonce per seal.
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    /// Create a seal from a Base64-encoded 32-byte master key
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidMasterKey`] if the key is not 32 bytes, or
    /// [`KeyError::InvalidKey`] if it is not valid Base64.
    pub fn new(master_key: &str) -> Result<Self, KeyError> {
        let bytes = BASE64
            .decode(master_key)
            .map_err(|e| KeyError::InvalidKey(format!("invalid master key Base64: {e}")))?;
        if bytes.len() != KEY_LENGTH {
            return Err(KeyError::InvalidMasterKey(bytes.len()));
        }

        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Generate a fresh random master key, Base64 encoded
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::EntropyFailure`] if the OS RNG fails.
    pub fn generate_master_key() -> Result<String, KeyError> {
        let mut bytes = [0u8; KEY_LENGTH];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| KeyError::EntropyFailure(e.to_string()))?;
        Ok(BASE64.encode(bytes))
    }

    /// Seal a plaintext secret
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::EntropyFailure`] if nonce generation fails, or
    /// [`KeyError::Seal`] if encryption fails.
    pub fn seal(&self, plaintext: &str) -> Result<String, KeyError> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| KeyError::EntropyFailure(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| KeyError::Seal(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Open a sealed secret back to plaintext
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Seal`] if the payload is truncated, was sealed
    /// under a different master key, or has been tampered with.
    pub fn open(&self, sealed: &str) -> Result<String, KeyError> {
        let bytes = BASE64
            .decode(sealed)
            .map_err(|e| KeyError::Seal(format!("invalid Base64: {e}")))?;
        if bytes.len() <= NONCE_LENGTH {
            return Err(KeyError::Seal("payload too short".into()));
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LENGTH);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| KeyError::Seal("authentication failed".into()))?;

        String::from_utf8(plaintext).map_err(|e| KeyError::Seal(e.to_string()))
    }
}
