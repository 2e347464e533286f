//! Key pairs, Diffie-Hellman curves and hashing helpers.
//!
//! Two curves are available to the handshake:
//!
//! - [`Ed25519`]: the default. Static identities are plain Ed25519 signing
//!   keys; Diffie-Hellman is computed on the Edwards form of the same keys,
//!   so a peer's identity key doubles as its handshake key.
//! - [`X25519`]: Montgomery-form keys, matching the standard `25519` Noise
//!   curve name.

use std::fmt;

use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::traits::IsIdentity;
use ed25519_dalek::SigningKey;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{ProtocolError, Result};

/// Length of a public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of a key seed in bytes.
pub const SEED_LENGTH: usize = 32;

/// Length of a Diffie-Hellman output in bytes.
pub const DH_LENGTH: usize = 32;

/// A static or ephemeral key pair.
///
/// The secret half is zeroized when the key pair is dropped.
#[derive(Clone)]
pub struct KeyPair {
    public_key: [u8; PUBLIC_KEY_LENGTH],
    secret_key: Zeroizing<Vec<u8>>,
}

impl KeyPair {
    /// Creates a key pair from raw parts.
    pub fn new(public_key: [u8; PUBLIC_KEY_LENGTH], secret_key: Vec<u8>) -> Self {
        Self {
            public_key,
            secret_key: Zeroizing::new(secret_key),
        }
    }

    /// Generates a random Ed25519 key pair.
    pub fn generate() -> Self {
        Ed25519::generate_keypair()
    }

    /// Derives an Ed25519 key pair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; SEED_LENGTH]) -> Self {
        Ed25519::keypair_from_seed(seed)
    }

    /// Returns the public key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.public_key
    }

    /// Returns the secret key bytes.
    pub fn secret_key(&self) -> &[u8] {
        &self.secret_key
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .field("secret_key", &"[redacted]")
            .finish()
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
    }
}

impl Eq for KeyPair {}

/// A Diffie-Hellman function usable by the Noise handshake.
pub trait Curve: Send + Sync + 'static {
    /// Curve name as it appears in the Noise protocol name.
    const NAME: &'static str;

    /// Length of the secret key held in a [`KeyPair`] for this curve.
    const SECRET_KEY_LENGTH: usize;

    /// Generates a fresh random key pair.
    fn generate_keypair() -> KeyPair {
        let mut seed = Zeroizing::new([0u8; SEED_LENGTH]);
        OsRng.fill_bytes(&mut seed[..]);
        Self::keypair_from_seed(&seed)
    }

    /// Derives a key pair deterministically from a seed.
    fn keypair_from_seed(seed: &[u8; SEED_LENGTH]) -> KeyPair;

    /// Computes the shared secret between a local key pair and a remote public key.
    fn dh(local: &KeyPair, remote_public: &[u8; PUBLIC_KEY_LENGTH]) -> Result<[u8; DH_LENGTH]>;
}

/// Diffie-Hellman over Ed25519 keys.
///
/// Secret keys are 64 bytes: the seed followed by the public key, the same
/// layout as an expanded Ed25519 signing key pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519;

impl Curve for Ed25519 {
    const NAME: &'static str = "Ed25519";
    const SECRET_KEY_LENGTH: usize = 64;

    fn keypair_from_seed(seed: &[u8; SEED_LENGTH]) -> KeyPair {
        let signing_key = SigningKey::from_bytes(seed);
        KeyPair::new(
            signing_key.verifying_key().to_bytes(),
            signing_key.to_keypair_bytes().to_vec(),
        )
    }

    fn dh(local: &KeyPair, remote_public: &[u8; PUBLIC_KEY_LENGTH]) -> Result<[u8; DH_LENGTH]> {
        if local.secret_key().len() != Self::SECRET_KEY_LENGTH {
            return Err(ProtocolError::Encryption(format!(
                "ed25519 secret key must be {} bytes, got {}",
                Self::SECRET_KEY_LENGTH,
                local.secret_key().len()
            )));
        }

        let point = CompressedEdwardsY(*remote_public)
            .decompress()
            .ok_or_else(|| ProtocolError::InvalidPublicKey("not a valid edwards point".into()))?;
        if point.is_small_order() {
            return Err(ProtocolError::InvalidPublicKey("small order point".into()));
        }

        let digest = Sha512::digest(&local.secret_key()[..SEED_LENGTH]);
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&digest[..32]);
        let shared = point.mul_clamped(scalar);
        scalar.zeroize();

        if shared.is_identity() {
            return Err(ProtocolError::InvalidPublicKey(
                "shared secret is the identity".into(),
            ));
        }
        Ok(shared.compress().to_bytes())
    }
}

/// Diffie-Hellman over Curve25519 in Montgomery form.
#[derive(Debug, Clone, Copy, Default)]
pub struct X25519;

impl Curve for X25519 {
    const NAME: &'static str = "25519";
    const SECRET_KEY_LENGTH: usize = 32;

    fn keypair_from_seed(seed: &[u8; SEED_LENGTH]) -> KeyPair {
        let secret = x25519_dalek::StaticSecret::from(*seed);
        let public = x25519_dalek::PublicKey::from(&secret);
        KeyPair::new(public.to_bytes(), seed.to_vec())
    }

    fn dh(local: &KeyPair, remote_public: &[u8; PUBLIC_KEY_LENGTH]) -> Result<[u8; DH_LENGTH]> {
        let bytes: [u8; 32] = local.secret_key().try_into().map_err(|_| {
            ProtocolError::Encryption(format!(
                "x25519 secret key must be {} bytes, got {}",
                Self::SECRET_KEY_LENGTH,
                local.secret_key().len()
            ))
        })?;
        let secret = x25519_dalek::StaticSecret::from(bytes);
        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(*remote_public));
        if !shared.was_contributory() {
            return Err(ProtocolError::InvalidPublicKey(
                "non-contributory public key".into(),
            ));
        }
        Ok(shared.to_bytes())
    }
}

/// Derives `count` domain separation labels from a namespace name.
///
/// Label `i` is `SHA-256(SHA-256(name) || i)`.
pub fn namespace(name: &[u8], count: u8) -> Vec<[u8; 32]> {
    let ns = Sha256::digest(name);
    (0..count)
        .map(|i| {
            let mut hasher = Sha256::new();
            hasher.update(ns);
            hasher.update([i]);
            hasher.finalize().into()
        })
        .collect()
}

/// Keyed hash (HMAC-SHA256) of `message` under `key`.
pub fn keyed_hash(key: &[u8], message: &[u8]) -> Result<[u8; 32]> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| ProtocolError::Encryption(format!("invalid hmac key: {}", e)))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

/// Fills a fresh array with random bytes from the operating system.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}
