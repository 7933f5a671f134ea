//! Tunnel keypair
//!
//! Each machine has a Curve25519 keypair for the overlay tunnel:
//! - Private key: stored locally in the machine state, never shared
//! - Public key: advertised to peers as the machine's tunnel identity

use crate::types::PublicKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

/// Errors from keypair persistence.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// A machine's Curve25519 tunnel keypair.
///
/// Serializes as the hex-encoded private key; the public key is derived.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self { secret: StaticSecret::random_from_rng(OsRng) }
    }

    /// Build a keypair from raw private key bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self { secret: StaticSecret::from(bytes) }
    }

    /// The public half, shared with peers.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.secret).to_bytes())
    }

    /// Raw private key bytes, wiped when the wrapper drops.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Load a keypair from a key file, or generate and save if it doesn't exist.
    /// Returns (keypair, is_new).
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<(Self, bool), KeyError> {
        let path = path.as_ref();
        if path.exists() {
            Ok((Self::load(path)?, false))
        } else {
            let keys = Self::generate();
            keys.save(path)?;
            Ok((keys, true))
        }
    }

    /// Load a keypair from a key file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        let bytes = Zeroizing::new(fs::read(path)?);
        if bytes.len() != 32 {
            return Err(KeyError::InvalidKeyLength(bytes.len()));
        }
        let mut key_bytes = Zeroizing::new([0u8; 32]);
        key_bytes.copy_from_slice(&bytes);
        Ok(Self::from_secret_bytes(*key_bytes))
    }

    /// Save the private key to a file readable by the owner only.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), KeyError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata()?.permissions();
            perms.set_mode(0o600);
            file.set_permissions(perms)?;
        }
        file.write_all(self.secret_bytes().as_ref())?;
        Ok(())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").field("public_key", &self.public_key()).finish_non_exhaustive()
    }
}

impl Serialize for KeyPair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let hex = Zeroizing::new(hex::encode(self.secret_bytes().as_ref()));
        serializer.serialize_str(&hex)
    }
}

impl<'de> Deserialize<'de> for KeyPair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_str = Zeroizing::new(String::deserialize(deserializer)?);
        let bytes = Zeroizing::new(
            hex::decode(hex_str.as_bytes()).map_err(serde::de::Error::custom)?,
        );
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom(format!(
                "expected 32-byte private key, got {}",
                bytes.len()
            )));
        }
        let mut key_bytes = Zeroizing::new([0u8; 32]);
        key_bytes.copy_from_slice(&bytes);
        Ok(Self::from_secret_bytes(*key_bytes))
    }
}
