//! Strong types for identities on the overlay network.

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 32-byte Curve25519 public key identifying a machine's tunnel endpoint.
///
/// Displayed and serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// Returns the inner bytes as a slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self, String> {
        let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {}", e))?;
        Self::try_from(bytes.as_slice())
            .map_err(|_| format!("expected 64 hex characters, got {}", hex_str.len()))
    }
}

impl From<[u8; 32]> for PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<PublicKey> for [u8; 32] {
    fn from(key: PublicKey) -> [u8; 32] {
        key.0
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = std::array::TryFromSliceError;
    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(<[u8; 32]>::try_from(slice)?))
    }
}

impl TryFrom<Vec<u8>> for PublicKey {
    type Error = Vec<u8>;
    fn try_from(vec: Vec<u8>) -> Result<Self, Self::Error> {
        if vec.len() != 32 {
            return Err(vec);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&vec);
        Ok(Self(arr))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Opaque machine identifier, assigned at cluster init or join.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(String);

impl MachineId {
    /// Generate a fresh random identifier (32 hex characters).
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MachineId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MachineId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachineId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_hex_round_trip() {
        let key = PublicKey([0xab; 32]);
        let expected = "ab".repeat(32);
        assert_eq!(format!("{}", key), expected);
        assert_eq!(PublicKey::from_hex(&expected).unwrap(), key);
        assert_eq!(format!("{:?}", key), format!("PublicKey({})", expected));
    }

    #[test]
    fn public_key_rejects_bad_hex() {
        assert!(PublicKey::from_hex("zz").is_err());
        assert!(PublicKey::from_hex("abcd").is_err());
    }

    #[test]
    fn public_key_serde_as_hex_string() {
        let key = PublicKey([0x01; 32]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn machine_id_generate_unique() {
        let a = MachineId::generate();
        let b = MachineId::generate();
        assert_eq!(a.as_str().len(), 32);
        assert_ne!(a, b);
    }
}
