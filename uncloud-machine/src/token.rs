//! Join token.
//!
//! A Base58Check string carrying a machine's tunnel public key and reachable
//! endpoints, handed to an operator so a new machine's client can reach the
//! cluster and register the machine.

use crate::error::MachineError;
use prost::Message;
use std::net::SocketAddr;
use uncloud_api::proto;
use uncloud_model::PublicKey;

/// Version byte for Uncloud tokens (0x55 = 'U')
const TOKEN_VERSION: u8 = 0x55;

/// A parsed join token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterToken {
    pub public_key: PublicKey,
    pub endpoints: Vec<SocketAddr>,
}

impl ClusterToken {
    pub fn new(public_key: PublicKey, endpoints: Vec<SocketAddr>) -> Self {
        Self { public_key, endpoints }
    }

    /// Encode as a Base58Check string with the Uncloud version byte.
    pub fn encode(&self) -> String {
        let payload = proto::ClusterToken {
            public_key: self.public_key.as_ref().to_vec(),
            endpoints: self.endpoints.iter().map(|e| e.to_string()).collect(),
        };
        let bytes = payload.encode_to_vec();
        bs58::encode(bytes).with_check_version(TOKEN_VERSION).into_string()
    }

    /// Parse from a Base58Check string with the Uncloud version byte.
    pub fn parse(input: &str) -> Result<Self, MachineError> {
        let bytes = bs58::decode(input)
            .with_check(Some(TOKEN_VERSION))
            .into_vec()
            .map_err(|e| MachineError::Token(e.to_string()))?;

        // Skip the version byte when decoding the protobuf payload.
        let payload_bytes =
            bytes.get(1..).ok_or_else(|| MachineError::Token("token too short".into()))?;
        let payload = proto::ClusterToken::decode(payload_bytes)
            .map_err(|e| MachineError::Token(format!("decode payload: {e}")))?;

        let public_key = PublicKey::try_from(payload.public_key.as_slice())
            .map_err(|_| MachineError::Token("invalid public key length".into()))?;
        let endpoints = payload
            .endpoints
            .iter()
            .map(|e| {
                e.parse().map_err(|_| MachineError::Token(format!("invalid endpoint {e:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { public_key, endpoints })
    }
}

impl std::fmt::Display for ClusterToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_parse_round_trip() {
        let token = ClusterToken::new(
            PublicKey([9; 32]),
            vec!["203.0.113.5:51820".parse().unwrap(), "192.168.1.10:51820".parse().unwrap()],
        );
        let encoded = token.encode();
        let parsed = ClusterToken::parse(&encoded).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let token = ClusterToken::new(PublicKey([9; 32]), vec![]);
        let mut encoded = token.encode();
        // Flip a character; the Base58Check checksum must catch it.
        let flipped = if encoded.ends_with('1') { 'z' } else { '1' };
        encoded.pop();
        encoded.push(flipped);
        assert!(ClusterToken::parse(&encoded).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(ClusterToken::parse("not-a-token").is_err());
    }
}
