// Each integration test compiles as a separate binary that includes this module via `mod common;`.
// Not every test binary uses every helper, so Rust emits spurious dead_code warnings.
#![allow(dead_code)]
//! Shared helpers for driver and controller tests.

pub use uncloud_mockwg::MockDevice;

use std::net::SocketAddr;
use uncloud_model::{KeyPair, PublicKey};
use uncloud_wg::{Config, PeerConfig};

/// A driver config for machine `n` with the given peers.
pub fn machine_config(n: u8, peers: Vec<PeerConfig>) -> Config {
    Config {
        keys: KeyPair::generate(),
        listen_port: 51820,
        subnet: format!("10.210.{}.0/24", n).parse().unwrap(),
        management_ip: format!("10.210.{}.1", n).parse().unwrap(),
        peers,
    }
}

/// A peer config for machine `n` with the given endpoints.
pub fn peer_config(n: u8, key: PublicKey, endpoints: &[&str]) -> PeerConfig {
    let all_endpoints: Vec<SocketAddr> = endpoints.iter().map(|e| e.parse().unwrap()).collect();
    PeerConfig {
        public_key: key,
        subnet: Some(format!("10.210.{}.0/24", n).parse().unwrap()),
        management_ip: format!("10.210.{}.1", n).parse().unwrap(),
        endpoint: all_endpoints.first().copied(),
        all_endpoints,
    }
}
