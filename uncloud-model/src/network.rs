//! Per-machine overlay network configuration and subnet math.
//!
//! Every machine owns a /24-or-finer slice of the cluster CIDR. The first
//! usable address of the slice is the management IP the control plane listens
//! on; the remaining addresses are free for workloads on that machine.

use crate::types::PublicKey;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Default tunnel listen port.
pub const WG_PORT: u16 = 51820;

/// Prefix length of the slice each machine gets from the cluster CIDR.
pub const MACHINE_SUBNET_BITS: u8 = 24;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("management IP {ip} is outside machine subnet {subnet}")]
    ManagementIpOutsideSubnet { ip: IpAddr, subnet: Ipv4Net },

    #[error("cluster network {0} has no free /{MACHINE_SUBNET_BITS} subnet left")]
    SubnetsExhausted(Ipv4Net),

    #[error("cluster network {0} is smaller than a /{MACHINE_SUBNET_BITS}")]
    NetworkTooSmall(Ipv4Net),

    #[error("subnet {0} has no usable addresses")]
    EmptySubnet(Ipv4Net),
}

/// The network identity a machine carries on the overlay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Slice of the cluster CIDR assigned to this machine. Pairwise disjoint
    /// across machines.
    pub subnet: Ipv4Net,
    /// Control-plane address, the first usable address of `subnet`.
    pub management_ip: IpAddr,
    /// Candidate endpoints peers may use to reach the tunnel listener.
    pub endpoints: Vec<SocketAddr>,
    /// Tunnel public key.
    pub public_key: PublicKey,
}

impl NetworkConfig {
    /// Check the management IP lies within the machine subnet.
    pub fn validate(&self) -> Result<(), NetworkError> {
        match self.management_ip {
            IpAddr::V4(ip) if self.subnet.contains(&ip) => Ok(()),
            ip => Err(NetworkError::ManagementIpOutsideSubnet { ip, subnet: self.subnet }),
        }
    }
}

/// The management IP for a machine subnet: its first usable address.
pub fn management_ip(subnet: Ipv4Net) -> Result<IpAddr, NetworkError> {
    subnet
        .hosts()
        .next()
        .map(IpAddr::V4)
        .ok_or(NetworkError::EmptySubnet(subnet))
}

/// Allocate the first free machine subnet from the cluster CIDR.
///
/// Returned subnets are disjoint from every subnet in `taken`.
pub fn allocate_subnet(cidr: Ipv4Net, taken: &[Ipv4Net]) -> Result<Ipv4Net, NetworkError> {
    let candidates = cidr
        .subnets(MACHINE_SUBNET_BITS)
        .map_err(|_| NetworkError::NetworkTooSmall(cidr))?;
    for candidate in candidates {
        let overlaps = taken.iter().any(|t| {
            t.contains(&candidate.network()) || candidate.contains(&t.network())
        });
        if !overlaps {
            return Ok(candidate);
        }
    }
    Err(NetworkError::SubnetsExhausted(cidr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn first_subnet_and_management_ip() {
        let subnet = allocate_subnet(net("10.210.0.0/16"), &[]).unwrap();
        assert_eq!(subnet, net("10.210.0.0/24"));
        assert_eq!(management_ip(subnet).unwrap(), "10.210.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn next_free_subnet_skips_taken() {
        let cidr = net("10.210.0.0/16");
        let taken = vec![net("10.210.0.0/24"), net("10.210.2.0/24")];
        assert_eq!(allocate_subnet(cidr, &taken).unwrap(), net("10.210.1.0/24"));

        let taken = vec![net("10.210.0.0/24"), net("10.210.1.0/24")];
        assert_eq!(allocate_subnet(cidr, &taken).unwrap(), net("10.210.2.0/24"));
    }

    #[test]
    fn allocated_subnets_stay_disjoint() {
        let cidr = net("10.210.0.0/22");
        let mut taken = Vec::new();
        while let Ok(subnet) = allocate_subnet(cidr, &taken) {
            for t in &taken {
                assert!(!t.contains(&subnet.network()));
                assert!(!subnet.contains(&t.network()));
            }
            taken.push(subnet);
        }
        // A /22 holds exactly four /24 slices.
        assert_eq!(taken.len(), 4);
    }

    #[test]
    fn exhausted_network_errors() {
        let cidr = net("10.210.0.0/24");
        let taken = vec![net("10.210.0.0/24")];
        assert!(matches!(
            allocate_subnet(cidr, &taken),
            Err(NetworkError::SubnetsExhausted(_))
        ));
    }

    #[test]
    fn validate_management_ip_membership() {
        let config = NetworkConfig {
            subnet: net("10.210.1.0/24"),
            management_ip: "10.210.1.1".parse().unwrap(),
            endpoints: vec![],
            public_key: PublicKey::default(),
        };
        assert!(config.validate().is_ok());

        let bad = NetworkConfig { management_ip: "10.210.2.1".parse().unwrap(), ..config };
        assert!(bad.validate().is_err());
    }
}
