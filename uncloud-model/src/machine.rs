//! Machine records and membership states.

use crate::network::NetworkConfig;
use crate::types::MachineId;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Membership state of a machine as seen by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipState {
    /// Machine is reachable.
    Up,
    /// One observer believes the machine is down; not yet confirmed.
    Suspect,
    /// Machine is confirmed unreachable.
    Down,
}

impl MembershipState {
    /// Suspect machines still route as Up until the suspicion resolves.
    pub fn routable(&self) -> bool {
        matches!(self, Self::Up | Self::Suspect)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Suspect => "suspect",
            Self::Down => "down",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Self::Up),
            "suspect" => Some(Self::Suspect),
            "down" => Some(Self::Down),
            _ => None,
        }
    }
}

impl std::fmt::Display for MembershipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A machine in the cluster roster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub id: MachineId,
    pub name: String,
    /// Public address, if the machine has one.
    pub public_ip: Option<IpAddr>,
    pub network: NetworkConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspect_routes_as_up() {
        assert!(MembershipState::Up.routable());
        assert!(MembershipState::Suspect.routable());
        assert!(!MembershipState::Down.routable());
    }

    #[test]
    fn state_string_round_trip() {
        for state in [MembershipState::Up, MembershipState::Suspect, MembershipState::Down] {
            assert_eq!(MembershipState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(MembershipState::from_str("bogus"), None);
    }
}
