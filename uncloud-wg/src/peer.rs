//! Per-peer liveness tracking and endpoint rotation.
//!
//! A peer is up while the tunnel sees recent handshakes. When a peer goes
//! down and has more than one candidate endpoint, the control loop rotates
//! through the candidates round-robin until one produces a handshake.

use crate::device::{host_prefix, DevicePeer};
use ipnet::{IpNet, Ipv4Net};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant, SystemTime};
use uncloud_model::PublicKey;

/// How long a fresh endpoint may stay silent before the peer counts as
/// unreachable through it.
pub const REJECTED_THRESHOLD: Duration = Duration::from_secs(30);

/// A handshake younger than this means the peer is healthy (standard tunnel
/// keepalive semantics).
pub const UP_THRESHOLD: Duration = Duration::from_secs(180);

/// Minimum time between endpoint changes for one peer.
pub const ROTATE_INTERVAL: Duration = Duration::from_secs(5);

/// Derived liveness of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Up,
    Down,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => f.write_str("up"),
            Self::Down => f.write_str("down"),
        }
    }
}

/// Authoritative configuration for one peer, derived from the cluster roster.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerConfig {
    pub public_key: PublicKey,
    /// The peer's machine subnet; absent for peers that only expose a
    /// management address.
    pub subnet: Option<Ipv4Net>,
    pub management_ip: IpAddr,
    /// All advertised candidate endpoints.
    pub all_endpoints: Vec<SocketAddr>,
    /// The currently selected endpoint; None when the peer has no candidates.
    pub endpoint: Option<SocketAddr>,
}

impl PeerConfig {
    /// Prefixes routable through this peer: its management address and, if
    /// known, its whole machine subnet.
    pub fn prefixes(&self) -> Vec<IpNet> {
        let mut prefixes = vec![host_prefix(self.management_ip)];
        if let Some(subnet) = self.subnet {
            prefixes.push(IpNet::V4(subnet));
        }
        prefixes
    }
}

/// Runtime state for one peer of the local machine.
#[derive(Debug)]
pub(crate) struct Peer {
    pub(crate) config: PeerConfig,
    last_handshake: Option<SystemTime>,
    last_endpoint_change: Instant,
}

impl Peer {
    pub(crate) fn new(config: PeerConfig, device: Option<&DevicePeer>) -> Self {
        Self::new_at(config, device, Instant::now())
    }

    /// Build a peer, reconstructing handshake state from the device when the
    /// daemon restarted with the tunnel still configured.
    pub(crate) fn new_at(
        mut config: PeerConfig,
        device: Option<&DevicePeer>,
        now: Instant,
    ) -> Self {
        let mut last_handshake = None;
        if let Some(dev) = device {
            last_handshake = dev.last_handshake;
            if config.endpoint.is_none() {
                config.endpoint = dev.endpoint;
            }
        }
        Self { config, last_handshake, last_endpoint_change: now }
    }

    pub(crate) fn status(&self) -> PeerStatus {
        self.status_at(Instant::now(), SystemTime::now())
    }

    pub(crate) fn status_at(&self, now: Instant, sys_now: SystemTime) -> PeerStatus {
        match self.last_handshake {
            Some(handshake) => match sys_now.duration_since(handshake) {
                Ok(age) if age < UP_THRESHOLD => PeerStatus::Up,
                // A handshake in the future means clock adjustment; count it
                // as fresh rather than flapping the peer.
                Err(_) => PeerStatus::Up,
                Ok(_) => PeerStatus::Down,
            },
            // Never any handshake: the current endpoint still gets its probe
            // window before the peer is written off.
            None => {
                if now.duration_since(self.last_endpoint_change) < REJECTED_THRESHOLD {
                    PeerStatus::Up
                } else {
                    PeerStatus::Down
                }
            }
        }
    }

    /// The next endpoint to try, if this peer is due for a rotation.
    ///
    /// Rotates only while down, at most once per [`ROTATE_INTERVAL`], and only
    /// when there is another candidate to rotate to.
    pub(crate) fn should_change_endpoint(&self) -> Option<SocketAddr> {
        self.should_change_endpoint_at(Instant::now(), SystemTime::now())
    }

    pub(crate) fn should_change_endpoint_at(
        &self,
        now: Instant,
        sys_now: SystemTime,
    ) -> Option<SocketAddr> {
        if self.config.all_endpoints.len() < 2 {
            return None;
        }
        if self.status_at(now, sys_now) != PeerStatus::Down {
            return None;
        }
        if now.duration_since(self.last_endpoint_change) < ROTATE_INTERVAL {
            return None;
        }
        let current = self
            .config
            .endpoint
            .and_then(|ep| self.config.all_endpoints.iter().position(|e| *e == ep))
            .unwrap_or(0);
        let next = self.config.all_endpoints[(current + 1) % self.config.all_endpoints.len()];
        if Some(next) == self.config.endpoint {
            return None;
        }
        Some(next)
    }

    /// Merge an authoritative config. Returns true when the selected endpoint
    /// changed.
    pub(crate) fn update_config(&mut self, new: PeerConfig) -> bool {
        self.update_config_at(new, Instant::now())
    }

    pub(crate) fn update_config_at(&mut self, new: PeerConfig, now: Instant) -> bool {
        let changed = new.endpoint != self.config.endpoint;
        self.config = new;
        if changed {
            self.last_endpoint_change = now;
        }
        changed
    }

    /// Reconcile with what the kernel reports. Returns true when the kernel's
    /// observed endpoint (source of the last received packet) differs from the
    /// stored one, meaning the peer roamed and we adopt its new address.
    pub(crate) fn update_from_device(&mut self, device: &DevicePeer) -> bool {
        self.update_from_device_at(device, Instant::now())
    }

    pub(crate) fn update_from_device_at(&mut self, device: &DevicePeer, now: Instant) -> bool {
        self.last_handshake = device.last_handshake;
        if let Some(observed) = device.endpoint {
            if Some(observed) != self.config.endpoint {
                self.config.endpoint = Some(observed);
                self.last_endpoint_change = now;
                return true;
            }
        }
        false
    }

    pub(crate) fn last_handshake(&self) -> Option<SystemTime> {
        self.last_handshake
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn config(endpoints: &[&str]) -> PeerConfig {
        PeerConfig {
            public_key: PublicKey([7; 32]),
            subnet: Some("10.210.1.0/24".parse().unwrap()),
            management_ip: "10.210.1.1".parse().unwrap(),
            all_endpoints: endpoints.iter().map(|e| endpoint(e)).collect(),
            endpoint: endpoints.first().map(|e| endpoint(e)),
        }
    }

    #[test]
    fn fresh_peer_probes_before_going_down() {
        let now = Instant::now();
        let sys = SystemTime::now();
        let peer = Peer::new_at(config(&["192.0.2.1:51820", "192.0.2.2:51820"]), None, now);

        assert_eq!(peer.status_at(now + Duration::from_secs(29), sys), PeerStatus::Up);
        assert_eq!(peer.status_at(now + Duration::from_secs(30), sys), PeerStatus::Down);
    }

    #[test]
    fn recent_handshake_means_up() {
        let now = Instant::now();
        let sys = SystemTime::now();
        let mut peer = Peer::new_at(config(&["192.0.2.1:51820"]), None, now);
        peer.update_from_device_at(
            &DevicePeer {
                public_key: PublicKey([7; 32]),
                endpoint: Some(endpoint("192.0.2.1:51820")),
                last_handshake: Some(sys),
                allowed_ips: vec![],
            },
            now,
        );

        assert_eq!(peer.status_at(now, sys + Duration::from_secs(179)), PeerStatus::Up);
        assert_eq!(peer.status_at(now, sys + Duration::from_secs(180)), PeerStatus::Down);
    }

    #[test]
    fn rotation_waits_for_probe_window_then_picks_next() {
        let now = Instant::now();
        let sys = SystemTime::now();
        let peer = Peer::new_at(config(&["192.0.2.1:51820", "192.0.2.2:51820"]), None, now);

        // Still probing the first endpoint.
        assert_eq!(peer.should_change_endpoint_at(now + Duration::from_secs(10), sys), None);
        // Probe window over: peer is down, rotation is due.
        assert_eq!(
            peer.should_change_endpoint_at(now + Duration::from_secs(31), sys),
            Some(endpoint("192.0.2.2:51820"))
        );
    }

    #[test]
    fn rotation_round_robins_through_candidates() {
        let now = Instant::now();
        let sys = SystemTime::now();
        let mut peer = Peer::new_at(
            config(&["192.0.2.1:51820", "192.0.2.2:51820", "192.0.2.3:51820"]),
            None,
            now,
        );

        let t1 = now + Duration::from_secs(31);
        let next = peer.should_change_endpoint_at(t1, sys).unwrap();
        assert_eq!(next, endpoint("192.0.2.2:51820"));
        let mut new_config = peer.config.clone();
        new_config.endpoint = Some(next);
        assert!(peer.update_config_at(new_config, t1));

        let t2 = t1 + Duration::from_secs(31);
        assert_eq!(peer.should_change_endpoint_at(t2, sys), Some(endpoint("192.0.2.3:51820")));
    }

    #[test]
    fn no_rotation_while_up() {
        let now = Instant::now();
        let sys = SystemTime::now();
        let mut peer = Peer::new_at(config(&["192.0.2.1:51820", "192.0.2.2:51820"]), None, now);
        peer.update_from_device_at(
            &DevicePeer {
                public_key: PublicKey([7; 32]),
                endpoint: Some(endpoint("192.0.2.1:51820")),
                last_handshake: Some(sys),
                allowed_ips: vec![],
            },
            now,
        );

        assert_eq!(peer.should_change_endpoint_at(now + Duration::from_secs(3600), sys), None);
    }

    #[test]
    fn no_rotation_with_single_candidate() {
        let now = Instant::now();
        let sys = SystemTime::now();
        let peer = Peer::new_at(config(&["192.0.2.1:51820"]), None, now);

        assert_eq!(peer.should_change_endpoint_at(now + Duration::from_secs(120), sys), None);
    }

    #[test]
    fn zero_candidates_allowed_with_no_endpoint() {
        let now = Instant::now();
        let sys = SystemTime::now();
        let peer = Peer::new_at(config(&[]), None, now);
        assert_eq!(peer.config.endpoint, None);
        assert_eq!(peer.should_change_endpoint_at(now + Duration::from_secs(120), sys), None);
    }

    #[test]
    fn device_roaming_adopts_observed_endpoint() {
        let now = Instant::now();
        let mut peer = Peer::new_at(config(&["192.0.2.1:51820", "192.0.2.2:51820"]), None, now);

        let changed = peer.update_from_device_at(
            &DevicePeer {
                public_key: PublicKey([7; 32]),
                endpoint: Some(endpoint("198.51.100.9:51820")),
                last_handshake: Some(SystemTime::now()),
                allowed_ips: vec![],
            },
            now,
        );
        assert!(changed);
        assert_eq!(peer.config.endpoint, Some(endpoint("198.51.100.9:51820")));
    }

    #[test]
    fn config_update_with_same_endpoint_is_quiet() {
        let now = Instant::now();
        let mut peer = Peer::new_at(config(&["192.0.2.1:51820"]), None, now);
        assert!(!peer.update_config_at(config(&["192.0.2.1:51820"]), now));
    }

    #[test]
    fn restart_reconstruction_keeps_handshake() {
        let now = Instant::now();
        let sys = SystemTime::now();
        let handshake = sys - Duration::from_secs(20);
        let peer = Peer::new_at(
            config(&["192.0.2.1:51820"]),
            Some(&DevicePeer {
                public_key: PublicKey([7; 32]),
                endpoint: Some(endpoint("192.0.2.1:51820")),
                last_handshake: Some(handshake),
                allowed_ips: vec![],
            }),
            now,
        );

        assert_eq!(peer.last_handshake(), Some(handshake));
        assert_eq!(peer.status_at(now, sys), PeerStatus::Up);
    }
}
