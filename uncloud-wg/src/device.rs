//! Tunnel device abstraction.
//!
//! [`WgDevice`] is the seam between the mesh driver's reconciliation logic and
//! the kernel: the real implementation programs the WireGuard device and the
//! link's addresses and routes over netlink, while tests substitute an
//! in-memory device.

use crate::error::WgError;
use async_trait::async_trait;
use ipnet::IpNet;
use std::net::SocketAddr;
use std::time::SystemTime;
use uncloud_model::{KeyPair, PublicKey};

/// A change set for the tunnel device, applied atomically.
#[derive(Clone, Debug, Default)]
pub struct DeviceConfig {
    pub private_key: Option<KeyPair>,
    pub listen_port: Option<u16>,
    /// Replace the whole peer set instead of patching it. Never set on an
    /// incremental apply: it resets handshake state for every peer.
    pub replace_peers: bool,
    pub peers: Vec<PeerPatch>,
}

/// A per-peer change within a [`DeviceConfig`].
#[derive(Clone, Debug)]
pub struct PeerPatch {
    pub public_key: PublicKey,
    /// Remove the peer from the device.
    pub remove: bool,
    /// Only update an existing peer; never create one.
    pub update_only: bool,
    pub endpoint: Option<SocketAddr>,
    /// Replace the peer's allowed IPs with `allowed_ips`. When false the
    /// device keeps whatever it has (used for endpoint-only patches).
    pub replace_allowed_ips: bool,
    pub allowed_ips: Vec<IpNet>,
}

impl PeerPatch {
    /// An endpoint-only patch for an existing peer.
    pub fn endpoint_only(public_key: PublicKey, endpoint: SocketAddr) -> Self {
        Self {
            public_key,
            remove: false,
            update_only: true,
            endpoint: Some(endpoint),
            replace_allowed_ips: false,
            allowed_ips: Vec::new(),
        }
    }
}

/// What the kernel currently knows about the device.
#[derive(Clone, Debug, Default)]
pub struct DeviceState {
    pub listen_port: Option<u16>,
    pub peers: Vec<DevicePeer>,
}

/// A peer as reported by the kernel.
#[derive(Clone, Debug)]
pub struct DevicePeer {
    pub public_key: PublicKey,
    /// Source address of the last packet received from the peer.
    pub endpoint: Option<SocketAddr>,
    pub last_handshake: Option<SystemTime>,
    pub allowed_ips: Vec<IpNet>,
}

/// Kernel-facing operations the mesh driver needs.
#[async_trait]
pub trait WgDevice: Send + Sync {
    /// Create the tunnel link if it doesn't exist yet.
    async fn ensure_link(&self) -> Result<(), WgError>;

    /// Read the device's current peers and listen port.
    async fn read_state(&self) -> Result<DeviceState, WgError>;

    /// Apply a device change set.
    async fn apply(&self, config: DeviceConfig) -> Result<(), WgError>;

    /// Addresses currently assigned to the link.
    async fn addresses(&self) -> Result<Vec<IpNet>, WgError>;

    async fn add_address(&self, addr: IpNet) -> Result<(), WgError>;

    async fn remove_address(&self, addr: IpNet) -> Result<(), WgError>;

    /// Bring the link up. Idempotent.
    async fn link_up(&self) -> Result<(), WgError>;

    /// Destination prefixes currently routed via the link.
    async fn routes(&self) -> Result<Vec<IpNet>, WgError>;

    async fn add_route(&self, dst: IpNet) -> Result<(), WgError>;

    async fn remove_route(&self, dst: IpNet) -> Result<(), WgError>;

    /// Delete the tunnel link.
    async fn delete_link(&self) -> Result<(), WgError>;
}

/// A /32 (or /128) prefix covering exactly the given address.
pub fn host_prefix(ip: std::net::IpAddr) -> IpNet {
    let len = if ip.is_ipv4() { 32 } else { 128 };
    IpNet::new(ip, len).expect("host prefix length is always valid")
}
