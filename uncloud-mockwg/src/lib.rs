//! In-memory tunnel device.
//!
//! Implements [`WgDevice`] without touching the kernel, recording every
//! mutation so tests can assert on reconciliation behavior: what the driver
//! added, removed, and whether it ever reset peer handshake state.

use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::SystemTime;
use uncloud_model::PublicKey;
use uncloud_wg::device::{DeviceConfig, DevicePeer, DeviceState, WgDevice};
use uncloud_wg::WgError;

#[derive(Default)]
pub struct MockState {
    pub link_exists: bool,
    pub link_up: bool,
    pub listen_port: Option<u16>,
    pub peers: HashMap<PublicKey, DevicePeer>,
    pub addresses: Vec<IpNet>,
    pub routes: Vec<IpNet>,
    /// Counters for churn assertions.
    pub applies: usize,
    pub replace_peers_seen: bool,
    pub handshake_resets: usize,
    pub address_ops: usize,
    pub route_ops: usize,
}

/// An in-memory [`WgDevice`] recording every mutation.
#[derive(Default)]
pub struct MockDevice {
    pub state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a kernel peer, as if configured before a daemon restart.
    pub fn seed_peer(
        &self,
        public_key: PublicKey,
        endpoint: Option<SocketAddr>,
        last_handshake: Option<SystemTime>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.link_exists = true;
        state.peers.insert(
            public_key,
            DevicePeer { public_key, endpoint, last_handshake, allowed_ips: vec![] },
        );
    }

    pub fn seed_address(&self, addr: IpNet) {
        let mut state = self.state.lock().unwrap();
        state.link_exists = true;
        state.addresses.push(addr);
    }

    /// Mark a peer as having completed a handshake just now.
    pub fn set_handshake(&self, key: &PublicKey, at: SystemTime) {
        let mut state = self.state.lock().unwrap();
        if let Some(peer) = state.peers.get_mut(key) {
            peer.last_handshake = Some(at);
        }
    }

    pub fn peer(&self, key: &PublicKey) -> Option<DevicePeer> {
        self.state.lock().unwrap().peers.get(key).cloned()
    }

    pub fn peer_keys(&self) -> Vec<PublicKey> {
        let mut keys: Vec<PublicKey> = self.state.lock().unwrap().peers.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn routes(&self) -> Vec<IpNet> {
        let mut routes = self.state.lock().unwrap().routes.clone();
        routes.sort();
        routes
    }

    pub fn addresses(&self) -> Vec<IpNet> {
        let mut addrs = self.state.lock().unwrap().addresses.clone();
        addrs.sort();
        addrs
    }
}

#[async_trait]
impl WgDevice for MockDevice {
    async fn ensure_link(&self) -> Result<(), WgError> {
        self.state.lock().unwrap().link_exists = true;
        Ok(())
    }

    async fn read_state(&self) -> Result<DeviceState, WgError> {
        let state = self.state.lock().unwrap();
        Ok(DeviceState {
            listen_port: state.listen_port,
            peers: state.peers.values().cloned().collect(),
        })
    }

    async fn apply(&self, config: DeviceConfig) -> Result<(), WgError> {
        let mut state = self.state.lock().unwrap();
        state.applies += 1;
        if config.replace_peers {
            state.replace_peers_seen = true;
            state.peers.clear();
        }
        if let Some(port) = config.listen_port {
            state.listen_port = Some(port);
        }
        for patch in &config.peers {
            if patch.remove {
                state.peers.remove(&patch.public_key);
                continue;
            }
            match state.peers.get_mut(&patch.public_key) {
                Some(peer) => {
                    if let Some(endpoint) = patch.endpoint {
                        peer.endpoint = Some(endpoint);
                    }
                    if patch.replace_allowed_ips {
                        peer.allowed_ips = patch.allowed_ips.clone();
                    }
                }
                None => {
                    if patch.update_only {
                        continue;
                    }
                    // Creating a peer resets its handshake state, which is
                    // what the driver must avoid for existing peers.
                    state.handshake_resets += 1;
                    state.peers.insert(
                        patch.public_key,
                        DevicePeer {
                            public_key: patch.public_key,
                            endpoint: patch.endpoint,
                            last_handshake: None,
                            allowed_ips: patch.allowed_ips.clone(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn addresses(&self) -> Result<Vec<IpNet>, WgError> {
        Ok(self.state.lock().unwrap().addresses.clone())
    }

    async fn add_address(&self, addr: IpNet) -> Result<(), WgError> {
        let mut state = self.state.lock().unwrap();
        state.address_ops += 1;
        if !state.addresses.contains(&addr) {
            state.addresses.push(addr);
        }
        Ok(())
    }

    async fn remove_address(&self, addr: IpNet) -> Result<(), WgError> {
        let mut state = self.state.lock().unwrap();
        state.address_ops += 1;
        state.addresses.retain(|a| *a != addr);
        Ok(())
    }

    async fn link_up(&self) -> Result<(), WgError> {
        self.state.lock().unwrap().link_up = true;
        Ok(())
    }

    async fn routes(&self) -> Result<Vec<IpNet>, WgError> {
        Ok(self.state.lock().unwrap().routes.clone())
    }

    async fn add_route(&self, dst: IpNet) -> Result<(), WgError> {
        let mut state = self.state.lock().unwrap();
        state.route_ops += 1;
        if !state.routes.contains(&dst) {
            state.routes.push(dst);
        }
        Ok(())
    }

    async fn remove_route(&self, dst: IpNet) -> Result<(), WgError> {
        let mut state = self.state.lock().unwrap();
        state.route_ops += 1;
        state.routes.retain(|r| *r != dst);
        Ok(())
    }

    async fn delete_link(&self) -> Result<(), WgError> {
        let mut state = self.state.lock().unwrap();
        state.link_exists = false;
        state.peers.clear();
        state.addresses.clear();
        state.routes.clear();
        Ok(())
    }
}
