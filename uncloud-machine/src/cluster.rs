//! Cluster membership store.
//!
//! The authoritative in-memory roster of machines, plus subnet allocation
//! from the cluster CIDR and the liveness-derived membership state per
//! machine. The store hands out snapshots; persistence and broadcasting are
//! the machine runtime's job.

use crate::error::MachineError;
use crate::membership::MembershipTracker;
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, RwLock};
use uncloud_model::{
    allocate_subnet, management_ip, MachineId, MachineInfo, MembershipState, PublicKey,
};
use uncloud_wg::PeerConfig;

/// In-memory cluster roster and membership state.
pub struct ClusterState {
    /// The cluster CIDR subnets are allocated from; None until init/join.
    network: RwLock<Option<Ipv4Net>>,
    local_id: RwLock<Option<MachineId>>,
    machines: RwLock<HashMap<MachineId, MachineInfo>>,
    tracker: Mutex<MembershipTracker>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self {
            network: RwLock::new(None),
            local_id: RwLock::new(None),
            machines: RwLock::new(HashMap::new()),
            tracker: Mutex::new(MembershipTracker::new()),
        }
    }

    /// Initialize the store for a cluster: CIDR and the local machine id.
    pub fn init(&self, network: Ipv4Net, local_id: MachineId) {
        *self.network.write().unwrap_or_else(|e| e.into_inner()) = Some(network);
        *self.local_id.write().unwrap_or_else(|e| e.into_inner()) = Some(local_id);
    }

    /// Drop all cluster state (machine reset).
    pub fn clear(&self) {
        *self.network.write().unwrap_or_else(|e| e.into_inner()) = None;
        *self.local_id.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.machines.write().unwrap_or_else(|e| e.into_inner()).clear();
        *self.tracker.lock().unwrap_or_else(|e| e.into_inner()) = MembershipTracker::new();
    }

    pub fn network(&self) -> Option<Ipv4Net> {
        *self.network.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn local_id(&self) -> Option<MachineId> {
        self.local_id.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Allocate a roster record for a new machine: fresh id, first free
    /// subnet, management IP.
    pub fn allocate(
        &self,
        name: &str,
        public_ip: Option<IpAddr>,
        endpoints: Vec<SocketAddr>,
        public_key: PublicKey,
    ) -> Result<MachineInfo, MachineError> {
        let network = self
            .network()
            .ok_or(MachineError::NotInitialized)?;
        let machines = self.machines.read().unwrap_or_else(|e| e.into_inner());
        let taken: Vec<Ipv4Net> = machines.values().map(|m| m.network.subnet).collect();
        drop(machines);

        let subnet = allocate_subnet(network, &taken)?;
        let id = MachineId::generate();
        let name = if name.is_empty() {
            format!("machine-{}", &id.as_str()[..8])
        } else {
            name.to_string()
        };

        Ok(MachineInfo {
            id,
            name,
            public_ip,
            network: uncloud_model::NetworkConfig {
                subnet,
                management_ip: management_ip(subnet)?,
                endpoints,
                public_key,
            },
        })
    }

    /// Insert or replace a machine record. Rejects records whose subnet
    /// overlaps another machine's.
    pub fn upsert(&self, info: MachineInfo) -> Result<(), MachineError> {
        info.network.validate()?;
        let mut machines = self.machines.write().unwrap_or_else(|e| e.into_inner());
        let overlapping = machines.values().any(|m| {
            m.id != info.id
                && (m.network.subnet.contains(&info.network.subnet.network())
                    || info.network.subnet.contains(&m.network.subnet.network()))
        });
        if overlapping {
            return Err(MachineError::Network(
                uncloud_model::NetworkError::SubnetsExhausted(info.network.subnet),
            ));
        }
        machines.insert(info.id.clone(), info);
        Ok(())
    }

    pub fn remove(&self, id: &MachineId) -> Option<MachineInfo> {
        let removed = self.machines.write().unwrap_or_else(|e| e.into_inner()).remove(id);
        if removed.is_some() {
            self.tracker.lock().unwrap_or_else(|e| e.into_inner()).forget(id);
        }
        removed
    }

    pub fn get(&self, id: &MachineId) -> Option<MachineInfo> {
        self.machines.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }

    pub fn machine_by_public_key(&self, key: &PublicKey) -> Option<MachineInfo> {
        self.machines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|m| m.network.public_key == *key)
            .cloned()
    }

    /// Roster snapshot with per-machine membership state, sorted by name for
    /// stable output. The local machine is always Up.
    pub fn list(&self) -> Vec<(MachineInfo, MembershipState)> {
        let machines = self.machines.read().unwrap_or_else(|e| e.into_inner());
        let tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        let local_id = self.local_id();

        let mut out: Vec<(MachineInfo, MembershipState)> = machines
            .values()
            .map(|m| {
                let state = if Some(&m.id) == local_id.as_ref() {
                    MembershipState::Up
                } else {
                    tracker.state(&m.id)
                };
                (m.clone(), state)
            })
            .collect();
        out.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        out
    }

    /// All machines except the local one.
    pub fn peers(&self) -> Vec<MachineInfo> {
        let local_id = self.local_id();
        self.machines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|m| Some(&m.id) != local_id.as_ref())
            .cloned()
            .collect()
    }

    /// Management addresses of all peers, for broadcasts.
    pub fn peer_addresses(&self) -> Vec<String> {
        self.peers().iter().map(|m| m.network.management_ip.to_string()).collect()
    }

    /// Tunnel peer configs for every peer, preferring a previously selected
    /// endpoint over the first candidate.
    pub fn peer_configs(
        &self,
        selected_endpoints: &HashMap<String, SocketAddr>,
    ) -> Vec<PeerConfig> {
        self.peers()
            .into_iter()
            .map(|m| {
                let selected = selected_endpoints
                    .get(&m.network.public_key.to_string())
                    .copied()
                    .filter(|ep| m.network.endpoints.contains(ep));
                PeerConfig {
                    public_key: m.network.public_key,
                    subnet: Some(m.network.subnet),
                    management_ip: m.network.management_ip,
                    endpoint: selected.or_else(|| m.network.endpoints.first().copied()),
                    all_endpoints: m.network.endpoints,
                }
            })
            .collect()
    }

    /// Feed one liveness observation into the membership tracker.
    pub fn observe(&self, id: &MachineId, up: bool) -> Option<MembershipState> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner()).observe(id, up)
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ClusterState {
        let state = ClusterState::new();
        state.init("10.210.0.0/16".parse().unwrap(), MachineId::from("local"));
        state
    }

    fn machine(id: &str, subnet: &str, key: u8) -> MachineInfo {
        let subnet: Ipv4Net = subnet.parse().unwrap();
        MachineInfo {
            id: MachineId::from(id),
            name: id.to_string(),
            public_ip: None,
            network: uncloud_model::NetworkConfig {
                subnet,
                management_ip: management_ip(subnet).unwrap(),
                endpoints: vec!["192.0.2.1:51820".parse().unwrap()],
                public_key: PublicKey([key; 32]),
            },
        }
    }

    #[test]
    fn allocations_are_disjoint_with_management_ip_inside() {
        let store = store();
        for i in 0..4 {
            let info = store
                .allocate(&format!("m{i}"), None, vec![], PublicKey([i as u8 + 1; 32]))
                .unwrap();
            info.network.validate().unwrap();
            store.upsert(info).unwrap();
        }
        let subnets: Vec<Ipv4Net> =
            store.list().iter().map(|(m, _)| m.network.subnet).collect();
        for (i, a) in subnets.iter().enumerate() {
            for (j, b) in subnets.iter().enumerate() {
                if i != j {
                    assert!(!a.contains(&b.network()), "{a} overlaps {b}");
                }
            }
        }
    }

    #[test]
    fn upsert_rejects_overlapping_subnet() {
        let store = store();
        store.upsert(machine("a", "10.210.1.0/24", 1)).unwrap();
        let err = store.upsert(machine("b", "10.210.1.0/24", 2));
        assert!(err.is_err());
    }

    #[test]
    fn allocate_without_cluster_is_lifecycle_error() {
        let store = ClusterState::new();
        let err = store.allocate("m", None, vec![], PublicKey([1; 32]));
        assert!(matches!(err, Err(MachineError::NotInitialized)));
    }

    #[test]
    fn local_machine_is_always_up_and_excluded_from_peers() {
        let store = store();
        store.upsert(machine("local", "10.210.0.0/24", 1)).unwrap();
        store.upsert(machine("remote", "10.210.1.0/24", 2)).unwrap();

        let peers = store.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, MachineId::from("remote"));

        let list = store.list();
        assert_eq!(list.len(), 2);
        for (m, state) in &list {
            if m.id == MachineId::from("local") {
                assert_eq!(*state, MembershipState::Up);
            }
        }
    }

    #[test]
    fn peer_configs_prefer_persisted_selected_endpoint() {
        let store = store();
        store.upsert(machine("local", "10.210.0.0/24", 1)).unwrap();
        let mut remote = machine("remote", "10.210.1.0/24", 2);
        remote.network.endpoints =
            vec!["192.0.2.1:51820".parse().unwrap(), "192.0.2.2:51820".parse().unwrap()];
        store.upsert(remote.clone()).unwrap();

        let mut selected = HashMap::new();
        selected.insert(
            remote.network.public_key.to_string(),
            "192.0.2.2:51820".parse::<SocketAddr>().unwrap(),
        );
        let configs = store.peer_configs(&selected);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].endpoint, Some("192.0.2.2:51820".parse().unwrap()));

        // A selected endpoint no longer advertised falls back to the first
        // candidate.
        selected.insert(
            remote.network.public_key.to_string(),
            "198.51.100.1:51820".parse::<SocketAddr>().unwrap(),
        );
        let configs = store.peer_configs(&selected);
        assert_eq!(configs[0].endpoint, Some("192.0.2.1:51820".parse().unwrap()));
    }

    #[test]
    fn remove_forgets_membership_state() {
        let store = store();
        store.upsert(machine("remote", "10.210.1.0/24", 2)).unwrap();
        store.observe(&MachineId::from("remote"), false);
        assert!(store.remove(&MachineId::from("remote")).is_some());
        assert!(store.get(&MachineId::from("remote")).is_none());
        assert_eq!(store.remove(&MachineId::from("remote")), None);
    }
}
