//! The machine runtime.
//!
//! Owns the lifecycle of one cluster machine: init/join/reset, the mesh
//! driver and its control loop, the membership reconciler, the endpoint
//! watcher that persists rotations, and roster mutations with their
//! broadcasts to peers.

use crate::cluster::ClusterState;
use crate::data_dir::DataDir;
use crate::error::MachineError;
use crate::state::MachineState;
use crate::token::ClusterToken;
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uncloud_api::client::with_machines;
use uncloud_api::proto;
use uncloud_api::Client;
use uncloud_model::{
    allocate_subnet, management_ip, KeyPair, MachineId, MachineInfo, MembershipState,
    NetworkConfig, WG_PORT,
};
use uncloud_proxy::Director;
use uncloud_wg::{Config, EndpointChangeEvent, WgNetwork};

/// Default cluster network when the operator doesn't pick one.
pub const DEFAULT_CLUSTER_NETWORK: &str = "10.210.0.0/16";

/// One cluster machine: identity, roster, tunnel, and control loops.
pub struct Machine {
    data_dir: DataDir,
    network: Arc<WgNetwork>,
    director: Arc<Director>,
    cluster: Arc<ClusterState>,
    /// Tunnel keypair, generated at first start so the machine has an
    /// identity to advertise before it ever joins a cluster.
    keys: std::sync::RwLock<KeyPair>,
    /// Persisted state; None until the machine initializes or joins.
    state: tokio::sync::Mutex<Option<MachineState>>,
    /// Cancellation for the control loops; Some while they run.
    cancel: std::sync::Mutex<Option<CancellationToken>>,
}

impl Machine {
    pub fn new(
        data_dir: DataDir,
        device: Arc<dyn uncloud_wg::WgDevice>,
        director: Arc<Director>,
    ) -> Result<Self, MachineError> {
        data_dir.ensure_dirs()?;
        let (keys, is_new) = KeyPair::load_or_generate(data_dir.key_file())?;
        if is_new {
            tracing::info!(public_key = %keys.public_key(), "generated machine keypair");
        }
        Ok(Self {
            data_dir,
            network: Arc::new(WgNetwork::new(device)),
            director,
            cluster: Arc::new(ClusterState::new()),
            keys: std::sync::RwLock::new(keys),
            state: tokio::sync::Mutex::new(None),
            cancel: std::sync::Mutex::new(None),
        })
    }

    pub fn public_key(&self) -> uncloud_model::PublicKey {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).public_key()
    }

    fn keypair(&self) -> KeyPair {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn cluster(&self) -> &ClusterState {
        &self.cluster
    }

    /// Load persisted state, if any, and bring the machine back into its
    /// cluster: restore the roster, reconcile the tunnel, start the loops.
    pub async fn start(self: &Arc<Self>) -> Result<(), MachineError> {
        let state_file = self.data_dir.state_file();
        if !state_file.exists() {
            tracing::info!("machine is not initialized; waiting for init or join");
            return Ok(());
        }

        let mut guard = self.state.lock().await;
        let state = MachineState::load(&state_file)?;
        tracing::info!(id = %state.id, name = %state.name, "restoring machine state");

        self.cluster.init(state.cluster_network, state.id.clone());
        for machine in &state.machines {
            self.cluster.upsert(machine.clone())?;
        }

        self.configure_network(&state).await?;
        self.director.update_local_address(&state.network.management_ip.to_string());
        *guard = Some(state);
        drop(guard);

        self.start_loops().await;
        Ok(())
    }

    /// Initialize a new single-machine cluster. The first subnet of the
    /// cluster network goes to this machine.
    pub async fn init_cluster(
        self: &Arc<Self>,
        name: &str,
        network: Option<Ipv4Net>,
        public_ip: PublicIpConfig,
    ) -> Result<MachineInfo, MachineError> {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return Err(MachineError::AlreadyInitialized);
        }

        let cluster_network = match network {
            Some(net) => net,
            None => DEFAULT_CLUSTER_NETWORK
                .parse()
                .map_err(|_| MachineError::InvalidNetwork(DEFAULT_CLUSTER_NETWORK.into()))?,
        };
        let subnet = allocate_subnet(cluster_network, &[])?;
        let public_ip = public_ip.resolve();

        let id = MachineId::generate();
        let name = if name.is_empty() {
            format!("machine-{}", &id.as_str()[..8])
        } else {
            name.to_string()
        };
        let keys = self.keypair();
        let info = MachineInfo {
            id: id.clone(),
            name: name.clone(),
            public_ip,
            network: NetworkConfig {
                subnet,
                management_ip: management_ip(subnet)?,
                endpoints: candidate_endpoints(public_ip),
                public_key: keys.public_key(),
            },
        };

        let state = MachineState {
            id,
            name,
            public_ip,
            keys,
            network: info.network.clone(),
            cluster_network,
            machines: vec![info.clone()],
            selected_endpoints: HashMap::new(),
        };
        state.save(self.data_dir.state_file())?;

        self.cluster.init(cluster_network, state.id.clone());
        self.cluster.upsert(info.clone())?;
        self.configure_network(&state).await?;
        self.director.update_local_address(&state.network.management_ip.to_string());
        *guard = Some(state);
        drop(guard);

        self.start_loops().await;
        tracing::info!(machine = %info.name, subnet = %info.network.subnet, "initialized cluster");
        Ok(info)
    }

    /// Join an existing cluster with an identity its members allocated for
    /// this machine.
    pub async fn join_cluster(
        self: &Arc<Self>,
        allocated: MachineInfo,
        others: Vec<MachineInfo>,
        cluster_network: Ipv4Net,
    ) -> Result<(), MachineError> {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return Err(MachineError::AlreadyInitialized);
        }
        if allocated.network.public_key != self.public_key() {
            return Err(MachineError::KeyMismatch);
        }
        allocated.network.validate()?;

        let mut machines = vec![allocated.clone()];
        machines.extend(others);

        let state = MachineState {
            id: allocated.id.clone(),
            name: allocated.name.clone(),
            public_ip: allocated.public_ip,
            keys: self.keypair(),
            network: allocated.network.clone(),
            cluster_network,
            machines,
            selected_endpoints: HashMap::new(),
        };
        state.save(self.data_dir.state_file())?;

        self.cluster.init(cluster_network, state.id.clone());
        for machine in &state.machines {
            self.cluster.upsert(machine.clone())?;
        }
        self.configure_network(&state).await?;
        self.director.update_local_address(&state.network.management_ip.to_string());
        let name = state.name.clone();
        *guard = Some(state);
        drop(guard);

        self.start_loops().await;
        tracing::info!(machine = %name, "joined cluster");
        Ok(())
    }

    /// The join token: this machine's public key and the endpoints it can be
    /// reached at. Works before init so a new machine can be registered.
    pub async fn token(&self) -> ClusterToken {
        let guard = self.state.lock().await;
        let endpoints = match guard.as_ref() {
            Some(state) => state.network.endpoints.clone(),
            None => candidate_endpoints(PublicIpConfig::Auto.resolve()),
        };
        ClusterToken::new(self.public_key(), endpoints)
    }

    pub async fn inspect(&self) -> Result<MachineInfo, MachineError> {
        let guard = self.state.lock().await;
        guard.as_ref().map(|s| s.info()).ok_or(MachineError::NotInitialized)
    }

    /// Check this host can run the overlay: a Linux kernel with the WireGuard
    /// module available.
    pub fn check_prerequisites(&self) -> (bool, Vec<String>) {
        let mut missing = Vec::new();
        if !cfg!(target_os = "linux") {
            missing.push("linux kernel".to_string());
        } else if !std::path::Path::new("/sys/module/wireguard").exists() {
            missing.push("wireguard kernel module".to_string());
        }
        (missing.is_empty(), missing)
    }

    /// Leave the cluster and wipe the machine: stop the loops, delete the
    /// tunnel link, remove persisted state, and rekey for the next life.
    pub async fn reset(self: &Arc<Self>) -> Result<(), MachineError> {
        let mut guard = self.state.lock().await;
        self.stop_loops();

        if guard.is_some() {
            // The control loop clears its running flag when it observes the
            // cancellation; give it a moment before deleting the link.
            let mut cleaned = Ok(());
            for _ in 0..50 {
                cleaned = self.network.cleanup().await;
                match &cleaned {
                    Err(uncloud_wg::WgError::StillRunning) => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    _ => break,
                }
            }
            cleaned?;
        }

        let state_file = self.data_dir.state_file();
        if state_file.exists() {
            std::fs::remove_file(&state_file)?;
        }
        let key_file = self.data_dir.key_file();
        if key_file.exists() {
            std::fs::remove_file(&key_file)?;
        }

        *guard = None;
        self.cluster.clear();
        self.director.update_local_address("");
        self.director.flush_remote_backends();

        let keys = KeyPair::generate();
        keys.save(self.data_dir.key_file())?;
        *self.keys.write().unwrap_or_else(|e| e.into_inner()) = keys;

        tracing::info!("machine reset");
        Ok(())
    }

    // ==================== Roster mutations ====================

    /// Register a new machine in the cluster: allocate its identity and
    /// subnet, install it, and broadcast the record to all peers.
    pub async fn add_machine(
        self: &Arc<Self>,
        name: &str,
        public_ip: Option<IpAddr>,
        endpoints: Vec<SocketAddr>,
        public_key: uncloud_model::PublicKey,
    ) -> Result<MachineInfo, MachineError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(MachineError::NotInitialized)?;

        let info = self.cluster.allocate(name, public_ip, endpoints, public_key)?;
        self.cluster.upsert(info.clone())?;
        self.sync_and_configure(state).await?;
        drop(guard);

        tracing::info!(machine = %info.name, subnet = %info.network.subnet, "added machine");
        self.broadcast_add(info.clone()).await;
        Ok(info)
    }

    /// Install a machine record another cluster member allocated. Replicated
    /// records are upserted as-is and never re-broadcast.
    pub async fn apply_machine(self: &Arc<Self>, info: MachineInfo) -> Result<(), MachineError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(MachineError::NotInitialized)?;

        self.cluster.upsert(info.clone())?;
        self.sync_and_configure(state).await?;
        tracing::info!(machine = %info.name, "applied replicated machine record");
        Ok(())
    }

    /// Replace the named fields of a machine record; unset fields stay
    /// untouched. Broadcasts the resolved record unless it arrived as a
    /// replication.
    pub async fn update_machine(
        self: &Arc<Self>,
        id: &MachineId,
        name: Option<String>,
        public_ip: Option<Option<IpAddr>>,
        endpoints: Option<Vec<SocketAddr>>,
        replicated: bool,
    ) -> Result<MachineInfo, MachineError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(MachineError::NotInitialized)?;

        let mut info = self.cluster.get(id).ok_or_else(|| MachineError::NotFound(id.clone()))?;
        if let Some(name) = name {
            info.name = name;
        }
        if let Some(public_ip) = public_ip {
            info.public_ip = public_ip;
        }
        if let Some(endpoints) = endpoints {
            info.network.endpoints = endpoints;
        }
        self.cluster.upsert(info.clone())?;

        // Updating the local machine also updates its persisted identity.
        if *id == state.id {
            state.name = info.name.clone();
            state.public_ip = info.public_ip;
            state.network = info.network.clone();
            self.director.update_local_address(&state.network.management_ip.to_string());
        }
        self.sync_and_configure(state).await?;
        drop(guard);

        tracing::info!(machine = %info.name, "updated machine");
        if !replicated {
            self.broadcast_update(info.clone()).await;
        }
        Ok(info)
    }

    /// Remove a machine from the cluster. Its tunnel peer and routes go away
    /// with the reconfigure; peers learn about the removal via broadcast.
    pub async fn remove_machine(
        self: &Arc<Self>,
        id: &MachineId,
        replicated: bool,
    ) -> Result<(), MachineError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(MachineError::NotInitialized)?;
        if *id == state.id {
            return Err(MachineError::RemoveSelf);
        }

        let removed = self.cluster.remove(id).ok_or_else(|| MachineError::NotFound(id.clone()))?;
        self.sync_and_configure(state).await?;
        drop(guard);

        tracing::info!(machine = %removed.name, "removed machine");
        if !replicated {
            self.broadcast_remove(id).await;
        }
        Ok(())
    }

    pub fn list_machines(&self) -> Vec<(MachineInfo, MembershipState)> {
        self.cluster.list()
    }

    // ==================== Internals ====================

    /// Mirror the roster into the persisted state and reconcile the tunnel.
    async fn sync_and_configure(&self, state: &mut MachineState) -> Result<(), MachineError> {
        let mut machines: Vec<MachineInfo> =
            self.cluster.list().into_iter().map(|(m, _)| m).collect();
        machines.sort_by(|a, b| a.id.cmp(&b.id));
        state.machines = machines;
        state.save(self.data_dir.state_file())?;
        self.configure_network(state).await?;
        Ok(())
    }

    async fn configure_network(&self, state: &MachineState) -> Result<(), MachineError> {
        let config = Config {
            keys: state.keys.clone(),
            listen_port: WG_PORT,
            subnet: state.network.subnet,
            management_ip: state.network.management_ip,
            peers: self.cluster.peer_configs(&state.selected_endpoints),
        };
        self.network.configure(config).await?;
        Ok(())
    }

    /// Start the mesh control loop, the endpoint watcher, and the membership
    /// reconciler. Idempotent.
    async fn start_loops(self: &Arc<Self>) {
        let cancel = {
            let mut guard = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *guard = Some(token.clone());
            token
        };

        // Watchers register before the control loop starts.
        let mut events = self.network.watch_endpoints().await;
        {
            let machine = self.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    machine.handle_endpoint_change(event).await;
                }
            });
        }

        {
            let machine = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = machine.network.run(cancel).await {
                    tracing::error!(error = %e, "mesh control loop failed");
                }
            });
        }

        {
            let machine = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                machine.run_membership_reconciler(cancel).await;
            });
        }
    }

    fn stop_loops(&self) {
        if let Some(cancel) = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).take() {
            cancel.cancel();
        }
    }

    /// Persist a peer's new selected endpoint and drop pooled connections
    /// whose identity the rotation invalidated.
    async fn handle_endpoint_change(&self, event: EndpointChangeEvent) {
        tracing::info!(
            public_key = %event.public_key,
            endpoint = %event.endpoint,
            "peer endpoint changed"
        );
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_mut() {
            state.selected_endpoints.insert(event.public_key.to_string(), event.endpoint);
            if let Err(e) = state.save(self.data_dir.state_file()) {
                tracing::error!(error = %e, "failed to persist endpoint change");
            }
        }
        drop(guard);
        self.director.flush_remote_backends();
    }

    /// Sample tunnel peer liveness every second and feed the membership
    /// tracker.
    async fn run_membership_reconciler(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for snapshot in self.network.peer_snapshots().await {
                        let Some(machine) =
                            self.cluster.machine_by_public_key(&snapshot.public_key)
                        else {
                            continue;
                        };
                        let up = snapshot.status == uncloud_wg::PeerStatus::Up;
                        if let Some(new_state) = self.cluster.observe(&machine.id, up) {
                            tracing::info!(
                                machine = %machine.name,
                                state = %new_state,
                                "membership state changed"
                            );
                        }
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    // ==================== Broadcasts ====================

    /// Broadcast failures are logged, never fatal: peers resynchronize from
    /// the roster on their next exchange.
    async fn broadcast_add(&self, info: MachineInfo) {
        let request = proto::AddMachineRequest {
            allocated: Some(info.into()),
            ..Default::default()
        };
        self.broadcast(move |mut client, req| async move {
            client.cluster.add_machine(req).await.map(|_| ())
        }, request, "add machine")
        .await;
    }

    async fn broadcast_update(&self, info: MachineInfo) {
        let request = proto::UpdateMachineRequest {
            id: info.id.to_string(),
            name: Some(info.name.clone()),
            public_ip: Some(info.public_ip.map(|ip| ip.to_string()).unwrap_or_default()),
            endpoints: Some(proto::EndpointList {
                endpoints: info.network.endpoints.iter().map(|e| e.to_string()).collect(),
            }),
        };
        self.broadcast(move |mut client, req| async move {
            client.cluster.update_machine(req).await.map(|_| ())
        }, request, "update machine")
        .await;
    }

    async fn broadcast_remove(&self, id: &MachineId) {
        let request = proto::RemoveMachineRequest { id: id.to_string() };
        self.broadcast(move |mut client, req| async move {
            client.cluster.remove_machine(req).await.map(|_| ())
        }, request, "remove machine")
        .await;
    }

    /// Fan a mutation out to every peer through this machine's own proxy.
    async fn broadcast<R, F, Fut>(&self, call: F, message: R, what: &str)
    where
        R: Clone,
        F: FnOnce(Client, tonic::Request<R>) -> Fut,
        Fut: std::future::Future<Output = Result<(), tonic::Status>>,
    {
        let peers = self.cluster.peer_addresses();
        if peers.is_empty() {
            return;
        }
        let client = match Client::connect_unix(self.data_dir.proxy_sock()).await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(error = %e, "cannot reach own proxy to broadcast {what}");
                return;
            }
        };
        let request = match with_machines(message, &peers) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "cannot build broadcast request for {what}");
                return;
            }
        };
        if let Err(e) = call(client, request).await {
            // Per-peer failures ride inside the reply envelopes; this only
            // fires when the whole fan-out could not run.
            tracing::warn!(error = %e, "broadcast {what} failed");
        }
    }
}

/// How the operator wants the machine's public IP determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicIpConfig {
    /// The machine has no public address.
    None,
    /// Detect from the default egress interface.
    Auto,
    Addr(IpAddr),
}

impl PublicIpConfig {
    fn resolve(self) -> Option<IpAddr> {
        match self {
            Self::None => None,
            Self::Addr(ip) => Some(ip),
            Self::Auto => detect_egress_ip(),
        }
    }
}

/// The address of the default egress interface, found by "connecting" a UDP
/// socket (no packets are sent).
fn detect_egress_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("1.1.1.1:53").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

/// Candidate tunnel endpoints to advertise: the public IP and the egress
/// interface address, deduplicated.
fn candidate_endpoints(public_ip: Option<IpAddr>) -> Vec<SocketAddr> {
    let mut endpoints = Vec::new();
    if let Some(ip) = public_ip {
        endpoints.push(SocketAddr::new(ip, WG_PORT));
    }
    if let Some(ip) = detect_egress_ip() {
        let endpoint = SocketAddr::new(ip, WG_PORT);
        if !endpoints.contains(&endpoint) {
            endpoints.push(endpoint);
        }
    }
    endpoints
}
