//! Mesh driver and control loop.
//!
//! [`WgNetwork`] owns the tunnel device exclusively. `configure` applies a
//! full desired state (device peers, link addresses, routes) as an idempotent
//! diff; `run` is the 1-second control loop that reads handshake state from
//! the device, rotates endpoints of unreachable peers, and publishes
//! [`EndpointChangeEvent`]s to registered watchers.

use crate::device::{host_prefix, DeviceConfig, DevicePeer, PeerPatch, WgDevice};
use crate::error::WgError;
use crate::peer::{Peer, PeerConfig, PeerStatus};
use ipnet::{IpNet, Ipv4Net};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uncloud_model::{KeyPair, PublicKey};

/// How long a single watcher send may block the control loop.
const WATCH_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Desired state of the local machine's tunnel.
#[derive(Clone, Debug)]
pub struct Config {
    pub keys: KeyPair,
    pub listen_port: u16,
    /// This machine's subnet within the cluster network.
    pub subnet: Ipv4Net,
    /// This machine's control-plane address; must lie within `subnet`.
    pub management_ip: IpAddr,
    pub peers: Vec<PeerConfig>,
}

impl Config {
    /// The exact address set the link must bear: the management IP as a host
    /// prefix plus a prefix-address representing the machine subnet.
    fn addresses(&self) -> Vec<IpNet> {
        let subnet_addr = IpNet::new(self.management_ip, self.subnet.prefix_len())
            .expect("subnet prefix length is valid for the management IP");
        vec![host_prefix(self.management_ip), subnet_addr]
    }

    /// Build the device change set: patch existing peers in place
    /// (`update_only` preserves handshake state), create new ones, remove the
    /// rest. Never replaces the whole peer set.
    fn to_device_config(&self, device_peers: &[DevicePeer]) -> DeviceConfig {
        let existing: std::collections::HashSet<PublicKey> =
            device_peers.iter().map(|p| p.public_key).collect();

        let mut patches: Vec<PeerPatch> = self
            .peers
            .iter()
            .map(|pc| PeerPatch {
                public_key: pc.public_key,
                remove: false,
                update_only: existing.contains(&pc.public_key),
                endpoint: pc.endpoint,
                replace_allowed_ips: true,
                allowed_ips: pc.prefixes(),
            })
            .collect();

        for device_peer in device_peers {
            if !self.peers.iter().any(|pc| pc.public_key == device_peer.public_key) {
                patches.push(PeerPatch {
                    public_key: device_peer.public_key,
                    remove: true,
                    update_only: false,
                    endpoint: None,
                    replace_allowed_ips: false,
                    allowed_ips: Vec::new(),
                });
            }
        }

        DeviceConfig {
            private_key: Some(self.keys.clone()),
            listen_port: Some(self.listen_port),
            replace_peers: false,
            peers: patches,
        }
    }
}

/// Published when a peer's selected endpoint changes, whether by rotation or
/// because the kernel observed the peer roaming.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointChangeEvent {
    pub public_key: PublicKey,
    pub endpoint: SocketAddr,
}

/// Read-only view of one peer's liveness.
#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    pub public_key: PublicKey,
    pub status: PeerStatus,
    pub endpoint: Option<SocketAddr>,
}

struct Inner {
    /// None until the first configure; `run` refuses to start before that.
    peers: Option<HashMap<PublicKey, Peer>>,
    watchers: Vec<mpsc::Sender<EndpointChangeEvent>>,
    running: bool,
}

/// The mesh driver. Exclusively owns the tunnel link, its addresses, and its
/// routes; all mutation happens under one lock so `configure` and the control
/// loop tick never interleave.
pub struct WgNetwork {
    device: Arc<dyn WgDevice>,
    inner: Mutex<Inner>,
}

impl WgNetwork {
    pub fn new(device: Arc<dyn WgDevice>) -> Self {
        Self {
            device,
            inner: Mutex::new(Inner { peers: None, watchers: Vec::new(), running: false }),
        }
    }

    /// Apply the given configuration to the tunnel: device peers, link
    /// addresses, link state, and peer routes. Idempotent; a failing step
    /// aborts the apply and the next configure reconciles.
    pub async fn configure(&self, config: Config) -> Result<(), WgError> {
        let mut inner = self.inner.lock().await;

        self.device.ensure_link().await?;
        let device_state = self.device.read_state().await?;

        match inner.peers.as_mut() {
            None => {
                // First configure of this instance. If the device was
                // configured before the daemon restarted, reconstruct peers
                // from it so handshake state survives and endpoints don't
                // rotate spuriously.
                let by_key: HashMap<PublicKey, &DevicePeer> =
                    device_state.peers.iter().map(|p| (p.public_key, p)).collect();
                let peers = config
                    .peers
                    .iter()
                    .map(|pc| {
                        (
                            pc.public_key,
                            Peer::new(pc.clone(), by_key.get(&pc.public_key).copied()),
                        )
                    })
                    .collect();
                inner.peers = Some(peers);
            }
            Some(peers) => {
                for pc in &config.peers {
                    match peers.entry(pc.public_key) {
                        std::collections::hash_map::Entry::Occupied(mut entry) => {
                            entry.get_mut().update_config(pc.clone());
                        }
                        std::collections::hash_map::Entry::Vacant(entry) => {
                            entry.insert(Peer::new(pc.clone(), None));
                        }
                    }
                }
                peers.retain(|key, _| config.peers.iter().any(|pc| pc.public_key == *key));
            }
        }

        self.device.apply(config.to_device_config(&device_state.peers)).await?;
        tracing::info!(peers = config.peers.len(), "configured tunnel device");

        self.reconcile_addresses(&config).await?;
        self.device.link_up().await?;
        self.reconcile_routes(inner.peers.as_ref().expect("peers set above")).await?;

        Ok(())
    }

    /// The link must bear exactly the two configured addresses; anything else,
    /// including addresses added out of band, is removed.
    async fn reconcile_addresses(&self, config: &Config) -> Result<(), WgError> {
        let want = config.addresses();
        let current = self.device.addresses().await?;

        for addr in &want {
            if !current.contains(addr) {
                self.device.add_address(*addr).await?;
            }
        }
        for addr in &current {
            if !want.contains(addr) {
                self.device.remove_address(*addr).await?;
            }
        }
        tracing::info!(addrs = ?want, "updated tunnel addresses");
        Ok(())
    }

    /// Routes on the link must equal the minimal aggregation of all peers'
    /// routable prefixes.
    async fn reconcile_routes(&self, peers: &HashMap<PublicKey, Peer>) -> Result<(), WgError> {
        let mut prefixes: Vec<IpNet> = Vec::new();
        for peer in peers.values() {
            prefixes.extend(peer.config.prefixes());
        }
        let want = IpNet::aggregate(&prefixes);
        let current = self.device.routes().await?;

        for dst in &want {
            if !current.contains(dst) {
                self.device.add_route(*dst).await?;
                tracing::debug!(dst = %dst, "added route to peers via tunnel");
            }
        }
        for dst in &current {
            if !want.contains(dst) {
                self.device.remove_route(*dst).await?;
                tracing::debug!(dst = %dst, "removed stale route from tunnel");
            }
        }
        tracing::info!(routes = want.len(), peers = peers.len(), "updated peer routes");
        Ok(())
    }

    /// Register a watcher for endpoint change events. Register before calling
    /// `run`, or accept that earlier events are missed. The channel closes
    /// when the control loop stops.
    pub async fn watch_endpoints(&self) -> mpsc::Receiver<EndpointChangeEvent> {
        let (tx, rx) = mpsc::channel(16);
        self.inner.lock().await.watchers.push(tx);
        rx
    }

    /// Liveness snapshot of all peers, for the membership reconciler.
    pub async fn peer_snapshots(&self) -> Vec<PeerSnapshot> {
        let inner = self.inner.lock().await;
        match &inner.peers {
            Some(peers) => peers
                .values()
                .map(|p| PeerSnapshot {
                    public_key: p.config.public_key,
                    status: p.status(),
                    endpoint: p.config.endpoint,
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// The control loop: every second, read the device, reconcile peer
    /// liveness, rotate endpoints of unreachable peers, and publish events.
    /// Only one instance may run; `configure` must have been called first.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WgError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.running {
                return Err(WgError::AlreadyRunning);
            }
            if inner.peers.is_none() {
                return Err(WgError::NotConfigured);
            }
            inner.running = true;
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut inner = self.inner.lock().await;
                    match self.update_peers_from_device(&mut inner).await {
                        Ok(events) => {
                            if let Err(e) = Self::notify_watchers(&inner.watchers, &events, &cancel).await {
                                // Watchers resynchronize from authoritative
                                // snapshots, so missed events are tolerable.
                                tracing::error!(error = %e, "failed to notify watchers about a peer endpoint change");
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to update peer status from tunnel device");
                        }
                    }
                    match self.rotate_endpoints(&mut inner).await {
                        Ok(events) => {
                            if let Err(e) = Self::notify_watchers(&inner.watchers, &events, &cancel).await {
                                tracing::error!(error = %e, "failed to notify watchers about a peer endpoint change");
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to rotate peer endpoints on tunnel device");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    let mut inner = self.inner.lock().await;
                    // Dropping the senders closes every watcher channel.
                    inner.watchers.clear();
                    inner.running = false;
                    return Ok(());
                }
            }
        }
    }

    /// Refresh peer liveness from the device. Lock must be held.
    async fn update_peers_from_device(
        &self,
        inner: &mut Inner,
    ) -> Result<Vec<EndpointChangeEvent>, WgError> {
        let state = self.device.read_state().await?;
        let peers = inner.peers.as_mut().ok_or(WgError::NotConfigured)?;

        let mut events = Vec::new();
        for device_peer in &state.peers {
            match peers.get_mut(&device_peer.public_key) {
                Some(peer) => {
                    if peer.update_from_device(device_peer) {
                        if let Some(endpoint) = peer.config.endpoint {
                            events.push(EndpointChangeEvent {
                                public_key: device_peer.public_key,
                                endpoint,
                            });
                        }
                    }
                }
                None => {
                    // Device peers are managed exclusively by this driver, so
                    // an unknown one means out-of-band configuration.
                    tracing::warn!(
                        public_key = %device_peer.public_key,
                        "found device peer that is not in the configuration"
                    );
                }
            }
        }
        Ok(events)
    }

    /// Rotate the endpoints of down peers that are due for a change and patch
    /// the device. Lock must be held.
    async fn rotate_endpoints(
        &self,
        inner: &mut Inner,
    ) -> Result<Vec<EndpointChangeEvent>, WgError> {
        let peers = inner.peers.as_mut().ok_or(WgError::NotConfigured)?;
        let now = Instant::now();

        let mut patches = Vec::new();
        let mut events = Vec::new();
        for peer in peers.values_mut() {
            let Some(next) = peer.should_change_endpoint() else {
                continue;
            };
            let status = peer.status();
            let mut new_config = peer.config.clone();
            new_config.endpoint = Some(next);
            peer.update_config_at(new_config, now);

            patches.push(PeerPatch::endpoint_only(peer.config.public_key, next));
            events.push(EndpointChangeEvent { public_key: peer.config.public_key, endpoint: next });
            tracing::info!(
                public_key = %peer.config.public_key,
                endpoint = %next,
                status = %status,
                "changing peer endpoint on tunnel device"
            );
        }

        if patches.is_empty() {
            return Ok(events);
        }

        self.device
            .apply(DeviceConfig { replace_peers: false, peers: patches, ..Default::default() })
            .await?;
        Ok(events)
    }

    /// Publish events to every watcher, bounding each send so a slow watcher
    /// cannot stall the control loop.
    async fn notify_watchers(
        watchers: &[mpsc::Sender<EndpointChangeEvent>],
        events: &[EndpointChangeEvent],
        cancel: &CancellationToken,
    ) -> Result<(), WgError> {
        if events.is_empty() {
            return Ok(());
        }
        for watcher in watchers {
            for event in events {
                tokio::select! {
                    sent = watcher.send(event.clone()) => {
                        // A closed receiver is fine: the watcher went away.
                        let _ = sent;
                    }
                    _ = tokio::time::sleep(WATCH_SEND_TIMEOUT) => {
                        return Err(WgError::WatchTimeout);
                    }
                    _ = cancel.cancelled() => {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Delete the tunnel link. The control loop must not be running.
    pub async fn cleanup(&self) -> Result<(), WgError> {
        let mut inner = self.inner.lock().await;
        if inner.running {
            return Err(WgError::StillRunning);
        }
        self.device.delete_link().await?;
        inner.peers = None;
        tracing::info!("deleted tunnel interface");
        Ok(())
    }
}
