//! Request routing between local and remote backends.
//!
//! The director consumes a call's incoming metadata and decides where it
//! runs: on the local backend, on one remote peer, or fanned out to many
//! peers. Remote backends are cached per address with load-or-store
//! semantics; the losing creator of a race closes its backend and adopts the
//! stored one.

use crate::backend::{Backend, LocalBackend, RemoteBackend};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tonic::metadata::MetadataMap;
use tonic::Status;
use uncloud_api::{MACHINES_KEY, PROXY_AUTHORITY_KEY};

/// How a routed call executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    One2One,
    One2Many,
}

/// A routing decision: the backends to call, in request order, and whether
/// branch requests must carry the forwarded marker.
#[derive(Debug)]
pub struct RoutedCall {
    pub mode: Mode,
    pub backends: Vec<Backend>,
    /// True when an explicit machine list drove the routing; branch requests
    /// then carry `proxy-authority` so they terminate at the receiving proxy.
    pub forward: bool,
}

/// Routes gRPC requests between the local backend and cached remote backends.
pub struct Director {
    /// Swapped as a whole by `update_local_address` so the address and the
    /// backend always change together.
    local: RwLock<LocalBackend>,
    remote_port: u16,
    remotes: DashMap<String, RemoteBackend>,
}

impl Director {
    pub fn new(local_sock_path: impl Into<PathBuf>, remote_port: u16) -> Self {
        Self {
            local: RwLock::new(LocalBackend::new(local_sock_path, "")),
            remote_port,
            remotes: DashMap::new(),
        }
    }

    /// Update the local machine address used to recognize which requests
    /// short-circuit to the local gRPC server. Called during init and join.
    pub fn update_local_address(&self, address: &str) {
        let Ok(mut local) = self.local.write() else {
            tracing::error!("local backend lock poisoned");
            return;
        };
        *local = LocalBackend::new(local.sock_path().to_path_buf(), address);
    }

    pub fn local_address(&self) -> String {
        self.local.read().map(|l| l.address().to_string()).unwrap_or_default()
    }

    /// Classify a call from its incoming metadata.
    pub fn route(&self, metadata: &MetadataMap) -> Result<RoutedCall, Status> {
        let local = self
            .local
            .read()
            .map_err(|_| Status::internal("local backend lock poisoned"))?
            .clone();

        // A forwarded call must terminate here. The marker is kept on the
        // local branch request so the backend can tell a replicated mutation
        // from an original one and not re-broadcast it.
        if metadata.contains_key(PROXY_AUTHORITY_KEY) {
            return Ok(RoutedCall {
                mode: Mode::One2One,
                backends: vec![Backend::Local(local)],
                forward: true,
            });
        }

        let mut entries = 0usize;
        let machines: Vec<String> = metadata
            .get_all(MACHINES_KEY)
            .iter()
            .inspect(|_| entries += 1)
            .filter_map(|value| value.to_str().ok())
            .filter(|addr| !addr.is_empty())
            .map(String::from)
            .collect();

        // No machine list: the call is for this machine.
        if entries == 0 {
            return Ok(RoutedCall {
                mode: Mode::One2One,
                backends: vec![Backend::Local(local)],
                forward: false,
            });
        }
        if machines.is_empty() {
            return Err(Status::invalid_argument("no machines specified"));
        }

        let mut backends = Vec::with_capacity(machines.len());
        for addr in &machines {
            if addr == local.address() {
                backends.push(Backend::Local(local.clone()));
            } else {
                backends.push(Backend::Remote(self.remote_backend(addr)?));
            }
        }

        let mode = if backends.len() == 1 { Mode::One2One } else { Mode::One2Many };
        Ok(RoutedCall { mode, backends, forward: true })
    }

    /// Look up or create the remote backend for an address.
    fn remote_backend(&self, addr: &str) -> Result<RemoteBackend, Status> {
        if let Some(backend) = self.remotes.get(addr) {
            return Ok(backend.clone());
        }

        let backend = RemoteBackend::new(addr, self.remote_port)
            .map_err(|e| Status::internal(e.to_string()))?;
        match self.remotes.entry(addr.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                // A concurrent call built a different backend; keep theirs.
                backend.close();
                Ok(existing.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(backend.clone());
                Ok(backend)
            }
        }
    }

    /// Close all cached remote backends and drop them from the cache.
    /// Required after a topology change that invalidates connection identity,
    /// such as a peer endpoint rotation.
    pub fn flush_remote_backends(&self) {
        self.remotes.retain(|addr, backend| {
            backend.close();
            tracing::debug!(addr = %addr, "closed remote backend");
            false
        });
    }

    /// Tear down every backend.
    pub fn close(&self) {
        self.flush_remote_backends();
    }

    #[cfg(test)]
    pub(crate) fn cached_remotes(&self) -> usize {
        self.remotes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::MetadataValue;

    fn director() -> Director {
        let dir = Director::new("/tmp/uncloud-test.sock", 51000);
        dir.update_local_address("10.210.0.1");
        dir
    }

    fn metadata_with_machines(addrs: &[&str]) -> MetadataMap {
        let mut md = MetadataMap::new();
        for addr in addrs {
            md.append(MACHINES_KEY, MetadataValue::try_from(*addr).unwrap());
        }
        md
    }

    #[test]
    fn no_metadata_routes_local() {
        let dir = director();
        let routed = dir.route(&MetadataMap::new()).unwrap();
        assert_eq!(routed.mode, Mode::One2One);
        assert_eq!(routed.backends.len(), 1);
        assert!(!routed.forward);
        assert!(matches!(routed.backends[0], Backend::Local(_)));
    }

    #[test]
    fn forwarded_call_terminates_locally() {
        let dir = director();
        let mut md = metadata_with_machines(&["10.210.1.1", "10.210.2.1"]);
        md.insert(PROXY_AUTHORITY_KEY, MetadataValue::from_static("peer"));

        let routed = dir.route(&md).unwrap();
        assert_eq!(routed.mode, Mode::One2One);
        assert!(matches!(routed.backends[0], Backend::Local(_)));
        // The forwarded marker stays on the local branch request.
        assert!(routed.forward);
    }

    #[test]
    fn empty_machine_list_is_invalid() {
        let dir = director();
        let md = metadata_with_machines(&[""]);
        let err = dir.route(&md).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn backends_preserve_request_order() {
        let dir = director();
        let md = metadata_with_machines(&["10.210.2.1", "10.210.0.1", "10.210.1.1"]);

        let routed = dir.route(&md).unwrap();
        assert_eq!(routed.mode, Mode::One2Many);
        assert!(routed.forward);
        let addrs: Vec<&str> = routed.backends.iter().map(|b| b.address()).collect();
        assert_eq!(addrs, vec!["10.210.2.1", "10.210.0.1", "10.210.1.1"]);
        assert!(matches!(routed.backends[1], Backend::Local(_)));
    }

    #[test]
    fn single_remote_is_one2one() {
        let dir = director();
        let routed = dir.route(&metadata_with_machines(&["10.210.1.1"])).unwrap();
        assert_eq!(routed.mode, Mode::One2One);
        assert!(routed.forward);
        assert!(matches!(routed.backends[0], Backend::Remote(_)));
    }

    #[test]
    fn remote_backends_are_cached_per_address() {
        let dir = director();
        dir.route(&metadata_with_machines(&["10.210.1.1"])).unwrap();
        dir.route(&metadata_with_machines(&["10.210.1.1", "10.210.2.1"])).unwrap();
        assert_eq!(dir.cached_remotes(), 2);
    }

    #[test]
    fn flush_closes_every_backend_exactly_once() {
        let dir = director();
        let routed = dir.route(&metadata_with_machines(&["10.210.1.1", "10.210.2.1"])).unwrap();
        let remotes: Vec<RemoteBackend> = routed
            .backends
            .iter()
            .filter_map(|b| match b {
                Backend::Remote(r) => Some(r.clone()),
                Backend::Local(_) => None,
            })
            .collect();

        dir.flush_remote_backends();
        assert_eq!(dir.cached_remotes(), 0);
        for remote in &remotes {
            assert!(remote.is_closed());
            // Closing again reports it was already closed.
            assert!(!remote.close());
        }
    }

    #[test]
    fn update_local_address_swaps_backend() {
        let dir = Director::new("/tmp/uncloud-test.sock", 51000);
        assert_eq!(dir.local_address(), "");
        dir.update_local_address("10.210.0.1");
        assert_eq!(dir.local_address(), "10.210.0.1");

        let routed = dir.route(&metadata_with_machines(&["10.210.0.1"])).unwrap();
        assert!(matches!(routed.backends[0], Backend::Local(_)));
    }
}
