//! Persisted machine state.
//!
//! One JSON document per machine holding its identity, tunnel private key,
//! network config, and the last-known cluster roster. The document is what
//! lets a restarted daemon rejoin without rekeying. Writes go through a temp
//! file and rename so a crash never leaves a torn state file.

use crate::error::MachineError;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use uncloud_model::{KeyPair, MachineId, MachineInfo, NetworkConfig};

#[derive(Serialize, Deserialize)]
pub struct MachineState {
    pub id: MachineId,
    pub name: String,
    pub public_ip: Option<IpAddr>,
    /// Tunnel private key; the file carrying it is owner-readable only.
    pub keys: KeyPair,
    pub network: NetworkConfig,
    /// The cluster CIDR machine subnets are allocated from.
    pub cluster_network: Ipv4Net,
    /// Last-known roster, including this machine.
    pub machines: Vec<MachineInfo>,
    /// Last-known selected endpoint per peer public key (hex), persisted by
    /// the endpoint watcher so restarts keep using working endpoints.
    #[serde(default)]
    pub selected_endpoints: HashMap<String, SocketAddr>,
}

impl MachineState {
    /// This machine's own roster record.
    pub fn info(&self) -> MachineInfo {
        MachineInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            public_ip: self.public_ip,
            network: self.network.clone(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MachineError> {
        let bytes = std::fs::read(path.as_ref())?;
        serde_json::from_slice(&bytes)
            .map_err(|e| MachineError::State(format!("parse {:?}: {e}", path.as_ref())))
    }

    /// Atomically persist the state: write a temp file next to the target and
    /// rename it into place.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MachineError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| MachineError::State(format!("encode state: {e}")))?;

        let mut file = std::fs::File::create(&tmp_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata()?.permissions();
            perms.set_mode(0o600);
            file.set_permissions(perms)?;
        }
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uncloud_model::PublicKey;

    fn state() -> MachineState {
        let keys = KeyPair::generate();
        let network = NetworkConfig {
            subnet: "10.210.0.0/24".parse().unwrap(),
            management_ip: "10.210.0.1".parse().unwrap(),
            endpoints: vec!["203.0.113.5:51820".parse().unwrap()],
            public_key: keys.public_key(),
        };
        MachineState {
            id: MachineId::generate(),
            name: "m1".into(),
            public_ip: Some("203.0.113.5".parse().unwrap()),
            keys,
            network: network.clone(),
            cluster_network: "10.210.0.0/16".parse().unwrap(),
            machines: vec![MachineInfo {
                id: MachineId::from("m2-id"),
                name: "m2".into(),
                public_ip: None,
                network: NetworkConfig {
                    subnet: "10.210.1.0/24".parse().unwrap(),
                    management_ip: "10.210.1.1".parse().unwrap(),
                    endpoints: vec![],
                    public_key: PublicKey([3; 32]),
                },
            }],
            selected_endpoints: HashMap::new(),
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("machine.json");

        let original = state();
        original.save(&path).unwrap();

        let loaded = MachineState::load(&path).unwrap();
        assert_eq!(loaded.id, original.id);
        assert_eq!(loaded.name, "m1");
        assert_eq!(loaded.keys.public_key(), original.keys.public_key());
        assert_eq!(loaded.network, original.network);
        assert_eq!(loaded.machines, original.machines);
    }

    #[test]
    fn save_is_atomic_against_partial_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("machine.json");

        let original = state();
        original.save(&path).unwrap();
        // A second save replaces the document and leaves no temp file behind.
        original.save(&path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn state_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("machine.json");

        state().save(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
