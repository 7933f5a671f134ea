//! Local backend server with UDS listener
//!
//! Serves the real Machine and Cluster service implementations on the
//! daemon's internal socket. Only the request proxy talks to this socket;
//! operators and peers go through the proxy.

use crate::cluster_service::ClusterService;
use crate::machine::Machine;
use crate::machine_service::MachineService;
use crate::MachineError;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use uncloud_api::proto::cluster_server::ClusterServer;
use uncloud_api::proto::machine_server::MachineServer;

/// gRPC server for the local backend.
pub struct BackendServer {
    machine: Arc<Machine>,
    socket_path: PathBuf,
}

impl BackendServer {
    pub fn new(machine: Arc<Machine>, socket_path: impl Into<PathBuf>) -> Self {
        Self { machine, socket_path: socket_path.into() }
    }

    /// Run the backend server until cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), MachineError> {
        // Remove stale socket if exists
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        // Secure the socket (RW for owner only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&self.socket_path) {
                let mut perms = metadata.permissions();
                perms.set_mode(0o600);
                let _ = std::fs::set_permissions(&self.socket_path, perms);
            }
        }

        tracing::info!(path = ?self.socket_path, "local backend listening");

        let machine_service = MachineService::new(self.machine.clone());
        let cluster_service = ClusterService::new(self.machine.clone());

        let result = Server::builder()
            .add_service(MachineServer::new(machine_service))
            .add_service(ClusterServer::new(cluster_service))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                cancel.cancelled().await;
            })
            .await;

        let _ = std::fs::remove_file(&self.socket_path);
        result.map_err(|e| MachineError::State(format!("backend server: {e}")))
    }
}
