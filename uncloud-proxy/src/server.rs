//! Serving the proxy.
//!
//! The proxy listens on a public Unix socket for operators on the machine and
//! on the management address for peers on the overlay network.

use crate::director::Director;
use crate::error::ProxyError;
use crate::service::{ProxyClusterService, ProxyMachineService};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use uncloud_api::proto::cluster_server::ClusterServer;
use uncloud_api::proto::machine_server::MachineServer;

/// gRPC server fronting the director.
pub struct ProxyServer {
    director: Arc<Director>,
}

impl ProxyServer {
    pub fn new(director: Arc<Director>) -> Self {
        Self { director }
    }

    /// Serve on a Unix socket until cancelled. Removes a stale socket file
    /// first and restricts the new one to the owner.
    pub async fn serve_unix(
        &self,
        socket_path: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<(), ProxyError> {
        let socket_path = socket_path.into();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&socket_path) {
                let mut perms = metadata.permissions();
                perms.set_mode(0o600);
                let _ = std::fs::set_permissions(&socket_path, perms);
            }
        }
        tracing::info!(path = ?socket_path, "proxy listening on unix socket");

        let result = Server::builder()
            .add_service(MachineServer::new(ProxyMachineService::new(self.director.clone())))
            .add_service(ClusterServer::new(ProxyClusterService::new(self.director.clone())))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                cancel.cancelled().await;
            })
            .await;

        let _ = std::fs::remove_file(&socket_path);
        result.map_err(ProxyError::from)
    }

    /// Serve peers on the overlay network until cancelled.
    pub async fn serve_tcp(
        &self,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, "proxy listening on overlay network");
        self.serve_incoming(TcpListenerStream::new(listener), cancel).await
    }

    /// Serve on an already-bound TCP listener.
    pub async fn serve_listener(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ProxyError> {
        self.serve_incoming(TcpListenerStream::new(listener), cancel).await
    }

    async fn serve_incoming(
        &self,
        incoming: TcpListenerStream,
        cancel: CancellationToken,
    ) -> Result<(), ProxyError> {
        Server::builder()
            .add_service(MachineServer::new(ProxyMachineService::new(self.director.clone())))
            .add_service(ClusterServer::new(ProxyClusterService::new(self.director.clone())))
            .serve_with_incoming_shutdown(incoming, async move {
                cancel.cancelled().await;
            })
            .await
            .map_err(ProxyError::from)
    }
}
