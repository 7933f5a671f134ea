//! Local and remote backends.
//!
//! A backend hands out a multiplexed channel to the gRPC server it fronts.
//! Channels are created lazily and reconnect on failure; a backend stays
//! usable by in-flight calls for as long as any clone of it is alive.

use crate::error::ProxyError;
use hyper_util::rt::TokioIo;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

const REMOTE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The in-process gRPC server, reached over the daemon's internal Unix
/// socket. Carries the local machine's canonical address so the director can
/// recognize local-targeted calls.
#[derive(Clone, Debug)]
pub struct LocalBackend {
    sock_path: PathBuf,
    address: String,
    channel: Channel,
}

impl LocalBackend {
    pub fn new(sock_path: impl Into<PathBuf>, address: impl Into<String>) -> Self {
        let sock_path = sock_path.into();
        let connect_path = sock_path.clone();
        // Dummy URI required by tonic's Endpoint API - the actual connection
        // uses the Unix socket below.
        let channel = Endpoint::from_static("http://[::]:0").connect_with_connector_lazy(
            service_fn(move |_: Uri| {
                let path = connect_path.clone();
                async move {
                    let stream = UnixStream::connect(path).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }),
        );
        Self { sock_path, address: address.into(), channel }
    }

    pub fn sock_path(&self) -> &Path {
        &self.sock_path
    }

    /// The local machine's canonical address; empty until the machine joins
    /// or initializes a cluster.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }
}

/// A peer reachable at a management address on the overlay network, at the
/// cluster-wide remote API port. The multiplexed channel is created lazily at
/// construction and is safe for concurrent use.
#[derive(Clone, Debug)]
pub struct RemoteBackend {
    address: String,
    channel: Channel,
    closed: Arc<AtomicBool>,
}

impl RemoteBackend {
    pub fn new(address: &str, port: u16) -> Result<Self, ProxyError> {
        let authority = match address.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{port}"),
            _ => format!("{address}:{port}"),
        };
        let endpoint = Endpoint::from_shared(format!("http://{authority}"))
            .map_err(|_| ProxyError::InvalidAddress(address.to_string()))?
            .connect_timeout(REMOTE_CONNECT_TIMEOUT);
        Ok(Self {
            address: address.to_string(),
            channel: endpoint.connect_lazy(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Mark the backend closed. Returns true on the first close. The channel
    /// itself shuts down once the last clone (cache entry or in-flight call)
    /// is dropped.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A routing target chosen by the director.
#[derive(Clone, Debug)]
pub enum Backend {
    Local(LocalBackend),
    Remote(RemoteBackend),
}

impl Backend {
    pub fn address(&self) -> &str {
        match self {
            Backend::Local(b) => b.address(),
            Backend::Remote(b) => b.address(),
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            Backend::Local(b) => b.channel(),
            Backend::Remote(b) => b.channel(),
        }
    }
}
