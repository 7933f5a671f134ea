//! Client for connecting to an Uncloud machine daemon
//!
//! Connects over the daemon's Unix socket (operators on the machine itself)
//! or over TCP to a management address on the overlay network.

use crate::proto::{cluster_client::ClusterClient, machine_client::MachineClient};
use crate::MACHINES_KEY;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Request, Status};
use tower::service_fn;

/// Client connected to a machine daemon.
#[derive(Clone)]
pub struct Client {
    pub machine: MachineClient<Channel>,
    pub cluster: ClusterClient<Channel>,
}

impl Client {
    /// Connect to the daemon at the given Unix socket path.
    pub async fn connect_unix(
        socket_path: impl AsRef<Path>,
    ) -> Result<Self, tonic::transport::Error> {
        let socket_path: PathBuf = socket_path.as_ref().to_path_buf();

        // Dummy URI required by tonic's Endpoint API - the actual connection
        // uses the Unix socket below.
        let channel = Endpoint::from_static("http://[::]:0")
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = socket_path.clone();
                async move {
                    let stream = UnixStream::connect(path).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await?;

        Ok(Self::from_channel(channel))
    }

    /// Connect to a machine's proxy over TCP, typically to a management
    /// address on the overlay network.
    pub async fn connect_tcp(addr: SocketAddr) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(format!("http://{addr}"))?.connect().await?;
        Ok(Self::from_channel(channel))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            machine: MachineClient::new(channel.clone()),
            cluster: ClusterClient::new(channel),
        }
    }
}

/// Target a request at the given machine addresses; the receiving proxy fans
/// the call out and returns one envelope per address, in order.
pub fn with_machines<T>(message: T, addrs: &[String]) -> Result<Request<T>, Status> {
    let mut request = Request::new(message);
    for addr in addrs {
        let value: MetadataValue<_> = addr
            .parse()
            .map_err(|_| Status::invalid_argument(format!("invalid machine address {addr:?}")))?;
        request.metadata_mut().append(MACHINES_KEY, value);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_machines_appends_all_addresses() {
        let request =
            with_machines((), &["10.210.0.1".to_string(), "10.210.1.1".to_string()]).unwrap();
        let values: Vec<_> = request
            .metadata()
            .get_all(MACHINES_KEY)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(values, vec!["10.210.0.1", "10.210.1.1"]);
    }
}
