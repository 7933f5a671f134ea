// Each integration test compiles as a separate binary that includes this module via `mod common;`.
// Not every test binary uses every helper, so Rust emits spurious dead_code warnings.
#![allow(dead_code)]
//! In-process backend servers for proxy integration tests.

use std::path::{Path, PathBuf};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use uncloud_api::proto::cluster_server::{Cluster, ClusterServer};
use uncloud_api::proto::machine_server::{Machine, MachineServer};
use uncloud_api::proto::{
    AddMachineReply, AddMachineRequest, CheckPrerequisitesReply, CheckPrerequisitesRequest, Empty,
    EmptyReply, EmptyResponse, InitClusterReply, InitClusterRequest, InspectReply,
    InspectResponse, InspectServiceReply, InspectServiceRequest, JoinClusterRequest,
    ListMachinesReply, ListMachinesRequest, ListMachinesResponse, MachineInfo, MachineMember,
    RemoveMachineRequest, TokenReply, UpdateMachineReply, UpdateMachineRequest,
};

/// A minimal local backend that answers with its own machine name, enough to
/// tell apart which machine produced each envelope.
#[derive(Clone)]
pub struct StubBackend {
    pub name: String,
}

impl StubBackend {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }

    fn member(&self) -> MachineMember {
        MachineMember {
            machine: Some(MachineInfo {
                id: format!("id-{}", self.name),
                name: self.name.clone(),
                public_ip: String::new(),
                network: None,
            }),
            state: 1,
        }
    }
}

#[tonic::async_trait]
impl Machine for StubBackend {
    async fn check_prerequisites(
        &self,
        _request: Request<CheckPrerequisitesRequest>,
    ) -> Result<Response<CheckPrerequisitesReply>, Status> {
        Err(Status::unimplemented("not under test"))
    }

    async fn init_cluster(
        &self,
        _request: Request<InitClusterRequest>,
    ) -> Result<Response<InitClusterReply>, Status> {
        Err(Status::unimplemented("not under test"))
    }

    async fn join_cluster(
        &self,
        _request: Request<JoinClusterRequest>,
    ) -> Result<Response<EmptyReply>, Status> {
        Err(Status::unimplemented("not under test"))
    }

    async fn token(&self, _request: Request<Empty>) -> Result<Response<TokenReply>, Status> {
        Err(Status::unimplemented("not under test"))
    }

    async fn inspect(&self, _request: Request<Empty>) -> Result<Response<InspectReply>, Status> {
        Ok(Response::new(InspectReply {
            responses: vec![InspectResponse {
                metadata: None,
                machine: self.member().machine,
            }],
        }))
    }

    async fn reset(&self, _request: Request<Empty>) -> Result<Response<EmptyReply>, Status> {
        Ok(Response::new(EmptyReply { responses: vec![EmptyResponse { metadata: None }] }))
    }

    async fn inspect_service(
        &self,
        _request: Request<InspectServiceRequest>,
    ) -> Result<Response<InspectServiceReply>, Status> {
        Err(Status::not_found("service not found"))
    }
}

#[tonic::async_trait]
impl Cluster for StubBackend {
    async fn add_machine(
        &self,
        _request: Request<AddMachineRequest>,
    ) -> Result<Response<AddMachineReply>, Status> {
        Err(Status::unimplemented("not under test"))
    }

    async fn list_machines(
        &self,
        _request: Request<ListMachinesRequest>,
    ) -> Result<Response<ListMachinesReply>, Status> {
        Ok(Response::new(ListMachinesReply {
            responses: vec![ListMachinesResponse {
                metadata: None,
                machines: vec![self.member()],
            }],
        }))
    }

    async fn update_machine(
        &self,
        _request: Request<UpdateMachineRequest>,
    ) -> Result<Response<UpdateMachineReply>, Status> {
        Err(Status::unimplemented("not under test"))
    }

    async fn remove_machine(
        &self,
        _request: Request<RemoveMachineRequest>,
    ) -> Result<Response<EmptyReply>, Status> {
        Ok(Response::new(EmptyReply { responses: vec![EmptyResponse { metadata: None }] }))
    }
}

/// Serve a stub backend on a Unix socket until cancelled.
pub fn spawn_backend(name: &str, socket_path: &Path, cancel: CancellationToken) {
    let stub = StubBackend::new(name);
    let socket_path: PathBuf = socket_path.to_path_buf();
    tokio::spawn(async move {
        let listener = UnixListener::bind(&socket_path).expect("bind backend socket");
        Server::builder()
            .add_service(MachineServer::new(stub.clone()))
            .add_service(ClusterServer::new(stub))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                cancel.cancelled().await;
            })
            .await
            .expect("backend server");
    });
}

/// Wait for a Unix socket to appear.
pub async fn wait_for_socket(path: &Path) {
    for _ in 0..50 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("socket {:?} did not appear", path);
}
