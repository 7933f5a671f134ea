//! Machine service gRPC implementation (local backend).

use crate::machine::{Machine, PublicIpConfig};
use crate::MachineError;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use uncloud_api::proto::machine_server::Machine as MachineApi;
use uncloud_api::proto::{
    CheckPrerequisitesReply, CheckPrerequisitesRequest, CheckPrerequisitesResponse, Empty,
    EmptyReply, EmptyResponse, InitClusterReply, InitClusterRequest, InitClusterResponse,
    InspectReply, InspectResponse, InspectServiceReply, InspectServiceRequest, JoinClusterRequest,
    TokenReply, TokenResponse,
};

pub struct MachineService {
    machine: Arc<Machine>,
}

impl MachineService {
    pub fn new(machine: Arc<Machine>) -> Self {
        Self { machine }
    }
}

#[tonic::async_trait]
impl MachineApi for MachineService {
    async fn check_prerequisites(
        &self,
        _request: Request<CheckPrerequisitesRequest>,
    ) -> Result<Response<CheckPrerequisitesReply>, Status> {
        let (satisfied, missing) = self.machine.check_prerequisites();
        Ok(Response::new(CheckPrerequisitesReply {
            responses: vec![CheckPrerequisitesResponse { metadata: None, satisfied, missing }],
        }))
    }

    async fn init_cluster(
        &self,
        request: Request<InitClusterRequest>,
    ) -> Result<Response<InitClusterReply>, Status> {
        let request = request.into_inner();

        let network = if request.network.is_empty() {
            None
        } else {
            Some(
                request
                    .network
                    .parse()
                    .map_err(|_| MachineError::InvalidNetwork(request.network.clone()))?,
            )
        };
        let public_ip = if request.public_ip_auto {
            PublicIpConfig::Auto
        } else if request.public_ip.is_empty() {
            PublicIpConfig::None
        } else {
            let ip = request.public_ip.parse().map_err(|_| {
                Status::invalid_argument(format!("invalid public IP {:?}", request.public_ip))
            })?;
            PublicIpConfig::Addr(ip)
        };

        let info = self
            .machine
            .init_cluster(&request.machine_name, network, public_ip)
            .await?;
        Ok(Response::new(InitClusterReply {
            responses: vec![InitClusterResponse { metadata: None, machine: Some(info.into()) }],
        }))
    }

    async fn join_cluster(
        &self,
        request: Request<JoinClusterRequest>,
    ) -> Result<Response<EmptyReply>, Status> {
        let request = request.into_inner();

        let allocated: uncloud_model::MachineInfo = request
            .machine
            .ok_or_else(|| Status::invalid_argument("missing machine"))?
            .try_into()
            .map_err(MachineError::from)?;
        let others = request
            .other_machines
            .into_iter()
            .map(|m| m.try_into().map_err(MachineError::from))
            .collect::<Result<Vec<uncloud_model::MachineInfo>, _>>()?;
        let network = request
            .network
            .parse()
            .map_err(|_| MachineError::InvalidNetwork(request.network.clone()))?;

        self.machine.join_cluster(allocated, others, network).await?;
        Ok(Response::new(EmptyReply { responses: vec![EmptyResponse { metadata: None }] }))
    }

    async fn token(&self, _request: Request<Empty>) -> Result<Response<TokenReply>, Status> {
        let token = self.machine.token().await;
        Ok(Response::new(TokenReply {
            responses: vec![TokenResponse { metadata: None, token: token.encode() }],
        }))
    }

    async fn inspect(&self, _request: Request<Empty>) -> Result<Response<InspectReply>, Status> {
        let info = self.machine.inspect().await?;
        Ok(Response::new(InspectReply {
            responses: vec![InspectResponse { metadata: None, machine: Some(info.into()) }],
        }))
    }

    async fn reset(&self, _request: Request<Empty>) -> Result<Response<EmptyReply>, Status> {
        self.machine.reset().await?;
        Ok(Response::new(EmptyReply { responses: vec![EmptyResponse { metadata: None }] }))
    }

    async fn inspect_service(
        &self,
        request: Request<InspectServiceRequest>,
    ) -> Result<Response<InspectServiceReply>, Status> {
        // The machine core keeps no service registry; a fan-out caller reads
        // the per-machine envelopes to locate a service on the machines that
        // do run it.
        let request = request.into_inner();
        Err(Status::not_found(format!("service {:?} not found", request.id)))
    }
}
