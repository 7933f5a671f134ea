//! Cluster service gRPC implementation (local backend).
//!
//! Mutations apply to the local roster first; the machine runtime broadcasts
//! them to peers unless the request itself arrived as a forwarded replication
//! (marked by the proxy's `proxy-authority` metadata), which is what keeps a
//! broadcast from echoing around the cluster forever.

use crate::machine::Machine;
use crate::MachineError;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use uncloud_api::proto::cluster_server::Cluster as ClusterApi;
use uncloud_api::proto::{
    AddMachineReply, AddMachineRequest, AddMachineResponse, EmptyReply, EmptyResponse,
    ListMachinesReply, ListMachinesRequest, ListMachinesResponse, MachineMember,
    RemoveMachineRequest, UpdateMachineReply, UpdateMachineRequest, UpdateMachineResponse,
};
use uncloud_api::{ConvertError, PROXY_AUTHORITY_KEY};
use uncloud_model::{MachineId, PublicKey};

pub struct ClusterService {
    machine: Arc<Machine>,
}

impl ClusterService {
    pub fn new(machine: Arc<Machine>) -> Self {
        Self { machine }
    }
}

fn is_replicated<T>(request: &Request<T>) -> bool {
    request.metadata().contains_key(PROXY_AUTHORITY_KEY)
}

fn parse_endpoints(endpoints: &[String]) -> Result<Vec<SocketAddr>, MachineError> {
    endpoints
        .iter()
        .map(|e| {
            e.parse()
                .map_err(|_| MachineError::Convert(ConvertError::InvalidEndpoint(e.clone())))
        })
        .collect()
}

#[tonic::async_trait]
impl ClusterApi for ClusterService {
    async fn add_machine(
        &self,
        request: Request<AddMachineRequest>,
    ) -> Result<Response<AddMachineReply>, Status> {
        let message = request.into_inner();

        let info = match message.allocated {
            // A replication of a record another machine allocated.
            Some(allocated) => {
                let info: uncloud_model::MachineInfo =
                    allocated.try_into().map_err(MachineError::from)?;
                self.machine.apply_machine(info.clone()).await?;
                info
            }
            None => {
                let public_ip: Option<IpAddr> = if message.public_ip.is_empty() {
                    None
                } else {
                    Some(message.public_ip.parse().map_err(|_| {
                        Status::invalid_argument(format!(
                            "invalid public IP {:?}",
                            message.public_ip
                        ))
                    })?)
                };
                let endpoints = parse_endpoints(&message.endpoints)?;
                let public_key =
                    PublicKey::try_from(message.public_key.as_slice()).map_err(|_| {
                        Status::invalid_argument("public key must be 32 bytes")
                    })?;
                self.machine
                    .add_machine(&message.name, public_ip, endpoints, public_key)
                    .await?
            }
        };

        Ok(Response::new(AddMachineReply {
            responses: vec![AddMachineResponse { metadata: None, machine: Some(info.into()) }],
        }))
    }

    async fn list_machines(
        &self,
        _request: Request<ListMachinesRequest>,
    ) -> Result<Response<ListMachinesReply>, Status> {
        let machines = self
            .machine
            .list_machines()
            .into_iter()
            .map(|(info, state)| MachineMember {
                machine: Some(info.into()),
                state: uncloud_api::proto::machine_member::MembershipState::from(state) as i32,
            })
            .collect();

        Ok(Response::new(ListMachinesReply {
            responses: vec![ListMachinesResponse { metadata: None, machines }],
        }))
    }

    async fn update_machine(
        &self,
        request: Request<UpdateMachineRequest>,
    ) -> Result<Response<UpdateMachineReply>, Status> {
        let replicated = is_replicated(&request);
        let message = request.into_inner();

        let public_ip: Option<Option<IpAddr>> = match message.public_ip {
            None => None,
            // An empty string clears the public IP.
            Some(s) if s.is_empty() => Some(None),
            Some(s) => Some(Some(s.parse().map_err(|_| {
                Status::invalid_argument(format!("invalid public IP {s:?}"))
            })?)),
        };
        let endpoints = match message.endpoints {
            None => None,
            Some(list) => Some(parse_endpoints(&list.endpoints)?),
        };

        let info = self
            .machine
            .update_machine(
                &MachineId::from(message.id),
                message.name,
                public_ip,
                endpoints,
                replicated,
            )
            .await?;

        Ok(Response::new(UpdateMachineReply {
            responses: vec![UpdateMachineResponse { metadata: None, machine: Some(info.into()) }],
        }))
    }

    async fn remove_machine(
        &self,
        request: Request<RemoveMachineRequest>,
    ) -> Result<Response<EmptyReply>, Status> {
        let replicated = is_replicated(&request);
        let message = request.into_inner();

        self.machine.remove_machine(&MachineId::from(message.id), replicated).await?;
        Ok(Response::new(EmptyReply { responses: vec![EmptyResponse { metadata: None }] }))
    }
}
