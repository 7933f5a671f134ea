//! Proxy-side gRPC services.
//!
//! Every method goes through the director: with no machine list it
//! short-circuits to the local backend, with one it forwards, with many it
//! fans out. The services hold no business logic; the local backend does.

use crate::director::Director;
use crate::dispatch::dispatch;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use uncloud_api::proto::cluster_client::ClusterClient;
use uncloud_api::proto::cluster_server::Cluster;
use uncloud_api::proto::machine_client::MachineClient;
use uncloud_api::proto::machine_server::Machine;
use uncloud_api::proto::{
    AddMachineReply, AddMachineRequest, CheckPrerequisitesReply, CheckPrerequisitesRequest, Empty,
    EmptyReply, InitClusterReply, InitClusterRequest, InspectReply, InspectServiceReply,
    InspectServiceRequest, JoinClusterRequest, ListMachinesReply, ListMachinesRequest,
    RemoveMachineRequest, TokenReply, UpdateMachineReply, UpdateMachineRequest,
};

/// `Machine` service fronted by the director.
pub struct ProxyMachineService {
    director: Arc<Director>,
}

impl ProxyMachineService {
    pub fn new(director: Arc<Director>) -> Self {
        Self { director }
    }
}

#[tonic::async_trait]
impl Machine for ProxyMachineService {
    async fn check_prerequisites(
        &self,
        request: Request<CheckPrerequisitesRequest>,
    ) -> Result<Response<CheckPrerequisitesReply>, Status> {
        dispatch(&self.director, request, |channel, req| async move {
            Ok(MachineClient::new(channel).check_prerequisites(req).await?.into_inner())
        })
        .await
    }

    async fn init_cluster(
        &self,
        request: Request<InitClusterRequest>,
    ) -> Result<Response<InitClusterReply>, Status> {
        dispatch(&self.director, request, |channel, req| async move {
            Ok(MachineClient::new(channel).init_cluster(req).await?.into_inner())
        })
        .await
    }

    async fn join_cluster(
        &self,
        request: Request<JoinClusterRequest>,
    ) -> Result<Response<EmptyReply>, Status> {
        dispatch(&self.director, request, |channel, req| async move {
            Ok(MachineClient::new(channel).join_cluster(req).await?.into_inner())
        })
        .await
    }

    async fn token(&self, request: Request<Empty>) -> Result<Response<TokenReply>, Status> {
        dispatch(&self.director, request, |channel, req| async move {
            Ok(MachineClient::new(channel).token(req).await?.into_inner())
        })
        .await
    }

    async fn inspect(&self, request: Request<Empty>) -> Result<Response<InspectReply>, Status> {
        dispatch(&self.director, request, |channel, req| async move {
            Ok(MachineClient::new(channel).inspect(req).await?.into_inner())
        })
        .await
    }

    async fn reset(&self, request: Request<Empty>) -> Result<Response<EmptyReply>, Status> {
        dispatch(&self.director, request, |channel, req| async move {
            Ok(MachineClient::new(channel).reset(req).await?.into_inner())
        })
        .await
    }

    async fn inspect_service(
        &self,
        request: Request<InspectServiceRequest>,
    ) -> Result<Response<InspectServiceReply>, Status> {
        dispatch(&self.director, request, |channel, req| async move {
            Ok(MachineClient::new(channel).inspect_service(req).await?.into_inner())
        })
        .await
    }
}

/// `Cluster` service fronted by the director.
pub struct ProxyClusterService {
    director: Arc<Director>,
}

impl ProxyClusterService {
    pub fn new(director: Arc<Director>) -> Self {
        Self { director }
    }
}

#[tonic::async_trait]
impl Cluster for ProxyClusterService {
    async fn add_machine(
        &self,
        request: Request<AddMachineRequest>,
    ) -> Result<Response<AddMachineReply>, Status> {
        dispatch(&self.director, request, |channel, req| async move {
            Ok(ClusterClient::new(channel).add_machine(req).await?.into_inner())
        })
        .await
    }

    async fn list_machines(
        &self,
        request: Request<ListMachinesRequest>,
    ) -> Result<Response<ListMachinesReply>, Status> {
        dispatch(&self.director, request, |channel, req| async move {
            Ok(ClusterClient::new(channel).list_machines(req).await?.into_inner())
        })
        .await
    }

    async fn update_machine(
        &self,
        request: Request<UpdateMachineRequest>,
    ) -> Result<Response<UpdateMachineReply>, Status> {
        dispatch(&self.director, request, |channel, req| async move {
            Ok(ClusterClient::new(channel).update_machine(req).await?.into_inner())
        })
        .await
    }

    async fn remove_machine(
        &self,
        request: Request<RemoveMachineRequest>,
    ) -> Result<Response<EmptyReply>, Status> {
        dispatch(&self.director, request, |channel, req| async move {
            Ok(ClusterClient::new(channel).remove_machine(req).await?.into_inner())
        })
        .await
    }
}
