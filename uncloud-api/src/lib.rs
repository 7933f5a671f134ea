//! Uncloud API - gRPC surface of the machine daemon
//!
//! Generated tonic services and clients for the `Machine` and `Cluster`
//! services, conversions between proto and model types, and the envelope
//! traits the request proxy uses to stamp per-machine metadata onto replies.

pub mod client;

pub mod proto {
    tonic::include_proto!("uncloud.machine.v1");
}

pub use client::Client;
pub use tonic;

use proto::machine_member::MembershipState as ProtoMembershipState;
use thiserror::Error;
use uncloud_model::{MachineId, MembershipState, NetworkConfig, PublicKey};

/// Metadata key listing the machine addresses a call fans out to.
pub const MACHINES_KEY: &str = "machines";

/// Metadata key marking a call as forwarded by a peer's proxy; such a call
/// must terminate at the receiving machine.
pub const PROXY_AUTHORITY_KEY: &str = "proxy-authority";

/// Port every machine serves its proxy on over the overlay network.
pub const REMOTE_API_PORT: u16 = 51000;

/// Errors converting proto messages to model types.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid subnet {0:?}")]
    InvalidSubnet(String),

    #[error("invalid IP address {0:?}")]
    InvalidAddress(String),

    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("invalid public key length: {0}")]
    InvalidPublicKey(usize),
}

impl From<NetworkConfig> for proto::NetworkConfig {
    fn from(config: NetworkConfig) -> Self {
        proto::NetworkConfig {
            subnet: config.subnet.to_string(),
            management_ip: config.management_ip.to_string(),
            endpoints: config.endpoints.iter().map(|e| e.to_string()).collect(),
            public_key: config.public_key.as_ref().to_vec(),
        }
    }
}

impl TryFrom<proto::NetworkConfig> for NetworkConfig {
    type Error = ConvertError;

    fn try_from(config: proto::NetworkConfig) -> Result<Self, Self::Error> {
        let subnet = config
            .subnet
            .parse()
            .map_err(|_| ConvertError::InvalidSubnet(config.subnet.clone()))?;
        let management_ip = config
            .management_ip
            .parse()
            .map_err(|_| ConvertError::InvalidAddress(config.management_ip.clone()))?;
        let endpoints = config
            .endpoints
            .iter()
            .map(|e| e.parse().map_err(|_| ConvertError::InvalidEndpoint(e.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        let public_key = PublicKey::try_from(config.public_key.as_slice())
            .map_err(|_| ConvertError::InvalidPublicKey(config.public_key.len()))?;
        Ok(NetworkConfig { subnet, management_ip, endpoints, public_key })
    }
}

impl From<uncloud_model::MachineInfo> for proto::MachineInfo {
    fn from(info: uncloud_model::MachineInfo) -> Self {
        proto::MachineInfo {
            id: info.id.to_string(),
            name: info.name,
            public_ip: info.public_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            network: Some(info.network.into()),
        }
    }
}

impl TryFrom<proto::MachineInfo> for uncloud_model::MachineInfo {
    type Error = ConvertError;

    fn try_from(info: proto::MachineInfo) -> Result<Self, Self::Error> {
        let network = info
            .network
            .ok_or(ConvertError::MissingField("network"))?
            .try_into()?;
        let public_ip = if info.public_ip.is_empty() {
            None
        } else {
            Some(
                info.public_ip
                    .parse()
                    .map_err(|_| ConvertError::InvalidAddress(info.public_ip.clone()))?,
            )
        };
        Ok(uncloud_model::MachineInfo {
            id: MachineId::from(info.id),
            name: info.name,
            public_ip,
            network,
        })
    }
}

impl From<MembershipState> for ProtoMembershipState {
    fn from(state: MembershipState) -> Self {
        match state {
            MembershipState::Up => ProtoMembershipState::Up,
            MembershipState::Suspect => ProtoMembershipState::Suspect,
            MembershipState::Down => ProtoMembershipState::Down,
        }
    }
}

impl From<ProtoMembershipState> for MembershipState {
    fn from(state: ProtoMembershipState) -> Self {
        match state {
            ProtoMembershipState::Up | ProtoMembershipState::Unspecified => MembershipState::Up,
            ProtoMembershipState::Suspect => MembershipState::Suspect,
            ProtoMembershipState::Down => MembershipState::Down,
        }
    }
}

impl proto::Metadata {
    /// Metadata for a successful reply from `machine`.
    pub fn ok(machine: impl Into<String>) -> Self {
        proto::Metadata { machine: machine.into(), status: None }
    }

    /// Metadata for a failed branch of a fan-out.
    pub fn failed(machine: impl Into<String>, status: &tonic::Status) -> Self {
        proto::Metadata {
            machine: machine.into(),
            status: Some(proto::Status {
                code: status.code() as i32,
                message: status.message().to_string(),
            }),
        }
    }
}

/// A reply message carrying per-machine metadata. The proxy stamps the
/// producing machine's address (and failure status) on every envelope.
pub trait Envelope: Default + Clone + Send + 'static {
    fn metadata(&self) -> Option<&proto::Metadata>;
    fn set_metadata(&mut self, metadata: proto::Metadata);
}

/// A reply that aggregates one envelope per requested machine, in request
/// order.
pub trait Reply: Default + Send + 'static {
    type Envelope: Envelope;

    fn into_envelopes(self) -> Vec<Self::Envelope>;
    fn from_envelopes(envelopes: Vec<Self::Envelope>) -> Self;
}

macro_rules! impl_envelope {
    ($response:ty, $reply:ty) => {
        impl Envelope for $response {
            fn metadata(&self) -> Option<&proto::Metadata> {
                self.metadata.as_ref()
            }
            fn set_metadata(&mut self, metadata: proto::Metadata) {
                self.metadata = Some(metadata);
            }
        }

        impl Reply for $reply {
            type Envelope = $response;

            fn into_envelopes(self) -> Vec<Self::Envelope> {
                self.responses
            }
            fn from_envelopes(envelopes: Vec<Self::Envelope>) -> Self {
                Self { responses: envelopes }
            }
        }
    };
}

impl_envelope!(proto::EmptyResponse, proto::EmptyReply);
impl_envelope!(proto::CheckPrerequisitesResponse, proto::CheckPrerequisitesReply);
impl_envelope!(proto::InitClusterResponse, proto::InitClusterReply);
impl_envelope!(proto::TokenResponse, proto::TokenReply);
impl_envelope!(proto::InspectResponse, proto::InspectReply);
impl_envelope!(proto::InspectServiceResponse, proto::InspectServiceReply);
impl_envelope!(proto::AddMachineResponse, proto::AddMachineReply);
impl_envelope!(proto::ListMachinesResponse, proto::ListMachinesReply);
impl_envelope!(proto::UpdateMachineResponse, proto::UpdateMachineReply);

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn model_config() -> NetworkConfig {
        NetworkConfig {
            subnet: "10.210.1.0/24".parse().unwrap(),
            management_ip: "10.210.1.1".parse().unwrap(),
            endpoints: vec!["203.0.113.5:51820".parse().unwrap()],
            public_key: PublicKey([9; 32]),
        }
    }

    #[test]
    fn network_config_round_trip() {
        let config = model_config();
        let proto_config: proto::NetworkConfig = config.clone().into();
        assert_eq!(proto_config.subnet, "10.210.1.0/24");
        assert_eq!(proto_config.public_key.len(), 32);

        let back: NetworkConfig = proto_config.try_into().unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn machine_info_empty_public_ip_is_none() {
        let info = proto::MachineInfo {
            id: "abc".into(),
            name: "m1".into(),
            public_ip: String::new(),
            network: Some(model_config().into()),
        };
        let model: uncloud_model::MachineInfo = info.try_into().unwrap();
        assert_eq!(model.public_ip, None);

        let info = proto::MachineInfo {
            id: "abc".into(),
            name: "m1".into(),
            public_ip: "203.0.113.5".into(),
            network: Some(model_config().into()),
        };
        let model: uncloud_model::MachineInfo = info.try_into().unwrap();
        assert_eq!(model.public_ip, Some("203.0.113.5".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn machine_info_requires_network() {
        let info = proto::MachineInfo {
            id: "abc".into(),
            name: "m1".into(),
            public_ip: String::new(),
            network: None,
        };
        let result: Result<uncloud_model::MachineInfo, _> = info.try_into();
        assert!(matches!(result, Err(ConvertError::MissingField("network"))));
    }

    #[test]
    fn metadata_failed_carries_grpc_status() {
        let status = tonic::Status::unavailable("machine unreachable");
        let metadata = proto::Metadata::failed("10.210.1.1", &status);
        let inner = metadata.status.unwrap();
        assert_eq!(inner.code, tonic::Code::Unavailable as i32);
        assert_eq!(inner.message, "machine unreachable");
    }

    #[test]
    fn reply_envelope_round_trip() {
        let mut envelope = proto::ListMachinesResponse::default();
        envelope.set_metadata(proto::Metadata::ok("10.210.0.1"));
        let reply = proto::ListMachinesReply::from_envelopes(vec![envelope.clone()]);
        let envelopes = reply.into_envelopes();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].metadata().unwrap().machine, "10.210.0.1");
    }
}
