//! Kernel-backed tunnel device for Linux.
//!
//! WireGuard configuration goes through the kernel's generic netlink API
//! (`wireguard-control`); link, address, and route programming goes through
//! route netlink (`rtnetlink`). A fresh netlink connection is opened per
//! operation and dropped afterwards.

use crate::device::{DeviceConfig, DevicePeer, DeviceState, WgDevice};
use crate::error::WgError;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use ipnet::IpNet;
use rtnetlink::packet::address::Nla as AddressNla;
use rtnetlink::packet::constants::RT_SCOPE_LINK;
use rtnetlink::packet::nlas::link::{Info as LinkInfo, InfoKind as LinkInfoKind, Nla as LinkNla};
use rtnetlink::packet::route::Nla as RouteNla;
use rtnetlink::packet::{AddressMessage, RouteMessage};
use rtnetlink::{Handle, IpVersion};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use uncloud_model::PublicKey;
use wireguard_control::{
    AllowedIp, Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder,
};

/// Tunnel device programmed via netlink.
pub struct LinuxDevice {
    name: InterfaceName,
}

impl LinuxDevice {
    pub fn new(name: &str) -> Result<Self, WgError> {
        let name = name
            .parse::<InterfaceName>()
            .map_err(|e| WgError::Device(format!("invalid interface name {name:?}: {e}")))?;
        Ok(Self { name })
    }

    fn name_str(&self) -> String {
        self.name.as_str_lossy().into_owned()
    }

    async fn handle(&self) -> Result<Handle, WgError> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| WgError::Netlink(format!("open route netlink connection: {e}")))?;
        tokio::spawn(connection);
        Ok(handle)
    }

    async fn link_index(&self, handle: &Handle) -> Result<u32, WgError> {
        let mut links = handle.link().get().match_name(self.name_str()).execute();
        let link = links
            .try_next()
            .await
            .map_err(|e| WgError::Netlink(format!("find link {:?}: {e}", self.name_str())))?
            .ok_or_else(|| WgError::Device(format!("link {:?} not found", self.name_str())))?;
        Ok(link.header.index)
    }
}

#[async_trait]
impl WgDevice for LinuxDevice {
    async fn ensure_link(&self) -> Result<(), WgError> {
        let handle = self.handle().await?;
        let mut links = handle.link().get().match_name(self.name_str()).execute();
        match links.try_next().await {
            Ok(Some(_)) => {
                tracing::info!(name = %self.name_str(), "found existing tunnel interface");
                return Ok(());
            }
            Ok(None) | Err(_) => {}
        }
        let mut request = handle.link().add();
        {
            let message = request.message_mut();
            message.nlas.push(LinkNla::IfName(self.name_str()));
            message
                .nlas
                .push(LinkNla::Info(vec![LinkInfo::Kind(LinkInfoKind::Wireguard)]));
        }
        request
            .execute()
            .await
            .map_err(|e| WgError::Netlink(format!("create link {:?}: {e}", self.name_str())))?;
        tracing::info!(name = %self.name_str(), "created tunnel interface");
        Ok(())
    }

    async fn read_state(&self) -> Result<DeviceState, WgError> {
        let device = Device::get(&self.name, Backend::Kernel)
            .map_err(|e| WgError::Device(format!("get device {:?}: {e}", self.name_str())))?;
        let peers = device
            .peers
            .iter()
            .map(|p| DevicePeer {
                public_key: PublicKey(p.config.public_key.0),
                endpoint: p.config.endpoint,
                last_handshake: p.stats.last_handshake_time,
                allowed_ips: p
                    .config
                    .allowed_ips
                    .iter()
                    .filter_map(|ip| IpNet::new(ip.address, ip.cidr).ok())
                    .collect(),
            })
            .collect();
        Ok(DeviceState { listen_port: device.listen_port, peers })
    }

    async fn apply(&self, config: DeviceConfig) -> Result<(), WgError> {
        let mut update = DeviceUpdate::new();
        if let Some(keys) = &config.private_key {
            update = update.set_private_key(Key(*keys.secret_bytes()));
        }
        if let Some(port) = config.listen_port {
            update = update.set_listen_port(port);
        }
        if config.replace_peers {
            update = update.replace_peers();
        }
        for patch in &config.peers {
            let key = Key(patch.public_key.0);
            if patch.remove {
                update = update.remove_peer_by_key(&key);
                continue;
            }
            let mut peer = PeerConfigBuilder::new(&key);
            if let Some(endpoint) = patch.endpoint {
                peer = peer.set_endpoint(endpoint);
            }
            if patch.replace_allowed_ips {
                let allowed: Vec<AllowedIp> = patch
                    .allowed_ips
                    .iter()
                    .map(|net| AllowedIp { address: net.addr(), cidr: net.prefix_len() })
                    .collect();
                peer = peer.replace_allowed_ips().add_allowed_ips(&allowed);
            }
            update = update.add_peer(peer);
        }
        update
            .apply(&self.name, Backend::Kernel)
            .map_err(|e| WgError::Device(format!("configure device {:?}: {e}", self.name_str())))
    }

    async fn addresses(&self) -> Result<Vec<IpNet>, WgError> {
        let handle = self.handle().await?;
        let index = self.link_index(&handle).await?;
        let mut stream =
            handle.address().get().set_link_index_filter(index).execute();
        let mut addrs = Vec::new();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| WgError::Netlink(format!("list addresses: {e}")))?
        {
            if let Some(addr) = address_from_message(&msg) {
                addrs.push(addr);
            }
        }
        Ok(addrs)
    }

    async fn add_address(&self, addr: IpNet) -> Result<(), WgError> {
        let handle = self.handle().await?;
        let index = self.link_index(&handle).await?;
        handle
            .address()
            .add(index, addr.addr(), addr.prefix_len())
            .execute()
            .await
            .map_err(|e| WgError::Netlink(format!("add address {addr}: {e}")))
    }

    async fn remove_address(&self, addr: IpNet) -> Result<(), WgError> {
        let handle = self.handle().await?;
        let index = self.link_index(&handle).await?;
        let mut stream =
            handle.address().get().set_link_index_filter(index).execute();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| WgError::Netlink(format!("list addresses: {e}")))?
        {
            if address_from_message(&msg) == Some(addr) {
                handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| WgError::Netlink(format!("remove address {addr}: {e}")))?;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn link_up(&self) -> Result<(), WgError> {
        let handle = self.handle().await?;
        let index = self.link_index(&handle).await?;
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| WgError::Netlink(format!("set link up: {e}")))
    }

    async fn routes(&self) -> Result<Vec<IpNet>, WgError> {
        let handle = self.handle().await?;
        let index = self.link_index(&handle).await?;
        let mut out = Vec::new();
        for version in [IpVersion::V4, IpVersion::V6] {
            let mut stream = handle.route().get(version).execute();
            while let Some(msg) = stream
                .try_next()
                .await
                .map_err(|e| WgError::Netlink(format!("list routes: {e}")))?
            {
                if route_output_interface(&msg) != Some(index) {
                    continue;
                }
                if let Some(dst) = route_destination(&msg) {
                    out.push(dst);
                }
            }
        }
        Ok(out)
    }

    async fn add_route(&self, dst: IpNet) -> Result<(), WgError> {
        let handle = self.handle().await?;
        let index = self.link_index(&handle).await?;
        match dst {
            IpNet::V4(net) => handle
                .route()
                .add()
                .v4()
                .destination_prefix(net.addr(), net.prefix_len())
                .output_interface(index)
                .scope(RT_SCOPE_LINK)
                .execute()
                .await,
            IpNet::V6(net) => handle
                .route()
                .add()
                .v6()
                .destination_prefix(net.addr(), net.prefix_len())
                .output_interface(index)
                .scope(RT_SCOPE_LINK)
                .execute()
                .await,
        }
        .map_err(|e| WgError::Netlink(format!("add route {dst}: {e}")))
    }

    async fn remove_route(&self, dst: IpNet) -> Result<(), WgError> {
        let handle = self.handle().await?;
        let index = self.link_index(&handle).await?;
        let version = match dst {
            IpNet::V4(_) => IpVersion::V4,
            IpNet::V6(_) => IpVersion::V6,
        };
        let mut stream = handle.route().get(version).execute();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| WgError::Netlink(format!("list routes: {e}")))?
        {
            if route_output_interface(&msg) == Some(index) && route_destination(&msg) == Some(dst) {
                handle
                    .route()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| WgError::Netlink(format!("remove route {dst}: {e}")))?;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn delete_link(&self) -> Result<(), WgError> {
        let handle = self.handle().await?;
        let index = self.link_index(&handle).await?;
        handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| WgError::Netlink(format!("delete link {:?}: {e}", self.name_str())))
    }
}

fn address_from_message(msg: &AddressMessage) -> Option<IpNet> {
    let prefix_len = msg.header.prefix_len;
    for nla in &msg.nlas {
        if let AddressNla::Address(bytes) = nla {
            let ip = bytes_to_ip(bytes)?;
            return IpNet::new(ip, prefix_len).ok();
        }
    }
    None
}

fn route_output_interface(msg: &RouteMessage) -> Option<u32> {
    msg.nlas.iter().find_map(|nla| match nla {
        RouteNla::Oif(index) => Some(*index),
        _ => None,
    })
}

fn route_destination(msg: &RouteMessage) -> Option<IpNet> {
    let prefix_len = msg.header.destination_prefix_length;
    msg.nlas.iter().find_map(|nla| match nla {
        RouteNla::Destination(bytes) => {
            let ip = bytes_to_ip(bytes)?;
            IpNet::new(ip, prefix_len).ok()
        }
        _ => None,
    })
}

fn bytes_to_ip(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
