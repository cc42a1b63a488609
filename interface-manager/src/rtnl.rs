// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! [`LinkOps`] over rtnetlink.

use crate::link::{
    LINK_EVENT_BACKLOG, LinkError, LinkEvent, LinkEvents, LinkInfo, LinkOps, LinkSelector,
};
use crate::netns::Netns;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use ipnet::IpNet;
use net::{InterfaceName, Mac};
use rtnetlink::packet_core::NetlinkPayload;
use rtnetlink::packet_route::RouteNetlinkMessage;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
use rtnetlink::packet_route::route::RouteAttribute;
use rtnetlink::sys::{AsyncSocket, SocketAddr};
use rtnetlink::{Handle, LinkUnspec, RouteMessageBuilder};
use std::fmt::Display;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Links of the namespace the connection was opened in.
#[derive(Clone)]
pub struct RtnlLinks {
    handle: Handle,
}

impl RtnlLinks {
    /// Open a netlink connection in the calling thread's network namespace.
    ///
    /// Must be called from within a tokio runtime: the connection is driven by a spawned task.
    pub fn connect() -> Result<RtnlLinks, LinkError> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(RtnlLinks { handle })
    }

    async fn set(&self, message: LinkMessage, subject: String) -> Result<(), LinkError> {
        self.handle
            .link()
            .set(message)
            .execute()
            .await
            .map_err(|e| netlink_error(e, subject))
    }
}

/// Map an rtnetlink error onto the [`LinkError`] taxonomy.
fn netlink_error(err: rtnetlink::Error, subject: impl Display) -> LinkError {
    match err {
        rtnetlink::Error::NetlinkError(message) => match message.code {
            Some(code) => LinkError::from_errno(-code.get(), subject.to_string()),
            None => LinkError::Netlink(format!("{subject}: unexpected acknowledgement")),
        },
        other => LinkError::Netlink(format!("{subject}: {other}")),
    }
}

fn link_info(message: LinkMessage) -> Result<LinkInfo, LinkError> {
    let mut name = None;
    let mut mac = None;
    let mut mtu = 0;
    let mut alias = None;
    for attribute in message.attributes {
        match attribute {
            LinkAttribute::IfName(value) => name = Some(value),
            LinkAttribute::Address(bytes) => {
                mac = Mac::try_from(bytes.as_slice()).ok().filter(|m| !m.is_zero());
            }
            LinkAttribute::Mtu(value) => mtu = value,
            LinkAttribute::IfAlias(value) if !value.is_empty() => alias = Some(value),
            _ => {}
        }
    }
    let index = message.header.index;
    let name = name.ok_or_else(|| LinkError::Netlink(format!("link {index} has no name")))?;
    Ok(LinkInfo {
        index,
        name: InterfaceName::new(name)?,
        mac,
        mtu,
        up: message.header.flags.contains(LinkFlags::Up),
        loopback: message.header.flags.contains(LinkFlags::Loopback),
        alias,
    })
}

#[async_trait]
impl LinkOps for RtnlLinks {
    type Namespace = Netns;

    async fn links(&self) -> Result<Vec<LinkInfo>, LinkError> {
        let mut dump = self.handle.link().get().execute();
        let mut links = Vec::new();
        while let Some(message) = dump
            .try_next()
            .await
            .map_err(|e| netlink_error(e, "link dump"))?
        {
            match link_info(message) {
                Ok(link) => links.push(link),
                Err(e) => warn!("Skipping link: {e}"),
            }
        }
        links.sort_by_key(|link| link.index);
        Ok(links)
    }

    async fn link(&self, selector: &LinkSelector) -> Result<LinkInfo, LinkError> {
        match selector {
            LinkSelector::Name(name) => {
                let message = self
                    .handle
                    .link()
                    .get()
                    .match_name(name.to_string())
                    .execute()
                    .try_next()
                    .await
                    .map_err(|e| netlink_error(e, format!("link {name}")))?
                    .ok_or_else(|| LinkError::NotFound(format!("link {name}")))?;
                link_info(message)
            }
            LinkSelector::Mac(_) => self
                .links()
                .await?
                .into_iter()
                .find(|link| selector.matches(link))
                .ok_or_else(|| LinkError::NotFound(format!("link {selector}"))),
        }
    }

    async fn set_admin_state(&self, index: u32, up: bool) -> Result<(), LinkError> {
        trace!("Setting link {index} {}", if up { "up" } else { "down" });
        let builder = LinkUnspec::new_with_index(index);
        let message = if up { builder.up() } else { builder.down() }.build();
        self.set(message, format!("link {index}")).await
    }

    async fn set_alias(&self, index: u32, alias: &str) -> Result<(), LinkError> {
        trace!("Setting alias of link {index} to {alias}");
        let mut message = LinkUnspec::new_with_index(index).build();
        message
            .attributes
            .push(LinkAttribute::IfAlias(alias.to_string()));
        self.set(message, format!("link {index}")).await
    }

    async fn rename(&self, index: u32, name: &InterfaceName) -> Result<(), LinkError> {
        trace!("Renaming link {index} to {name}");
        let message = LinkUnspec::new_with_index(index)
            .name(name.to_string())
            .build();
        self.set(message, format!("link {index} (as {name})"))
            .await
    }

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<(), LinkError> {
        trace!("Setting mtu of link {index} to {mtu}");
        let message = LinkUnspec::new_with_index(index).mtu(mtu).build();
        self.set(message, format!("link {index}")).await
    }

    async fn move_to(&self, index: u32, namespace: &Netns) -> Result<(), LinkError> {
        debug!(
            "Moving link {index} to network namespace {}",
            namespace.path().display()
        );
        let message = LinkUnspec::new_with_index(index)
            .setns_by_fd(namespace.as_raw_fd())
            .build();
        self.set(message, format!("link {index}")).await
    }

    async fn addresses(&self, index: u32) -> Result<Vec<IpNet>, LinkError> {
        let mut dump = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        let mut addresses = Vec::new();
        while let Some(message) = dump
            .try_next()
            .await
            .map_err(|e| netlink_error(e, format!("addresses of link {index}")))?
        {
            let mut local = None;
            let mut address = None;
            for attribute in &message.attributes {
                match attribute {
                    AddressAttribute::Local(ip) => local = Some(*ip),
                    AddressAttribute::Address(ip) => address = Some(*ip),
                    _ => {}
                }
            }
            // IFA_ADDRESS is the peer on point to point links; IFA_LOCAL is ours when present
            let Some(ip) = local.or(address) else {
                continue;
            };
            match IpNet::new(ip, message.header.prefix_len) {
                Ok(net) => addresses.push(net),
                Err(e) => warn!("Ignoring address {ip} of link {index}: {e}"),
            }
        }
        Ok(addresses)
    }

    async fn add_address(&self, index: u32, address: IpNet) -> Result<(), LinkError> {
        trace!("Adding {address} to link {index}");
        self.handle
            .address()
            .add(index, address.addr(), address.prefix_len())
            .execute()
            .await
            .map_err(|e| netlink_error(e, format!("address {address} on link {index}")))
    }

    async fn default_route_link(&self) -> Result<Option<u32>, LinkError> {
        let request = RouteMessageBuilder::<Ipv4Addr>::new().build();
        let mut dump = self.handle.route().get(request).execute();
        while let Some(route) = dump
            .try_next()
            .await
            .map_err(|e| netlink_error(e, "route dump"))?
        {
            if route.header.destination_prefix_length != 0 {
                continue;
            }
            let mut gateway = false;
            let mut oif = None;
            for attribute in &route.attributes {
                match attribute {
                    RouteAttribute::Gateway(_) => gateway = true,
                    RouteAttribute::Oif(index) => oif = Some(*index),
                    RouteAttribute::MultiPath(hops) => {
                        let hop = hops.iter().find(|hop| {
                            hop.attributes
                                .iter()
                                .any(|a| matches!(a, RouteAttribute::Gateway(_)))
                        });
                        if let Some(hop) = hop {
                            return Ok(Some(hop.interface_index));
                        }
                    }
                    _ => {}
                }
            }
            if gateway && oif.is_some() {
                return Ok(oif);
            }
        }
        Ok(None)
    }

    async fn subscribe(&self) -> Result<LinkEvents, LinkError> {
        let (mut connection, _, mut messages) = rtnetlink::new_connection()?;
        let groups = rtnetlink::constants::RTMGRP_LINK;
        connection
            .socket_mut()
            .socket_mut()
            .bind(&SocketAddr::new(0, groups))?;
        tokio::spawn(connection);

        let (tx, rx) = mpsc::channel(LINK_EVENT_BACKLOG);
        tokio::spawn(async move {
            while let Some((message, _)) = messages.next().await {
                let NetlinkPayload::InnerMessage(
                    RouteNetlinkMessage::NewLink(link) | RouteNetlinkMessage::DelLink(link),
                ) = message.payload
                else {
                    continue;
                };
                let event = LinkEvent {
                    index: link.header.index,
                };
                match tx.try_send(event) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            debug!("Link change subscription closed");
        });
        Ok(rx)
    }
}
