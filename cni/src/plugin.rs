// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! ADD, DEL and CHECK.

use crate::config::{Environment, InterfaceRequest, NetConf};
use crate::error::{CniError, ErrorCode};
use crate::ipam;
use crate::result::{CniResult, Interface, IpConfig};
use interface_manager::migrate::{enter_namespace, leave_namespace, links_in_namespace};
use interface_manager::{
    EnterRequest, LeaveRequest, LinkInfo, LinkSelector, MigratedLink, MigrationError,
    RestoredLink,
};
use ipnet::IpNet;
use net::InterfaceName;
use std::path::Path;
use tracing::{debug, info, warn};

/// Namespace migration as seen by the plugin commands.
pub trait Migrator {
    fn enter(&self, netns: &Path, request: EnterRequest) -> Result<MigratedLink, MigrationError>;
    fn leave(&self, netns: &Path, request: LeaveRequest) -> Result<RestoredLink, MigrationError>;
    fn links(&self, netns: &Path) -> Result<Vec<LinkInfo>, MigrationError>;
}

/// [`Migrator`] over the kernel.
pub struct Kernel;

impl Migrator for Kernel {
    fn enter(&self, netns: &Path, request: EnterRequest) -> Result<MigratedLink, MigrationError> {
        enter_namespace(netns, request)
    }

    fn leave(&self, netns: &Path, request: LeaveRequest) -> Result<RestoredLink, MigrationError> {
        leave_namespace(netns, request)
    }

    fn links(&self, netns: &Path) -> Result<Vec<LinkInfo>, MigrationError> {
        links_in_namespace(netns)
    }
}

fn selector(request: &InterfaceRequest) -> Option<LinkSelector> {
    request
        .name
        .clone()
        .map(LinkSelector::from)
        .or_else(|| request.hwaddr.map(LinkSelector::from))
}

fn missing(request: &InterfaceRequest) -> CniError {
    CniError::new(ErrorCode::InvalidNetworkConfig, "interface request names no link")
        .with_details(format!("{request:?}"))
}

/// Name of the `position`th requested link inside the container: the first one carries
/// `CNI_IFNAME`, the others keep their host names.
fn container_name(
    position: usize,
    request: &InterfaceRequest,
    ifname: &InterfaceName,
    links: &[LinkInfo],
) -> Option<InterfaceName> {
    if position == 0 {
        return Some(ifname.clone());
    }
    let selector = selector(request)?;
    links
        .iter()
        .find(|link| selector.matches(link))
        .map(|link| link.name.clone())
        .or_else(|| request.name.clone())
}

/// Give back links already moved by a failed ADD, most recent first.
fn roll_back<M: Migrator>(migrator: &M, netns: &Path, moved: &[MigratedLink]) {
    for link in moved.iter().rev() {
        let request = LeaveRequest {
            name: link.name.clone(),
            restore_up: Some(link.was_up),
        };
        if let Err(e) = migrator.leave(netns, request) {
            warn!("Failed to return {} to the host: {e}", link.original);
        }
    }
}

pub fn add<M: Migrator>(
    migrator: &M,
    env: &Environment,
    conf: &NetConf,
    stdin: &[u8],
) -> Result<CniResult, CniError> {
    let netns = env.require_netns()?;
    let ifname = env.require_ifname()?;
    let mut result = match &conf.prev_result {
        Some(prev) => CniResult::from_value(prev.clone())?,
        None => CniResult::default(),
    };
    result.cni_version.clone_from(&conf.cni_version);

    let requests = conf.requested_interfaces()?;
    if requests.is_empty() {
        debug!("No interfaces requested for {}", env.container_id);
        return Ok(result);
    }

    let delegate = conf
        .ipam_plugin()
        .map(|plugin| ipam::find(plugin, &env.path))
        .transpose()?;
    let mut ipam_result = match &delegate {
        Some(binary) => Some(ipam::add(binary, stdin)?),
        None => None,
    };
    let addresses: Vec<IpNet> = ipam_result
        .iter()
        .flat_map(|r| r.ips.iter().map(|ip| ip.address))
        .collect();

    let mut moved: Vec<MigratedLink> = Vec::with_capacity(requests.len());
    for (position, request) in requests.iter().enumerate() {
        let Some(link) = selector(request) else {
            roll_back(migrator, netns, &moved);
            return Err(missing(request));
        };
        let enter = EnterRequest {
            ifname: (position == 0).then(|| ifname.clone()),
            addresses: if position == 0 { addresses.clone() } else { Vec::new() },
            ..EnterRequest::new(link)
        };
        match migrator.enter(netns, enter) {
            Ok(migrated) => moved.push(migrated),
            Err(e) => {
                roll_back(migrator, netns, &moved);
                if let Some(binary) = &delegate {
                    if let Err(e) = ipam::del(binary, stdin) {
                        warn!("Failed to release addresses: {e}");
                    }
                }
                return Err(e.into());
            }
        }
    }

    let mut first = None;
    for migrated in &moved {
        let index = result.push_interface(Interface {
            name: migrated.name.to_string(),
            mac: migrated.mac.map(|mac| mac.to_string()).unwrap_or_default(),
            sandbox: Some(netns.clone()),
        });
        first.get_or_insert(index);
    }
    if let Some(ipam_result) = ipam_result.take() {
        result
            .ips
            .extend(ipam_result.ips.into_iter().map(|ip| IpConfig {
                interface: first,
                ..ip
            }));
        result.routes.extend(ipam_result.routes);
        if result.dns.is_none() {
            result.dns = ipam_result.dns;
        }
    }
    info!(
        "Moved {} into {} for {}",
        moved
            .iter()
            .map(|m| format!("{} as {}", m.original, m.name))
            .collect::<Vec<_>>()
            .join(", "),
        netns.display(),
        env.container_id
    );
    Ok(result)
}

pub fn del<M: Migrator>(
    migrator: &M,
    env: &Environment,
    conf: &NetConf,
    stdin: &[u8],
) -> Result<(), CniError> {
    let requests = conf.requested_interfaces()?;
    match (&env.netns, &env.ifname) {
        (Some(netns), Some(ifname)) if !requests.is_empty() => {
            let links = match migrator.links(netns) {
                Ok(links) => links,
                Err(e) if e.is_not_found() => {
                    debug!("Namespace {} is gone: {e}", netns.display());
                    Vec::new()
                }
                Err(e) => return Err(e.into()),
            };
            for (position, request) in requests.iter().enumerate() {
                let Some(name) = container_name(position, request, ifname, &links) else {
                    continue;
                };
                let leave = LeaveRequest {
                    name: name.clone(),
                    restore_up: None,
                };
                match migrator.leave(netns, leave) {
                    Ok(restored) => info!("Returned {name} to the host as {}", restored.name),
                    Err(e) if e.is_not_found() => debug!("Nothing to return for {name}: {e}"),
                    Err(e) => return Err(e.into()),
                }
            }
        }
        _ => debug!("Nothing to return for {}", env.container_id),
    }
    if let Some(plugin) = conf.ipam_plugin() {
        ipam::del(&ipam::find(plugin, &env.path)?, stdin)?;
    }
    Ok(())
}

pub fn check<M: Migrator>(
    migrator: &M,
    env: &Environment,
    conf: &NetConf,
    stdin: &[u8],
) -> Result<(), CniError> {
    let netns = env.require_netns()?;
    let ifname = env.require_ifname()?;
    if let Some(plugin) = conf.ipam_plugin() {
        ipam::check(&ipam::find(plugin, &env.path)?, stdin)?;
    }
    let links = migrator.links(netns)?;
    for (position, request) in conf.requested_interfaces()?.iter().enumerate() {
        let present = container_name(position, request, ifname, &links)
            .is_some_and(|name| links.iter().any(|link| link.name == name));
        if !present {
            return Err(CniError::new(
                ErrorCode::IoFailure,
                format!("requested interface {position} is missing from {}", netns.display()),
            )
            .with_details(format!("{request:?}")));
        }
    }
    Ok(())
}
