// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Link inventory scanner.

use crate::link::{LinkError, LinkInfo, LinkOps};
use ipnet::IpNet;
use net::{Health, InterfaceName, NetworkDevice};
use regex::Regex;
use std::collections::BTreeSet;
use tracing::{debug, trace, warn};

/// Which links are offered as devices.
#[derive(Debug, Clone, Default)]
pub struct ScanPolicy {
    include: Option<Regex>,
}

/// Why a link was left out of the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    DefaultRoute,
    NotIncluded,
    Loopback,
}

impl ScanPolicy {
    #[must_use]
    pub fn new(include: Option<Regex>) -> ScanPolicy {
        ScanPolicy { include }
    }

    /// Apply the policy to one link, in order: default-route link, inclusion pattern, loopback.
    #[must_use]
    pub fn exclusion(
        &self,
        link: &LinkInfo,
        default_route: Option<&InterfaceName>,
    ) -> Option<Exclusion> {
        if default_route == Some(&link.name) {
            return Some(Exclusion::DefaultRoute);
        }
        if !self.includes(&link.name) {
            return Some(Exclusion::NotIncluded);
        }
        if link.loopback {
            return Some(Exclusion::Loopback);
        }
        None
    }

    /// True if `name` matches the inclusion pattern, if any.
    #[must_use]
    pub fn includes(&self, name: &InterfaceName) -> bool {
        self.include
            .as_ref()
            .is_none_or(|include| include.is_match(name.as_str()))
    }
}

/// Enumerates the links of one namespace through `L` and turns the admitted ones into devices.
pub struct Scanner<L> {
    links: L,
    policy: ScanPolicy,
}

impl<L: LinkOps> Scanner<L> {
    pub fn new(links: L, policy: ScanPolicy) -> Scanner<L> {
        Scanner { links, policy }
    }

    pub fn links(&self) -> &L {
        &self.links
    }

    /// One inventory pass.  Read only.
    ///
    /// The pass either sees every link of the namespace or fails: without the default route
    /// there is no telling which link must never be handed out, and a link missing from a
    /// partial pass would look like a link which moved into a container.
    pub async fn scan(&self) -> Result<Vec<NetworkDevice>, LinkError> {
        let default_route = self.links.default_route_link().await?;
        let links = self.links.links().await?;
        let default_route = default_route
            .and_then(|index| links.iter().find(|l| l.index == index))
            .map(|l| l.name.clone());

        let mut devices = Vec::with_capacity(links.len());
        for link in links {
            if let Some(exclusion) = self.policy.exclusion(&link, default_route.as_ref()) {
                trace!("Excluding {}: {exclusion:?}", link.name);
                continue;
            }
            let addresses = self.links.addresses(link.index).await?;
            devices.push(NetworkDevice {
                name: link.name,
                mac: link.mac,
                // the kernel derives a fresh link local address wherever the link goes
                addresses: addresses
                    .into_iter()
                    .filter(|a| !is_ipv6_link_local(a))
                    .collect(),
                mtu: link.mtu,
                health: Health::from(link.up),
            });
        }
        debug!("Scanned {} devices", devices.len());
        Ok(devices)
    }

    /// Links which came back from a dead container: down, and carrying the alias breadcrumb of
    /// one of the `owned` devices.  Returns the links' current names.
    ///
    /// A breadcrumb naming a link the policy does not admit is ignored, whatever `owned` says.
    pub async fn strays(&self, owned: &BTreeSet<InterfaceName>) -> Vec<InterfaceName> {
        if owned.is_empty() {
            return Vec::new();
        }
        let links = match self.links.links().await {
            Ok(links) => links,
            Err(e) => {
                warn!("Failed to list links: {e}");
                return Vec::new();
            }
        };
        links
            .into_iter()
            .filter(|link| !link.up && !link.loopback)
            .filter(|link| {
                link.alias
                    .as_deref()
                    .and_then(|alias| InterfaceName::new(alias).ok())
                    .is_some_and(|alias| owned.contains(&alias) && self.policy.includes(&alias))
            })
            .map(|link| link.name)
            .collect()
    }
}

fn is_ipv6_link_local(address: &IpNet) -> bool {
    match address {
        IpNet::V6(v6) => v6.addr().segments()[0] & 0xffc0 == 0xfe80,
        IpNet::V4(_) => false,
    }
}
