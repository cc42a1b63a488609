// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! What the server needs from the host's links.

use async_trait::async_trait;
use interface_manager::migrate::reclaim;
use interface_manager::{LinkError, LinkEvents, LinkOps, MigrationError, Scanner};
use net::{InterfaceName, NetworkDevice};
use std::collections::BTreeSet;

#[async_trait]
pub trait Inventory: Send + Sync + 'static {
    /// One read only inventory pass over every link of the host.
    async fn scan(&self) -> Result<Vec<NetworkDevice>, LinkError>;

    /// Subscribe to link change notifications.
    async fn subscribe(&self) -> Result<LinkEvents, LinkError>;

    /// Links which came back from a dead container carrying the breadcrumb of one of the
    /// `owned` devices, by their current name.
    async fn strays(&self, owned: &BTreeSet<InterfaceName>) -> Vec<InterfaceName>;

    /// Put a link which came back from a container back into service; returns its host name.
    async fn reclaim(&self, name: &InterfaceName) -> Result<InterfaceName, MigrationError>;
}

#[async_trait]
impl<L: LinkOps + 'static> Inventory for Scanner<L> {
    async fn scan(&self) -> Result<Vec<NetworkDevice>, LinkError> {
        Scanner::scan(self).await
    }

    async fn subscribe(&self) -> Result<LinkEvents, LinkError> {
        self.links().subscribe().await
    }

    async fn strays(&self, owned: &BTreeSet<InterfaceName>) -> Vec<InterfaceName> {
        Scanner::strays(self, owned).await
    }

    async fn reclaim(&self, name: &InterfaceName) -> Result<InterfaceName, MigrationError> {
        reclaim(self.links(), name).await
    }
}
