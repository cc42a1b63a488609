// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! An in-memory kernel link table spanning several network namespaces.
//!
//! It enforces the kernel rules the migration engine depends on: links must be down to be renamed,
//! names are unique per namespace, loopback links cannot change namespace, and moving a link
//! brings it down and flushes its addresses.  Failures can be injected per operation.

#![allow(clippy::missing_panics_doc)]

use crate::link::{
    LINK_EVENT_BACKLOG, LinkError, LinkEvent, LinkEvents, LinkInfo, LinkOps, LinkSelector,
};
use async_trait::async_trait;
use ipnet::IpNet;
use net::{InterfaceName, Mac};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifies one namespace of a [`FakeKernel`].
pub type FakeNamespace = u32;

/// The operations of [`LinkOps`], used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeOp {
    Links,
    SetAdminState,
    SetAlias,
    Rename,
    SetMtu,
    MoveTo,
    Addresses,
    AddAddress,
    DefaultRoute,
    Subscribe,
}

#[derive(Debug, Clone)]
struct FakeLink {
    namespace: FakeNamespace,
    info: LinkInfo,
    addresses: Vec<IpNet>,
}

#[derive(Default)]
struct KernelState {
    next_index: u32,
    next_namespace: FakeNamespace,
    namespaces: Vec<FakeNamespace>,
    links: BTreeMap<u32, FakeLink>,
    default_routes: BTreeMap<FakeNamespace, u32>,
    failures: Vec<(FakeOp, LinkError)>,
    subscribers: Vec<(FakeNamespace, mpsc::Sender<LinkEvent>)>,
}

impl KernelState {
    fn fail(&mut self, op: FakeOp) -> Result<(), LinkError> {
        match self.failures.iter().position(|(o, _)| *o == op) {
            Some(position) => Err(self.failures.remove(position).1),
            None => Ok(()),
        }
    }

    fn notify(&mut self, namespace: FakeNamespace, index: u32) {
        self.subscribers.retain(|(ns, tx)| {
            if *ns != namespace {
                return !tx.is_closed();
            }
            !matches!(
                tx.try_send(LinkEvent { index }),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        });
    }

    fn name_taken(&self, namespace: FakeNamespace, name: &InterfaceName) -> bool {
        self.links
            .values()
            .any(|l| l.namespace == namespace && &l.info.name == name)
    }

    fn link_mut(
        &mut self,
        namespace: FakeNamespace,
        index: u32,
    ) -> Result<&mut FakeLink, LinkError> {
        self.links
            .get_mut(&index)
            .filter(|l| l.namespace == namespace)
            .ok_or_else(|| LinkError::NotFound(format!("link {index}")))
    }
}

/// The shared kernel.  Cloning yields another handle on the same state.
#[derive(Clone)]
pub struct FakeKernel {
    state: Arc<Mutex<KernelState>>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        FakeKernel::new()
    }
}

impl FakeKernel {
    /// The namespace every fresh kernel starts with.
    pub const HOST: FakeNamespace = 0;

    #[must_use]
    pub fn new() -> FakeKernel {
        let state = KernelState {
            next_index: 1,
            next_namespace: Self::HOST + 1,
            namespaces: vec![Self::HOST],
            ..KernelState::default()
        };
        FakeKernel {
            state: Arc::new(Mutex::new(state)),
        }
    }

    #[must_use]
    pub fn add_namespace(&self) -> FakeNamespace {
        let mut state = self.state.lock();
        let namespace = state.next_namespace;
        state.next_namespace += 1;
        state.namespaces.push(namespace);
        namespace
    }

    /// Destroy a namespace.  Like physical devices in a dying namespace, its links return to the
    /// host namespace under their current name (down, without addresses).
    pub fn remove_namespace(&self, namespace: FakeNamespace) {
        let mut state = self.state.lock();
        state.namespaces.retain(|ns| *ns != namespace);
        let orphans: Vec<u32> = state
            .links
            .values()
            .filter(|l| l.namespace == namespace)
            .map(|l| l.info.index)
            .collect();
        for index in orphans {
            let name = state.links[&index].info.name.clone();
            let taken = state.name_taken(Self::HOST, &name);
            if let Some(link) = state.links.get_mut(&index) {
                link.namespace = Self::HOST;
                link.info.up = false;
                link.addresses.clear();
                if taken {
                    link.info.name = InterfaceName::new(format!("dev{index}")).unwrap();
                }
            }
            state.notify(Self::HOST, index);
        }
    }

    /// Add a link; returns its index.
    pub fn add_link(&self, namespace: FakeNamespace, name: &str, up: bool) -> u32 {
        let mut state = self.state.lock();
        let index = state.next_index;
        state.next_index += 1;
        let info = LinkInfo {
            index,
            name: InterfaceName::new(name).unwrap(),
            mac: Some(Mac([0x02, 0, 0, 0, 0, u8::try_from(index % 256).unwrap()])),
            mtu: 1500,
            up,
            loopback: false,
            alias: None,
        };
        assert!(!state.name_taken(namespace, &info.name), "{name} exists");
        state.links.insert(
            index,
            FakeLink {
                namespace,
                info,
                addresses: Vec::new(),
            },
        );
        state.notify(namespace, index);
        index
    }

    /// Add an `lo` loopback link; returns its index.
    pub fn add_loopback(&self, namespace: FakeNamespace) -> u32 {
        let index = self.add_link(namespace, "lo", true);
        self.update(index, |link| {
            link.loopback = true;
            link.mac = None;
        });
        index
    }

    /// Change a link behind the back of any [`LinkOps`] user (as another actor on the host would).
    pub fn update(&self, index: u32, change: impl FnOnce(&mut LinkInfo)) {
        let mut state = self.state.lock();
        let link = state.links.get_mut(&index).unwrap();
        change(&mut link.info);
        let namespace = link.namespace;
        state.notify(namespace, index);
    }

    pub fn set_addresses(&self, index: u32, addresses: &[&str]) {
        let mut state = self.state.lock();
        let link = state.links.get_mut(&index).unwrap();
        link.addresses = addresses.iter().map(|a| a.parse().unwrap()).collect();
    }

    /// Remove a link entirely (e.g. a hot unplug).
    pub fn delete_link(&self, index: u32) {
        let mut state = self.state.lock();
        if let Some(link) = state.links.remove(&index) {
            state.notify(link.namespace, index);
        }
    }

    pub fn set_default_route(&self, namespace: FakeNamespace, index: u32) {
        self.state.lock().default_routes.insert(namespace, index);
    }

    /// Make the next invocation of `op` (through any handle) fail with `error`.
    pub fn fail_next(&self, op: FakeOp, error: LinkError) {
        self.state.lock().failures.push((op, error));
    }

    /// Namespace and state of the link with this index.
    #[must_use]
    pub fn find(&self, index: u32) -> Option<(FakeNamespace, LinkInfo)> {
        self.state
            .lock()
            .links
            .get(&index)
            .map(|l| (l.namespace, l.info.clone()))
    }

    /// Addresses currently on a link.
    #[must_use]
    pub fn addresses_of(&self, index: u32) -> Vec<IpNet> {
        self.state
            .lock()
            .links
            .get(&index)
            .map(|l| l.addresses.clone())
            .unwrap_or_default()
    }

    /// A [`LinkOps`] handle bound to `namespace`.
    #[must_use]
    pub fn handle(&self, namespace: FakeNamespace) -> FakeLinks {
        FakeLinks {
            kernel: self.clone(),
            namespace,
        }
    }
}

/// [`LinkOps`] on one namespace of a [`FakeKernel`].
#[derive(Clone)]
pub struct FakeLinks {
    kernel: FakeKernel,
    namespace: FakeNamespace,
}

impl FakeLinks {
    #[must_use]
    pub fn namespace(&self) -> FakeNamespace {
        self.namespace
    }
}

#[async_trait]
impl LinkOps for FakeLinks {
    type Namespace = FakeNamespace;

    async fn links(&self) -> Result<Vec<LinkInfo>, LinkError> {
        let mut state = self.kernel.state.lock();
        state.fail(FakeOp::Links)?;
        Ok(state
            .links
            .values()
            .filter(|l| l.namespace == self.namespace)
            .map(|l| l.info.clone())
            .collect())
    }

    async fn link(&self, selector: &LinkSelector) -> Result<LinkInfo, LinkError> {
        self.links()
            .await?
            .into_iter()
            .find(|link| selector.matches(link))
            .ok_or_else(|| LinkError::NotFound(format!("link {selector}")))
    }

    async fn set_admin_state(&self, index: u32, up: bool) -> Result<(), LinkError> {
        let mut state = self.kernel.state.lock();
        state.fail(FakeOp::SetAdminState)?;
        state.link_mut(self.namespace, index)?.info.up = up;
        state.notify(self.namespace, index);
        Ok(())
    }

    async fn set_alias(&self, index: u32, alias: &str) -> Result<(), LinkError> {
        let mut state = self.kernel.state.lock();
        state.fail(FakeOp::SetAlias)?;
        state.link_mut(self.namespace, index)?.info.alias =
            Some(alias.to_string()).filter(|a| !a.is_empty());
        Ok(())
    }

    async fn rename(&self, index: u32, name: &InterfaceName) -> Result<(), LinkError> {
        let mut state = self.kernel.state.lock();
        state.fail(FakeOp::Rename)?;
        let link = state.link_mut(self.namespace, index)?;
        if &link.info.name == name {
            return Ok(());
        }
        if link.info.up {
            return Err(LinkError::Busy(format!("link {index}")));
        }
        if state.name_taken(self.namespace, name) {
            return Err(LinkError::Exists(format!("link {name}")));
        }
        state.link_mut(self.namespace, index)?.info.name = name.clone();
        state.notify(self.namespace, index);
        Ok(())
    }

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<(), LinkError> {
        let mut state = self.kernel.state.lock();
        state.fail(FakeOp::SetMtu)?;
        state.link_mut(self.namespace, index)?.info.mtu = mtu;
        state.notify(self.namespace, index);
        Ok(())
    }

    async fn move_to(&self, index: u32, namespace: &FakeNamespace) -> Result<(), LinkError> {
        let mut state = self.kernel.state.lock();
        state.fail(FakeOp::MoveTo)?;
        if !state.namespaces.contains(namespace) {
            return Err(LinkError::NotFound(format!("namespace {namespace}")));
        }
        let link = state.link_mut(self.namespace, index)?;
        if link.info.loopback {
            return Err(LinkError::Unsupported(format!("link {index}")));
        }
        let name = link.info.name.clone();
        if state.name_taken(*namespace, &name) {
            return Err(LinkError::Exists(format!("link {name}")));
        }
        let link = state.link_mut(self.namespace, index)?;
        link.namespace = *namespace;
        link.info.up = false;
        link.addresses.clear();
        state.notify(self.namespace, index);
        state.notify(*namespace, index);
        Ok(())
    }

    async fn addresses(&self, index: u32) -> Result<Vec<IpNet>, LinkError> {
        let mut state = self.kernel.state.lock();
        state.fail(FakeOp::Addresses)?;
        Ok(state.link_mut(self.namespace, index)?.addresses.clone())
    }

    async fn add_address(&self, index: u32, address: IpNet) -> Result<(), LinkError> {
        let mut state = self.kernel.state.lock();
        state.fail(FakeOp::AddAddress)?;
        let link = state.link_mut(self.namespace, index)?;
        if link.addresses.contains(&address) {
            return Err(LinkError::Exists(format!("address {address}")));
        }
        link.addresses.push(address);
        Ok(())
    }

    async fn default_route_link(&self) -> Result<Option<u32>, LinkError> {
        let mut state = self.kernel.state.lock();
        state.fail(FakeOp::DefaultRoute)?;
        Ok(state.default_routes.get(&self.namespace).copied())
    }

    async fn subscribe(&self) -> Result<LinkEvents, LinkError> {
        let mut state = self.kernel.state.lock();
        state.fail(FakeOp::Subscribe)?;
        let (tx, rx) = mpsc::channel(LINK_EVENT_BACKLOG);
        state.subscribers.push((self.namespace, tx));
        Ok(rx)
    }
}
