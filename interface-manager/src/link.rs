// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The link manipulation seam.

use async_trait::async_trait;
use ipnet::IpNet;
use net::{IllegalInterfaceName, InterfaceName, Mac};
use nix::errno::Errno;
use std::fmt::{Display, Formatter};
use tokio::sync::mpsc;

/// What a single link query reports about a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Kernel index; unique within a namespace.
    pub index: u32,
    /// Current name.
    pub name: InterfaceName,
    /// Hardware address, if the link has a six byte one.
    pub mac: Option<Mac>,
    /// MTU.
    pub mtu: u32,
    /// Administrative state (`IFF_UP`).
    pub up: bool,
    /// `IFF_LOOPBACK`.
    pub loopback: bool,
    /// The `IFLA_IFALIAS` attribute.
    pub alias: Option<String>,
}

/// How a caller identifies a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSelector {
    /// By name.
    Name(InterfaceName),
    /// By hardware address.
    Mac(Mac),
}

impl LinkSelector {
    #[must_use]
    pub fn matches(&self, link: &LinkInfo) -> bool {
        match self {
            LinkSelector::Name(name) => &link.name == name,
            LinkSelector::Mac(mac) => link.mac.as_ref() == Some(mac),
        }
    }
}

impl Display for LinkSelector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkSelector::Name(name) => write!(f, "{name}"),
            LinkSelector::Mac(mac) => write!(f, "{mac}"),
        }
    }
}

impl From<InterfaceName> for LinkSelector {
    fn from(value: InterfaceName) -> Self {
        LinkSelector::Name(value)
    }
}

impl From<Mac> for LinkSelector {
    fn from(value: Mac) -> Self {
        LinkSelector::Mac(value)
    }
}

/// A link appeared, changed, or disappeared in the namespace a subscription was opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkEvent {
    pub index: u32,
}

/// Receiving side of a link change subscription.
pub type LinkEvents = mpsc::Receiver<LinkEvent>;

/// How many change notifications may queue before new ones are dropped.
///
/// Consumers only care that *something* changed, so dropping on a full queue loses nothing.
pub const LINK_EVENT_BACKLOG: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} is busy (links must be down to be renamed)")]
    Busy(String),
    #[error("{0} already exists")]
    Exists(String),
    #[error("operation on {0} not permitted (is CAP_NET_ADMIN held?)")]
    PermissionDenied(String),
    #[error("operation on {0} not supported")]
    Unsupported(String),
    #[error("netlink request failed: {0}")]
    Netlink(String),
    #[error("kernel reported an illegal interface name: {0}")]
    IllegalName(#[from] IllegalInterfaceName),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Classify a (positive) errno reported for an operation on `subject`.
    #[must_use]
    pub fn from_errno(errno: i32, subject: impl Into<String>) -> LinkError {
        let subject = subject.into();
        match Errno::from_raw(errno) {
            Errno::ENODEV | Errno::ENOENT => LinkError::NotFound(subject),
            Errno::EBUSY => LinkError::Busy(subject),
            Errno::EEXIST => LinkError::Exists(subject),
            Errno::EPERM | Errno::EACCES => LinkError::PermissionDenied(subject),
            Errno::EOPNOTSUPP | Errno::EINVAL => LinkError::Unsupported(subject),
            other => LinkError::Netlink(format!("{subject}: {}", other.desc())),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, LinkError::NotFound(_))
    }
}

/// Operations on the links of exactly one network namespace.
///
/// An implementation is bound to a namespace when it is created and stays bound to it,
/// regardless of which thread later drives it.
#[async_trait]
pub trait LinkOps: Send + Sync {
    /// Handle naming a namespace links can be moved into.
    type Namespace: Send + Sync;

    /// Dump every link of the namespace, ordered by index.
    async fn links(&self) -> Result<Vec<LinkInfo>, LinkError>;

    /// Find one link.
    async fn link(&self, selector: &LinkSelector) -> Result<LinkInfo, LinkError> {
        self.links()
            .await?
            .into_iter()
            .find(|link| selector.matches(link))
            .ok_or_else(|| LinkError::NotFound(format!("link {selector}")))
    }

    async fn set_admin_state(&self, index: u32, up: bool) -> Result<(), LinkError>;

    async fn set_alias(&self, index: u32, alias: &str) -> Result<(), LinkError>;

    /// Rename a link.  The kernel refuses this unless the link is down.
    async fn rename(&self, index: u32, name: &InterfaceName) -> Result<(), LinkError>;

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<(), LinkError>;

    /// Move a link into another namespace.
    ///
    /// The link keeps its name, goes down, and loses its addresses.
    async fn move_to(&self, index: u32, namespace: &Self::Namespace) -> Result<(), LinkError>;

    async fn addresses(&self, index: u32) -> Result<Vec<IpNet>, LinkError>;

    /// Add an address.  Adding an address which is already present fails with
    /// [`LinkError::Exists`].
    async fn add_address(&self, index: u32, address: IpNet) -> Result<(), LinkError>;

    /// Index of the link carrying the IPv4 default route, if there is one.
    async fn default_route_link(&self) -> Result<Option<u32>, LinkError>;

    /// Subscribe to link change notifications in this namespace.
    async fn subscribe(&self) -> Result<LinkEvents, LinkError>;
}
