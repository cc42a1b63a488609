// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Moving links between network namespaces.
//!
//! A link entering a container namespace is tagged with its original name (in its alias
//! attribute) before it leaves the host.  The alias is the only record of the migration, so a
//! link can be sent home with nothing but its current name and namespace, even by a process which
//! never saw it leave.

use crate::link::{LinkError, LinkInfo, LinkOps, LinkSelector};
use crate::netns::{Netns, NetnsError, pinned};
use crate::rtnl::RtnlLinks;
use ipnet::IpNet;
use net::{InterfaceName, Mac};
use std::fmt::{Display, Formatter};
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// States of [`enter`], in the order they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnterState {
    Start,
    Located,
    Down,
    AliasTagged,
    Moved,
    Renamed,
    Up,
    Done,
}

/// States of [`leave`], in the order they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LeaveState {
    Start,
    Located,
    Down,
    Renamed,
    Moved,
    Up,
    Done,
}

impl Display for EnterState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Display for LeaveState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// `enter` failed after reaching `state`.
    #[error("moving {link} into the container failed after state {state}: {source}")]
    Enter {
        link: String,
        state: EnterState,
        #[source]
        source: LinkError,
    },
    /// `leave` failed after reaching `state`.
    #[error("returning {link} to the host failed after state {state}: {source}")]
    Leave {
        link: String,
        state: LeaveState,
        #[source]
        source: LinkError,
    },
    #[error("configuring {link} failed: {source}")]
    Configure {
        link: String,
        #[source]
        source: LinkError,
    },
    #[error("reclaiming {link} failed: {source}")]
    Reclaim {
        link: String,
        #[source]
        source: LinkError,
    },
    #[error(transparent)]
    Netns(#[from] NetnsError),
    #[error("netlink request failed: {0}")]
    Netlink(#[source] LinkError),
}

impl MigrationError {
    /// True if the link (or the namespace) to operate on does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            MigrationError::Enter { source, .. }
            | MigrationError::Leave { source, .. }
            | MigrationError::Configure { source, .. }
            | MigrationError::Reclaim { source, .. } => source.is_not_found(),
            MigrationError::Netns(e) => e.is_not_found(),
            MigrationError::Netlink(source) => source.is_not_found(),
        }
    }
}

/// What to move into a container, and how it should look once there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnterRequest {
    pub link: LinkSelector,
    /// Name inside the container; the host name is kept when absent.
    pub ifname: Option<InterfaceName>,
    pub addresses: Vec<IpNet>,
    pub mtu: Option<u32>,
}

impl EnterRequest {
    #[must_use]
    pub fn new(link: impl Into<LinkSelector>) -> EnterRequest {
        EnterRequest {
            link: link.into(),
            ifname: None,
            addresses: Vec::new(),
            mtu: None,
        }
    }
}

/// A link now living in a container namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratedLink {
    pub index: u32,
    /// Name in the host namespace (also recorded as the link alias).
    pub original: InterfaceName,
    /// Name in the container namespace.
    pub name: InterfaceName,
    pub mac: Option<Mac>,
    /// Administrative state before the migration.
    pub was_up: bool,
    pub addresses: Vec<IpNet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveRequest {
    /// Current name in the container namespace.
    pub name: InterfaceName,
    /// Administrative state to restore on the host.  When absent, the state the link had when
    /// `leave` began is restored.
    pub restore_up: Option<bool>,
}

/// A link back in the host namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredLink {
    pub index: u32,
    pub name: InterfaceName,
    pub up: bool,
}

/// Settings applied to a link from within the namespace it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureRequest {
    pub name: InterfaceName,
    pub mtu: Option<u32>,
    pub addresses: Vec<IpNet>,
}

struct EnterTracker<'a> {
    link: &'a str,
    state: EnterState,
}

impl EnterTracker<'_> {
    fn reach(&mut self, state: EnterState) {
        debug!("{}: {} -> {state}", self.link, self.state);
        self.state = state;
    }

    fn fail(&self, source: LinkError) -> MigrationError {
        MigrationError::Enter {
            link: self.link.to_string(),
            state: self.state,
            source,
        }
    }
}

/// Add addresses, tolerating those already present.
async fn add_addresses<L: LinkOps>(
    links: &L,
    index: u32,
    addresses: &[IpNet],
) -> Result<(), LinkError> {
    for address in addresses {
        match links.add_address(index, *address).await {
            Ok(()) | Err(LinkError::Exists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Move a link from the `host` namespace into `target`, which `container` operates on.
///
/// On failure the link is left down and alias-tagged, under its original name, in whichever
/// namespace it had reached; the error names the last state reached.
#[instrument(level = "info", skip_all, fields(link = %request.link))]
pub async fn enter<L: LinkOps>(
    host: &L,
    container: &L,
    target: &L::Namespace,
    request: &EnterRequest,
) -> Result<MigratedLink, MigrationError> {
    let subject = request.link.to_string();
    let mut tracker = EnterTracker {
        link: &subject,
        state: EnterState::Start,
    };

    let link = host.link(&request.link).await.map_err(|e| tracker.fail(e))?;
    let was_up = link.up;
    let original = link.name.clone();
    tracker.reach(EnterState::Located);

    host.set_admin_state(link.index, false)
        .await
        .map_err(|e| tracker.fail(e))?;
    tracker.reach(EnterState::Down);

    host.set_alias(link.index, original.as_str())
        .await
        .map_err(|e| tracker.fail(e))?;
    tracker.reach(EnterState::AliasTagged);

    host.move_to(link.index, target)
        .await
        .map_err(|e| tracker.fail(e))?;
    tracker.reach(EnterState::Moved);

    // the index survives the move unless it collides in the target; the name always does
    let moved = container
        .link(&LinkSelector::Name(original.clone()))
        .await
        .map_err(|e| tracker.fail(e))?;
    let name = request.ifname.clone().unwrap_or_else(|| original.clone());
    container
        .rename(moved.index, &name)
        .await
        .map_err(|e| tracker.fail(e))?;
    tracker.reach(EnterState::Renamed);

    if let Some(mtu) = request.mtu {
        if mtu != moved.mtu {
            container
                .set_mtu(moved.index, mtu)
                .await
                .map_err(|e| tracker.fail(e))?;
        }
    }
    add_addresses(container, moved.index, &request.addresses)
        .await
        .map_err(|e| tracker.fail(e))?;
    container
        .set_admin_state(moved.index, true)
        .await
        .map_err(|e| tracker.fail(e))?;
    tracker.reach(EnterState::Up);
    tracker.reach(EnterState::Done);

    info!("Moved {original} into the container as {name}");
    Ok(MigratedLink {
        index: moved.index,
        original,
        name,
        mac: moved.mac,
        was_up,
        addresses: request.addresses.clone(),
    })
}

/// The name a link had before it entered a container, as recorded in its alias.
fn recorded_name(link: &LinkInfo) -> Option<InterfaceName> {
    let alias = link.alias.as_deref()?;
    match InterfaceName::new(alias) {
        Ok(name) => Some(name),
        Err(e) => {
            warn!("Alias of {} is not a usable name: {e}", link.name);
            None
        }
    }
}

/// Move a link from the namespace `container` operates on back to `host_namespace`, which `host`
/// operates on, restoring the name recorded in its alias.
///
/// If the link cannot be renamed or moved, its working name and administrative state are
/// restored (best effort) so the operation can be retried.
#[instrument(level = "info", skip_all, fields(link = %request.name))]
pub async fn leave<L: LinkOps>(
    container: &L,
    host: &L,
    host_namespace: &L::Namespace,
    request: &LeaveRequest,
) -> Result<RestoredLink, MigrationError> {
    let fail = |state: LeaveState, source: LinkError| MigrationError::Leave {
        link: request.name.to_string(),
        state,
        source,
    };

    let link = container
        .link(&LinkSelector::Name(request.name.clone()))
        .await
        .map_err(|e| fail(LeaveState::Start, e))?;
    let was_up = link.up;
    let restore_up = request.restore_up.unwrap_or(was_up);
    let original = recorded_name(&link).unwrap_or_else(|| {
        warn!("{} carries no alias, it keeps its current name", link.name);
        link.name.clone()
    });
    debug!("{}: {} -> {}", link.name, LeaveState::Start, LeaveState::Located);

    container
        .set_admin_state(link.index, false)
        .await
        .map_err(|e| fail(LeaveState::Located, e))?;
    debug!("{}: {} -> {}", link.name, LeaveState::Located, LeaveState::Down);

    if let Err(e) = container.rename(link.index, &original).await {
        warn!("Failed to rename {} back to {original}: {e}", link.name);
        if was_up {
            if let Err(e) = container.set_admin_state(link.index, true).await {
                warn!("Failed to bring {} back up: {e}", link.name);
            }
        }
        return Err(fail(LeaveState::Down, e));
    }
    debug!("{}: {} -> {}", link.name, LeaveState::Down, LeaveState::Renamed);

    if let Err(e) = container.move_to(link.index, host_namespace).await {
        warn!("Failed to move {original} to the host: {e}");
        if let Err(e) = container.rename(link.index, &link.name).await {
            warn!("Failed to restore working name {}: {e}", link.name);
        }
        if was_up {
            if let Err(e) = container.set_admin_state(link.index, true).await {
                warn!("Failed to bring {} back up: {e}", link.name);
            }
        }
        return Err(fail(LeaveState::Renamed, e));
    }
    debug!("{original}: {} -> {}", LeaveState::Renamed, LeaveState::Moved);

    let returned = host
        .link(&LinkSelector::Name(original.clone()))
        .await
        .map_err(|e| fail(LeaveState::Moved, e))?;
    if restore_up {
        host.set_admin_state(returned.index, true)
            .await
            .map_err(|e| fail(LeaveState::Moved, e))?;
        debug!("{original}: {} -> {}", LeaveState::Moved, LeaveState::Up);
    }
    debug!("{original}: -> {}", LeaveState::Done);

    info!("Returned {} to the host as {original}", request.name);
    Ok(RestoredLink {
        index: returned.index,
        name: original,
        up: restore_up,
    })
}

/// Bring a link which came back to the host on its own (its namespace died) back into service:
/// restore the name recorded in its alias and bring it up.  Returns the link's final name.
#[instrument(level = "info", skip(host))]
pub async fn reclaim<L: LinkOps>(
    host: &L,
    name: &InterfaceName,
) -> Result<InterfaceName, MigrationError> {
    let fail = |source: LinkError| MigrationError::Reclaim {
        link: name.to_string(),
        source,
    };
    let link = host
        .link(&LinkSelector::Name(name.clone()))
        .await
        .map_err(fail)?;
    let target = recorded_name(&link).unwrap_or_else(|| link.name.clone());
    if target != link.name {
        host.set_admin_state(link.index, false)
            .await
            .map_err(fail)?;
        host.rename(link.index, &target).await.map_err(fail)?;
    }
    if !link.up || target != link.name {
        host.set_admin_state(link.index, true).await.map_err(fail)?;
    }
    info!("Reclaimed {name} as {target}");
    Ok(target)
}

/// Apply MTU and addresses to a link and bring it up, in the namespace `links` operates on.
#[instrument(level = "info", skip_all, fields(link = %request.name))]
pub async fn configure<L: LinkOps>(
    links: &L,
    request: &ConfigureRequest,
) -> Result<(), MigrationError> {
    let fail = |source: LinkError| MigrationError::Configure {
        link: request.name.to_string(),
        source,
    };
    let link = links
        .link(&LinkSelector::Name(request.name.clone()))
        .await
        .map_err(fail)?;
    if let Some(mtu) = request.mtu {
        if mtu != link.mtu {
            links.set_mtu(link.index, mtu).await.map_err(fail)?;
        }
    }
    add_addresses(links, link.index, &request.addresses)
        .await
        .map_err(fail)?;
    links
        .set_admin_state(link.index, true)
        .await
        .map_err(fail)?;
    Ok(())
}

/// Run [`enter`] against the kernel, moving a host link into the namespace bound at `target`.
pub fn enter_namespace(
    target: &Path,
    request: EnterRequest,
) -> Result<MigratedLink, MigrationError> {
    let target = Netns::open(target)?;
    pinned("netdevice-enter", move |context| async move {
        let host = RtnlLinks::connect().map_err(MigrationError::Netlink)?;
        context.enter(&target)?;
        let container = RtnlLinks::connect().map_err(MigrationError::Netlink)?;
        enter(&host, &container, &target, &request).await
    })?
}

/// Run [`leave`] against the kernel, returning a link from the namespace bound at `target` to the
/// namespace of the calling process.
pub fn leave_namespace(
    target: &Path,
    request: LeaveRequest,
) -> Result<RestoredLink, MigrationError> {
    let target = Netns::open(target)?;
    pinned("netdevice-leave", move |context| async move {
        let host = RtnlLinks::connect().map_err(MigrationError::Netlink)?;
        context.enter(&target)?;
        let container = RtnlLinks::connect().map_err(MigrationError::Netlink)?;
        leave(&container, &host, context.host(), &request).await
    })?
}

/// Run [`configure`] against the kernel, in the namespace of the calling process.
pub fn configure_current(request: ConfigureRequest) -> Result<(), MigrationError> {
    pinned("netdevice-configure", move |_| async move {
        let links = RtnlLinks::connect().map_err(MigrationError::Netlink)?;
        configure(&links, &request).await
    })?
}

/// List the links of the namespace bound at `target`.
pub fn links_in_namespace(target: &Path) -> Result<Vec<LinkInfo>, MigrationError> {
    let target = Netns::open(target)?;
    pinned("netdevice-inspect", move |context| async move {
        context.enter(&target)?;
        let links = RtnlLinks::connect().map_err(MigrationError::Netlink)?;
        links.links().await.map_err(MigrationError::Netlink)
    })?
}

#[cfg(test)]
mod test {
    use crate::fake::{FakeKernel, FakeOp};
    use crate::link::{LinkError, LinkOps, LinkSelector};
    use crate::migrate::{
        ConfigureRequest, EnterRequest, EnterState, LeaveRequest, LeaveState, MigrationError,
        configure, enter, leave, reclaim,
    };
    use net::InterfaceName;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    fn name(s: &str) -> InterfaceName {
        InterfaceName::new(s).unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn enter_moves_renames_addresses_and_raises() {
        let kernel = FakeKernel::new();
        let pod = kernel.add_namespace();
        let eth1 = kernel.add_link(FakeKernel::HOST, "eth1", true);
        let host = kernel.handle(FakeKernel::HOST);
        let container = kernel.handle(pod);

        let request = EnterRequest {
            ifname: Some(name("net0")),
            addresses: vec!["10.0.0.7/24".parse().unwrap()],
            mtu: Some(9000),
            ..EnterRequest::new(name("eth1"))
        };
        let migrated = enter(&host, &container, &pod, &request).await.unwrap();
        assert_eq!(migrated.original, "eth1");
        assert_eq!(migrated.name, "net0");
        assert!(migrated.was_up);

        let (namespace, info) = kernel.find(eth1).unwrap();
        assert_eq!(namespace, pod);
        assert_eq!(info.name, "net0");
        assert_eq!(info.alias.as_deref(), Some("eth1"));
        assert_eq!(info.mtu, 9000);
        assert!(info.up);
        assert_eq!(kernel.addresses_of(eth1), request.addresses);
    }

    #[tokio::test]
    #[traced_test]
    async fn enter_by_mac() {
        let kernel = FakeKernel::new();
        let pod = kernel.add_namespace();
        let eth1 = kernel.add_link(FakeKernel::HOST, "eth1", false);
        let mac = kernel.find(eth1).unwrap().1.mac.unwrap();
        let migrated = enter(
            &kernel.handle(FakeKernel::HOST),
            &kernel.handle(pod),
            &pod,
            &EnterRequest::new(mac),
        )
        .await
        .unwrap();
        assert_eq!(migrated.name, "eth1");
        assert!(!migrated.was_up);
    }

    #[tokio::test]
    async fn enter_missing_link_is_not_found() {
        let kernel = FakeKernel::new();
        let pod = kernel.add_namespace();
        let err = enter(
            &kernel.handle(FakeKernel::HOST),
            &kernel.handle(pod),
            &pod,
            &EnterRequest::new(name("eth9")),
        )
        .await
        .unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(
            err,
            MigrationError::Enter {
                state: EnterState::Start,
                ..
            }
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_move_leaves_link_down_and_tagged_on_the_host() {
        let kernel = FakeKernel::new();
        let pod = kernel.add_namespace();
        let eth1 = kernel.add_link(FakeKernel::HOST, "eth1", true);
        kernel.fail_next(FakeOp::MoveTo, LinkError::PermissionDenied("link".into()));

        let err = enter(
            &kernel.handle(FakeKernel::HOST),
            &kernel.handle(pod),
            &pod,
            &EnterRequest::new(name("eth1")),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Enter {
                state: EnterState::AliasTagged,
                source: LinkError::PermissionDenied(_),
                ..
            }
        ));
        let (namespace, info) = kernel.find(eth1).unwrap();
        assert_eq!(namespace, FakeKernel::HOST);
        assert_eq!(info.name, "eth1");
        assert_eq!(info.alias.as_deref(), Some("eth1"));
        assert!(!info.up);
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_rename_in_container_keeps_original_name_there() {
        let kernel = FakeKernel::new();
        let pod = kernel.add_namespace();
        kernel.add_link(pod, "net0", true);
        let eth1 = kernel.add_link(FakeKernel::HOST, "eth1", true);
        let request = EnterRequest {
            ifname: Some(name("net0")),
            ..EnterRequest::new(name("eth1"))
        };
        let err = enter(&kernel.handle(FakeKernel::HOST), &kernel.handle(pod), &pod, &request)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Enter {
                state: EnterState::Moved,
                source: LinkError::Exists(_),
                ..
            }
        ));
        let (namespace, info) = kernel.find(eth1).unwrap();
        assert_eq!(namespace, pod);
        assert_eq!(info.name, "eth1");
        assert!(!info.up);
    }

    #[tokio::test]
    #[traced_test]
    async fn round_trip_restores_namespace_name_and_state() {
        for initially_up in [true, false] {
            let kernel = FakeKernel::new();
            let pod = kernel.add_namespace();
            let eth1 = kernel.add_link(FakeKernel::HOST, "eth1", initially_up);
            let host = kernel.handle(FakeKernel::HOST);
            let container = kernel.handle(pod);

            let request = EnterRequest {
                ifname: Some(name("net0")),
                ..EnterRequest::new(name("eth1"))
            };
            let migrated = enter(&host, &container, &pod, &request).await.unwrap();
            let restored = leave(
                &container,
                &host,
                &FakeKernel::HOST,
                &LeaveRequest {
                    name: migrated.name.clone(),
                    restore_up: Some(migrated.was_up),
                },
            )
            .await
            .unwrap();
            assert_eq!(restored.name, "eth1");

            let (namespace, info) = kernel.find(eth1).unwrap();
            assert_eq!(namespace, FakeKernel::HOST);
            assert_eq!(info.name, "eth1");
            assert_eq!(info.up, initially_up);
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn leave_after_crash_uses_the_alias() {
        let kernel = FakeKernel::new();
        let pod = kernel.add_namespace();
        let eth1 = kernel.add_link(FakeKernel::HOST, "eth1", true);
        {
            let request = EnterRequest {
                ifname: Some(name("net0")),
                ..EnterRequest::new(name("eth1"))
            };
            enter(&kernel.handle(FakeKernel::HOST), &kernel.handle(pod), &pod, &request)
                .await
                .unwrap();
        }
        // fresh handles: nothing survives but the kernel state
        let restored = leave(
            &kernel.handle(pod),
            &kernel.handle(FakeKernel::HOST),
            &FakeKernel::HOST,
            &LeaveRequest {
                name: name("net0"),
                restore_up: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(restored.name, "eth1");
        assert!(restored.up);
        let (namespace, info) = kernel.find(eth1).unwrap();
        assert_eq!(namespace, FakeKernel::HOST);
        assert_eq!(info.name, "eth1");
        assert!(info.up);
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_return_restores_working_name_and_state() {
        let kernel = FakeKernel::new();
        let pod = kernel.add_namespace();
        let eth1 = kernel.add_link(FakeKernel::HOST, "eth1", true);
        let host = kernel.handle(FakeKernel::HOST);
        let container = kernel.handle(pod);
        let request = EnterRequest {
            ifname: Some(name("net0")),
            ..EnterRequest::new(name("eth1"))
        };
        enter(&host, &container, &pod, &request).await.unwrap();

        // a new eth1 on the host blocks the way home
        let squatter = kernel.add_link(FakeKernel::HOST, "eth1", true);
        let leave_request = LeaveRequest {
            name: name("net0"),
            restore_up: None,
        };
        let err = leave(&container, &host, &FakeKernel::HOST, &leave_request)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Leave {
                state: LeaveState::Renamed,
                source: LinkError::Exists(_),
                ..
            }
        ));
        let (namespace, info) = kernel.find(eth1).unwrap();
        assert_eq!(namespace, pod);
        assert_eq!(info.name, "net0");
        assert!(info.up);

        // and the operation is retryable once the way is clear
        kernel.delete_link(squatter);
        leave(&container, &host, &FakeKernel::HOST, &leave_request)
            .await
            .unwrap();
        assert_eq!(kernel.find(eth1).unwrap().0, FakeKernel::HOST);
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_rename_back_restores_state() {
        let kernel = FakeKernel::new();
        let pod = kernel.add_namespace();
        let eth1 = kernel.add_link(FakeKernel::HOST, "eth1", true);
        let host = kernel.handle(FakeKernel::HOST);
        let container = kernel.handle(pod);
        let request = EnterRequest {
            ifname: Some(name("net0")),
            ..EnterRequest::new(name("eth1"))
        };
        enter(&host, &container, &pod, &request).await.unwrap();

        kernel.fail_next(FakeOp::Rename, LinkError::Busy("link".into()));
        let err = leave(
            &container,
            &host,
            &FakeKernel::HOST,
            &LeaveRequest {
                name: name("net0"),
                restore_up: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Leave {
                state: LeaveState::Down,
                ..
            }
        ));
        let (namespace, info) = kernel.find(eth1).unwrap();
        assert_eq!(namespace, pod);
        assert_eq!(info.name, "net0");
        assert!(info.up);
    }

    #[tokio::test]
    #[traced_test]
    async fn reclaim_restores_alias_and_raises() {
        let kernel = FakeKernel::new();
        let pod = kernel.add_namespace();
        let eth1 = kernel.add_link(FakeKernel::HOST, "eth1", true);
        let host = kernel.handle(FakeKernel::HOST);
        let request = EnterRequest {
            ifname: Some(name("net0")),
            ..EnterRequest::new(name("eth1"))
        };
        enter(&host, &kernel.handle(pod), &pod, &request)
            .await
            .unwrap();
        kernel.remove_namespace(pod);
        assert_eq!(kernel.find(eth1).unwrap().1.name, "net0");

        let reclaimed = reclaim(&host, &name("net0")).await.unwrap();
        assert_eq!(reclaimed, "eth1");
        let (_, info) = kernel.find(eth1).unwrap();
        assert_eq!(info.name, "eth1");
        assert!(info.up);
    }

    #[tokio::test]
    async fn configure_is_idempotent() {
        let kernel = FakeKernel::new();
        let eth1 = kernel.add_link(FakeKernel::HOST, "eth1", false);
        let links = kernel.handle(FakeKernel::HOST);
        let request = ConfigureRequest {
            name: name("eth1"),
            mtu: Some(1400),
            addresses: vec!["192.0.2.1/24".parse().unwrap()],
        };
        configure(&links, &request).await.unwrap();
        configure(&links, &request).await.unwrap();
        let info = links
            .link(&LinkSelector::Name(name("eth1")))
            .await
            .unwrap();
        assert!(info.up);
        assert_eq!(info.mtu, 1400);
        assert_eq!(kernel.addresses_of(eth1), request.addresses);
    }
}
