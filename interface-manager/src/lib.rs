// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Everything that reads or changes kernel link state.
//!
//! The [`link::LinkOps`] trait is the only seam between the rest of the system and the kernel.
//! [`rtnl::RtnlLinks`] implements it over rtnetlink; with the `testing` feature,
//! [`fake::FakeKernel`] implements it over an in-memory, multi-namespace link table.
//!
//! Netlink sockets are bound to the network namespace of the thread that opened them, so the
//! namespace-sensitive entry points ([`migrate::enter_namespace`], [`migrate::leave_namespace`])
//! run on a dedicated OS thread via [`netns::pinned`].

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod link;
pub mod migrate;
pub mod netns;
pub mod rtnl;
pub mod scan;

pub use link::{LinkError, LinkEvent, LinkEvents, LinkInfo, LinkOps, LinkSelector};
pub use migrate::{
    ConfigureRequest, EnterRequest, EnterState, LeaveRequest, LeaveState, MigratedLink,
    MigrationError, RestoredLink,
};
pub use netns::{NamespaceContext, Netns, NetnsError};
pub use rtnl::RtnlLinks;
pub use scan::{ScanPolicy, Scanner};
