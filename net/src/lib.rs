// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Value types describing host network devices and the resources they are advertised as.

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

pub mod device;
pub mod eth;
pub mod interface;
pub mod resource;

pub use device::{Health, NetworkDevice};
pub use eth::mac::Mac;
pub use interface::{IllegalInterfaceName, InterfaceName};
pub use resource::{IllegalResourceName, ResourceName};
