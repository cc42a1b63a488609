// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Snapshot of one host link as seen by an inventory pass.

use crate::eth::mac::Mac;
use crate::interface::InterfaceName;
use ipnet::IpNet;
use std::fmt::{Display, Formatter};

/// Liveness of a device, as reported to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Health {
    /// The link is administratively up.
    Healthy,
    /// The link is administratively down.
    Unhealthy,
}

impl Health {
    /// The string the device plugin protocol uses for this state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }
}

impl From<bool> for Health {
    fn from(up: bool) -> Self {
        if up { Health::Healthy } else { Health::Unhealthy }
    }
}

impl Display for Health {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One host link.
///
/// The name is the identity used for allocation; the hardware address is a secondary lookup key.
/// A [`NetworkDevice`] is never mutated: the next inventory pass produces a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetworkDevice {
    /// Name of the link in the host network namespace.
    pub name: InterfaceName,
    /// Hardware address, if the link has one.
    pub mac: Option<Mac>,
    /// Addresses configured on the link (`address/prefix`).
    pub addresses: Vec<IpNet>,
    /// Link MTU.
    pub mtu: u32,
    /// Administrative state.
    pub health: Health,
}

impl NetworkDevice {
    /// Returns true iff the device may be handed out to a container.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }
}

impl Display for NetworkDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (mtu {}, {})", self.name, self.mtu, self.health)?;
        if let Some(mac) = self.mac {
            write!(f, " {mac}")?;
        }
        for address in &self.addresses {
            write!(f, " {address}")?;
        }
        Ok(())
    }
}
