// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Vendor qualified resource names (`domain/resourcetype`).

use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A vendor qualified resource name such as `networking.k8s.io/netdevice`.
///
/// The vendor part is a dns-like domain and the class part is a simple identifier.
/// The same pair names both the advertised resource and the kind of the device descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName {
    vendor: String,
    class: String,
}

/// Errors which may occur when parsing a [`ResourceName`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IllegalResourceName {
    /// The name was not of the form `vendor/class`.
    #[error("resource name '{0}' is not of the form domain/resourcetype")]
    Shape(String),
    /// One of the halves contained characters outside `[A-Za-z0-9._-]`.
    #[error("resource name '{0}' contains illegal characters")]
    IllegalCharacters(String),
}

impl ResourceName {
    /// The resource this plugin advertises unless configured otherwise.
    pub const DEFAULT: &'static str = "networking.k8s.io/netdevice";

    /// The vendor (domain) half.
    #[must_use]
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// The class (resource type) half.
    #[must_use]
    pub fn class(&self) -> &str {
        &self.class
    }
}

impl Default for ResourceName {
    fn default() -> Self {
        ResourceName {
            vendor: "networking.k8s.io".to_string(),
            class: "netdevice".to_string(),
        }
    }
}

fn legal_part(part: &str, allow_dots: bool) -> bool {
    !part.is_empty()
        && part.chars().all(|c| {
            c.is_ascii_alphanumeric() || c == '-' || c == '_' || (allow_dots && c == '.')
        })
        && part.starts_with(|c: char| c.is_ascii_alphanumeric())
        && part.ends_with(|c: char| c.is_ascii_alphanumeric())
}

impl FromStr for ResourceName {
    type Err = IllegalResourceName;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (vendor, class) = input
            .split_once('/')
            .ok_or_else(|| IllegalResourceName::Shape(input.to_string()))?;
        if vendor.is_empty() || class.is_empty() || class.contains('/') {
            return Err(IllegalResourceName::Shape(input.to_string()));
        }
        if !legal_part(vendor, true) || !legal_part(class, false) {
            return Err(IllegalResourceName::IllegalCharacters(input.to_string()));
        }
        Ok(ResourceName {
            vendor: vendor.to_string(),
            class: class.to_string(),
        })
    }
}

impl Display for ResourceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.vendor, self.class)
    }
}
