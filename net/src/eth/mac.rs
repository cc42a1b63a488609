// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Mac address type and logic.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A [MAC Address] type.
///
/// `Mac` is a transparent wrapper around `[u8; 6]`.
/// Links are looked up by [`Mac`] when a caller does not know (or does not trust) the link's name.
///
/// [MAC Address]: https://en.wikipedia.org/wiki/MAC_address
#[must_use]
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "String", into = "String")
)]
pub struct Mac(pub [u8; 6]);

/// Errors which may occur when parsing or converting a [`Mac`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MacError {
    /// The input did not have six `:` separated octets.
    #[error("invalid mac address '{0}': expected six colon separated hex octets")]
    Format(String),
    /// The hardware address of a link was not six bytes long.
    #[error("hardware address has {0} bytes, expected 6")]
    Length(usize),
}

impl From<[u8; 6]> for Mac {
    fn from(value: [u8; 6]) -> Self {
        Mac(value)
    }
}

impl From<Mac> for [u8; 6] {
    fn from(value: Mac) -> Self {
        value.0
    }
}

impl AsRef<[u8; 6]> for Mac {
    fn as_ref(&self) -> &[u8; 6] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Mac {
    type Error = MacError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        <[u8; 6]>::try_from(value)
            .map(Mac)
            .map_err(|_| MacError::Length(value.len()))
    }
}

impl Mac {
    /// The zero `Mac`.
    ///
    /// Links without a hardware address (e.g. tunnels) report `ZERO` or nothing at all.
    pub const ZERO: Mac = Mac([0; 6]);

    /// Returns true iff the binary representation of the [`Mac`] is exclusively zeros.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self == &Mac::ZERO
    }
}

impl Display for Mac {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for Mac {
    type Err = MacError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = input.split(':');
        for octet in &mut octets {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| MacError::Format(input.to_string()))?;
            *octet =
                u8::from_str_radix(part, 16).map_err(|_| MacError::Format(input.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(MacError::Format(input.to_string()));
        }
        Ok(Mac(octets))
    }
}

impl TryFrom<String> for Mac {
    type Error = MacError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Mac::from_str(&value)
    }
}

impl From<Mac> for String {
    fn from(value: Mac) -> Self {
        value.to_string()
    }
}
