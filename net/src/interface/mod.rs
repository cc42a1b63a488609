// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Kernel network interface names.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// The name of a network interface, validated against the rules the kernel applies.
#[repr(transparent)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "String", into = "String")
)]
pub struct InterfaceName(String);

/// Errors which may occur when building an [`InterfaceName`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IllegalInterfaceName {
    /// Interface names may not be empty.
    #[error("interface name may not be empty")]
    Empty,
    /// Interface names are limited to [`InterfaceName::MAX_LEN`] bytes.
    #[error("interface name '{0}' is longer than {max} bytes", max = InterfaceName::MAX_LEN)]
    TooLong(String),
    /// Interface names may not contain `/`, `:`, or whitespace, and may not be `.` or `..`.
    #[error("interface name '{0}' contains illegal characters")]
    IllegalCharacters(String),
}

impl InterfaceName {
    /// The longest legal interface name (`IFNAMSIZ` minus the trailing nul).
    pub const MAX_LEN: usize = 15;

    /// Build a new [`InterfaceName`]
    ///
    /// # Errors
    ///
    /// Returns [`IllegalInterfaceName`] if the kernel would refuse this name.
    pub fn new(name: impl Into<String>) -> Result<Self, IllegalInterfaceName> {
        let name = name.into();
        if name.is_empty() {
            return Err(IllegalInterfaceName::Empty);
        }
        if name.len() > Self::MAX_LEN {
            return Err(IllegalInterfaceName::TooLong(name));
        }
        if name == "."
            || name == ".."
            || name
                .chars()
                .any(|c| c == '/' || c == ':' || c.is_whitespace() || c.is_control())
        {
            return Err(IllegalInterfaceName::IllegalCharacters(name));
        }
        Ok(InterfaceName(name))
    }

    /// The name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for InterfaceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for InterfaceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for InterfaceName {
    type Err = IllegalInterfaceName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InterfaceName::new(s)
    }
}

impl TryFrom<&str> for InterfaceName {
    type Error = IllegalInterfaceName;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        InterfaceName::new(value)
    }
}

impl TryFrom<String> for InterfaceName {
    type Error = IllegalInterfaceName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        InterfaceName::new(value)
    }
}

impl From<InterfaceName> for String {
    fn from(value: InterfaceName) -> Self {
        value.0
    }
}

impl PartialEq<str> for InterfaceName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for InterfaceName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod test {
    use crate::interface::{IllegalInterfaceName, InterfaceName};
    use pretty_assertions::assert_eq;

    #[test]
    fn legal_names() {
        for name in ["eth0", "enp2s0f1", "net-0", "a", "abcdefghijklmno", "veth.100"] {
            assert_eq!(InterfaceName::new(name).unwrap(), name);
        }
    }

    #[test]
    fn illegal_names() {
        assert_eq!(InterfaceName::new(""), Err(IllegalInterfaceName::Empty));
        assert_eq!(
            InterfaceName::new("abcdefghijklmnop"),
            Err(IllegalInterfaceName::TooLong("abcdefghijklmnop".to_string()))
        );
        for name in [".", "..", "eth/0", "eth:0", "eth 0", "eth\t0"] {
            assert_eq!(
                InterfaceName::new(name),
                Err(IllegalInterfaceName::IllegalCharacters(name.to_string()))
            );
        }
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_validates() {
        let name: InterfaceName = serde_json::from_str("\"eth1\"").unwrap();
        assert_eq!(name, "eth1");
        assert!(serde_json::from_str::<InterfaceName>("\"eth/1\"").is_err());
    }
}
