// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Results printed on stdout.

use crate::error::CniError;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

/// Versions of the CNI specification this plugin speaks.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpConfig {
    pub address: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    /// Index into the `interfaces` of the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// A CNI result.  Routes and DNS settings are carried through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<serde_json::Value>,
}

impl CniResult {
    pub fn from_value(value: serde_json::Value) -> Result<CniResult, CniError> {
        serde_json::from_value(value).map_err(|e| CniError::decoding("previous result", e))
    }

    pub fn from_slice(raw: &[u8]) -> Result<CniResult, CniError> {
        serde_json::from_slice(raw).map_err(|e| CniError::decoding("delegated plugin result", e))
    }

    /// Append an interface, returning its index.
    pub fn push_interface(&mut self, interface: Interface) -> usize {
        self.interfaces.push(interface);
        self.interfaces.len() - 1
    }

    pub fn to_json(&self) -> Result<String, CniError> {
        serde_json::to_string(self).map_err(|e| {
            CniError::new(crate::error::ErrorCode::IoFailure, "failed to encode result")
                .with_details(e)
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResult {
    pub cni_version: String,
    pub supported_versions: Vec<String>,
}

impl VersionResult {
    #[must_use]
    pub fn current() -> VersionResult {
        VersionResult {
            cni_version: crate::CNI_VERSION.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(ToString::to_string).collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::result::{CniResult, VersionResult};
    use pretty_assertions::assert_eq;

    #[test]
    fn previous_results_keep_their_extra_fields() {
        let prev = serde_json::json!({
            "cniVersion": "1.0.0",
            "interfaces": [{"name": "eth0", "mac": "02:00:00:00:00:01", "sandbox": "/var/run/netns/a"}],
            "ips": [{"address": "10.0.0.2/24", "gateway": "10.0.0.1", "interface": 0}],
            "routes": [{"dst": "0.0.0.0/0"}],
            "dns": {"nameservers": ["10.0.0.53"]}
        });
        let result = CniResult::from_value(prev.clone()).unwrap();
        assert_eq!(result.interfaces.len(), 1);
        assert_eq!(result.ips[0].interface, Some(0));
        let round: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
        assert_eq!(round, prev);
    }

    #[test]
    fn version_document() {
        let version = serde_json::to_value(VersionResult::current()).unwrap();
        assert_eq!(
            version,
            serde_json::json!({
                "cniVersion": "1.0.0",
                "supportedVersions": ["0.3.0", "0.3.1", "0.4.0", "1.0.0"]
            })
        );
    }
}
