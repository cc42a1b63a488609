// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Invocation contract: environment variables and the network configuration on stdin.

use crate::error::{CniError, ErrorCode};
use net::{InterfaceName, Mac};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Pod annotation listing the host interfaces a pod asks for.
pub const INTERFACES_ANNOTATION: &str = "networking.k8s.io/interfaces";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

impl std::str::FromStr for Command {
    type Err = CniError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "CHECK" => Ok(Command::Check),
            "VERSION" => Ok(Command::Version),
            other => {
                let other: String = other
                    .chars()
                    .take(32)
                    .filter(char::is_ascii_alphanumeric)
                    .collect();
                Err(CniError::new(
                    ErrorCode::InvalidEnvironmentVariables,
                    format!("unknown CNI_COMMAND '{other}'"),
                ))
            }
        }
    }
}

/// The `CNI_*` environment of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub command: Command,
    pub container_id: String,
    pub netns: Option<PathBuf>,
    pub ifname: Option<InterfaceName>,
    /// Directories searched for delegated plugins.
    pub path: Vec<PathBuf>,
}

impl Environment {
    /// Read the environment through `var`, which yields the value of a variable if it is set.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Environment, CniError> {
        let var = |name: &str| var(name).filter(|value| !value.is_empty());
        let command = var("CNI_COMMAND")
            .ok_or_else(|| CniError::missing_env("CNI_COMMAND"))?
            .parse()?;
        let ifname = var("CNI_IFNAME")
            .map(InterfaceName::new)
            .transpose()
            .map_err(|e| {
                CniError::new(ErrorCode::InvalidEnvironmentVariables, "invalid CNI_IFNAME")
                    .with_details(e)
            })?;
        Ok(Environment {
            command,
            container_id: var("CNI_CONTAINERID").unwrap_or_default(),
            netns: var("CNI_NETNS").map(PathBuf::from),
            ifname,
            path: var("CNI_PATH")
                .map(|path| std::env::split_paths(&path).collect())
                .unwrap_or_default(),
        })
    }

    pub fn from_process() -> Result<Environment, CniError> {
        Environment::from_vars(|name| std::env::var(name).ok())
    }

    pub fn require_netns(&self) -> Result<&PathBuf, CniError> {
        self.netns
            .as_ref()
            .ok_or_else(|| CniError::missing_env("CNI_NETNS"))
    }

    pub fn require_ifname(&self) -> Result<&InterfaceName, CniError> {
        self.ifname
            .as_ref()
            .ok_or_else(|| CniError::missing_env("CNI_IFNAME"))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct IpamConfig {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(
        default,
        rename = "io.kubernetes.cri.pod-annotations",
        alias = "podAnnotations"
    )]
    pub pod_annotations: BTreeMap<String, String>,
}

/// Network configuration passed on stdin.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    #[serde(default = "default_cni_version")]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub ipam: Option<IpamConfig>,
    #[serde(default)]
    pub prev_result: Option<serde_json::Value>,
    #[serde(default)]
    pub runtime_config: RuntimeConfig,
}

fn default_cni_version() -> String {
    crate::CNI_VERSION.to_string()
}

/// One entry of the interfaces annotation; the link is named by name or by hardware address.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct InterfaceRequest {
    #[serde(default)]
    pub name: Option<InterfaceName>,
    #[serde(default)]
    pub hwaddr: Option<Mac>,
}

impl NetConf {
    pub fn parse(raw: &[u8]) -> Result<NetConf, CniError> {
        serde_json::from_slice(raw).map_err(|e| CniError::decoding("network configuration", e))
    }

    /// The ipam plugin to delegate to, if any.
    #[must_use]
    pub fn ipam_plugin(&self) -> Option<&str> {
        self.ipam
            .as_ref()
            .map(|ipam| ipam.kind.as_str())
            .filter(|kind| !kind.is_empty())
    }

    /// Interfaces requested by the pod; none when the annotation is absent.
    pub fn requested_interfaces(&self) -> Result<Vec<InterfaceRequest>, CniError> {
        let Some(raw) = self.runtime_config.pod_annotations.get(INTERFACES_ANNOTATION) else {
            return Ok(Vec::new());
        };
        let requests: Vec<InterfaceRequest> = serde_json::from_str(raw).map_err(|e| {
            CniError::new(
                ErrorCode::InvalidNetworkConfig,
                format!("invalid {INTERFACES_ANNOTATION} annotation"),
            )
            .with_details(e)
        })?;
        if let Some(position) = requests
            .iter()
            .position(|r| r.name.is_none() && r.hwaddr.is_none())
        {
            return Err(CniError::new(
                ErrorCode::InvalidNetworkConfig,
                format!("entry {position} of {INTERFACES_ANNOTATION} names no interface"),
            ));
        }
        Ok(requests)
    }
}

#[cfg(test)]
mod test {
    use crate::config::{Command, Environment, NetConf};
    use crate::error::ErrorCode;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn environment(vars: &[(&str, &str)]) -> Result<Environment, crate::error::CniError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Environment::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn environment_contract() {
        let env = environment(&[
            ("CNI_COMMAND", "ADD"),
            ("CNI_CONTAINERID", "abc"),
            ("CNI_NETNS", "/var/run/netns/cni-1"),
            ("CNI_IFNAME", "net1"),
            ("CNI_PATH", "/opt/cni/bin:/usr/libexec/cni"),
        ])
        .unwrap();
        assert_eq!(env.command, Command::Add);
        assert_eq!(env.container_id, "abc");
        assert_eq!(env.require_netns().unwrap(), &PathBuf::from("/var/run/netns/cni-1"));
        assert_eq!(env.require_ifname().unwrap().as_str(), "net1");
        assert_eq!(
            env.path,
            vec![PathBuf::from("/opt/cni/bin"), PathBuf::from("/usr/libexec/cni")]
        );

        let env = environment(&[("CNI_COMMAND", "DEL"), ("CNI_NETNS", "")]).unwrap();
        assert_eq!(env.netns, None);
        assert_eq!(env.require_netns().unwrap_err().code, ErrorCode::InvalidEnvironmentVariables);

        assert!(environment(&[]).is_err());
        assert!(environment(&[("CNI_COMMAND", "FROB")]).is_err());
        assert!(environment(&[("CNI_COMMAND", "ADD"), ("CNI_IFNAME", "a/b")]).is_err());
    }

    #[test]
    fn interfaces_come_from_the_pod_annotation() {
        let conf = NetConf::parse(
            br#"{
                "cniVersion": "0.4.0",
                "name": "netdevice",
                "type": "netdevice-cni",
                "ipam": {"type": "host-local", "subnet": "10.10.0.0/24"},
                "runtimeConfig": {
                    "io.kubernetes.cri.pod-annotations": {
                        "networking.k8s.io/interfaces": "[{\"name\":\"eth1\"},{\"hwaddr\":\"02:00:00:00:00:02\"}]"
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(conf.cni_version, "0.4.0");
        assert_eq!(conf.ipam_plugin(), Some("host-local"));
        let requests = conf.requested_interfaces().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].name.as_ref().unwrap().as_str(), "eth1");
        assert_eq!(
            requests[1].hwaddr.unwrap().to_string(),
            "02:00:00:00:00:02"
        );
    }

    #[test]
    fn annotation_alias_and_absence() {
        let conf = NetConf::parse(
            br#"{"cniVersion":"1.0.0","runtimeConfig":{"podAnnotations":{"networking.k8s.io/interfaces":"[{\"name\":\"eth2\"}]"}}}"#,
        )
        .unwrap();
        assert_eq!(conf.requested_interfaces().unwrap().len(), 1);

        let conf = NetConf::parse(br#"{"cniVersion":"1.0.0","name":"n"}"#).unwrap();
        assert!(conf.requested_interfaces().unwrap().is_empty());
        assert_eq!(conf.ipam_plugin(), None);
    }

    #[test]
    fn malformed_annotations_are_rejected() {
        for annotation in ["not json", r#"[{}]"#, r#"[{"name":"a/b"}]"#] {
            let raw = serde_json::json!({
                "cniVersion": "1.0.0",
                "runtimeConfig": {"podAnnotations": {"networking.k8s.io/interfaces": annotation}},
            });
            let conf = NetConf::parse(raw.to_string().as_bytes()).unwrap();
            let err = conf.requested_interfaces().unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidNetworkConfig, "{annotation}");
        }
        assert_eq!(
            NetConf::parse(b"{").unwrap_err().code,
            ErrorCode::DecodingFailure
        );
    }
}
