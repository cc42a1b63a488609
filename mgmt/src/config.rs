// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Launch configuration of the device plugin.

use crate::policy::{Backoff, Debounce};
use cdi::DescriptorConfig;
use derive_builder::Builder;
use interface_manager::ScanPolicy;
use net::ResourceName;
use std::path::PathBuf;
use std::time::Duration;

/// Directory the kubelet watches for device plugin sockets.
pub const DEFAULT_DEVICE_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins/";
pub const DEFAULT_KUBELET_SOCKET: &str = "kubelet.sock";
pub const DEFAULT_PLUGIN_SOCKET: &str = "netdevice.sock";
pub const DEFAULT_CDI_DIR: &str = "/var/run/cdi";
pub const DEFAULT_HOOK_BINARY: &str = "/opt/cdi/bin/netdevice-hook";

#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct PluginConfig {
    #[builder(setter(into), default = DEFAULT_DEVICE_PLUGIN_DIR.into())]
    pub device_plugin_dir: PathBuf,

    /// Kubelet registration socket, relative to `device_plugin_dir`.
    #[builder(setter(into), default = DEFAULT_KUBELET_SOCKET.into())]
    pub kubelet_socket: PathBuf,

    /// File name of our socket in `device_plugin_dir`.
    #[builder(setter(into), default = DEFAULT_PLUGIN_SOCKET.to_string())]
    pub plugin_socket: String,

    #[builder(default)]
    pub resource_name: ResourceName,

    #[builder(default)]
    pub scan_policy: ScanPolicy,

    #[builder(setter(into), default = DEFAULT_CDI_DIR.into())]
    pub cdi_dir: PathBuf,

    #[builder(setter(into), default = DEFAULT_HOOK_BINARY.into())]
    pub hook_binary: PathBuf,

    #[builder(default = Duration::from_secs(60))]
    pub resync_interval: Duration,

    #[builder(default = Debounce::new(Duration::from_secs(2)))]
    pub debounce: Debounce,

    #[builder(default = Duration::from_secs(15))]
    pub endpoint_poll_interval: Duration,

    #[builder(default = Duration::from_secs(35))]
    pub register_timeout: Duration,

    /// Registration attempts made at startup before giving up.
    #[builder(default = 5)]
    pub register_attempts: u32,

    #[builder(default)]
    pub backoff: Backoff,
}

impl PluginConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(socket) = &self.plugin_socket {
            if socket.is_empty() || socket.contains('/') {
                return Err(format!("plugin socket '{socket}' must be a plain file name"));
            }
        }
        if self.register_attempts == Some(0) {
            return Err("at least one registration attempt is required".to_string());
        }
        for (name, interval) in [
            ("resync interval", self.resync_interval),
            ("endpoint poll interval", self.endpoint_poll_interval),
            ("registration timeout", self.register_timeout),
        ] {
            if interval.is_some_and(|i| i.is_zero()) {
                return Err(format!("{name} must not be zero"));
            }
        }
        Ok(())
    }
}

impl PluginConfig {
    #[must_use]
    pub fn kubelet_socket_path(&self) -> PathBuf {
        self.device_plugin_dir.join(&self.kubelet_socket)
    }

    #[must_use]
    pub fn plugin_socket_path(&self) -> PathBuf {
        self.device_plugin_dir.join(&self.plugin_socket)
    }

    #[must_use]
    pub fn descriptor_config(&self) -> DescriptorConfig {
        DescriptorConfig {
            kind: self.resource_name.clone(),
            hook_binary: self.hook_binary.clone(),
        }
    }
}
