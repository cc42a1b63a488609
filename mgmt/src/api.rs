// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Generated bindings of the kubelet APIs.

/// Device plugin API.
#[allow(clippy::all, clippy::pedantic)]
pub mod v1beta1 {
    tonic::include_proto!("v1beta1");

    /// The API version sent in `RegisterRequest`.
    pub const VERSION: &str = "v1beta1";
}

/// Plugin watcher registration API.
#[allow(clippy::all, clippy::pedantic)]
pub mod pluginregistration {
    tonic::include_proto!("pluginregistration");

    /// `PluginInfo::type` of device plugins.
    pub const DEVICE_PLUGIN: &str = "DevicePlugin";
}
