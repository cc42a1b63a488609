// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The subset of the CDI document format the descriptors use.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One CDI document: a kind and the devices it defines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiSpec {
    pub cdi_version: String,
    pub kind: String,
    pub devices: Vec<CdiDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiDevice {
    pub name: String,
    pub container_edits: ContainerEdits,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEdits {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<Hook>,
}

/// Lifecycle point at which the runtime runs a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookPoint {
    /// Runs in the runtime's namespace once the container's namespaces exist.
    #[serde(rename = "createRuntime")]
    CreateRuntime,
    /// Runs in the container's namespaces before the user process starts.
    #[serde(rename = "createContainer")]
    CreateContainer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    pub hook_name: HookPoint,
    pub path: PathBuf,
    /// Full argument vector, `args[0]` included.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}
