// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Pure descriptor generation.

use crate::spec::{CdiDevice, CdiSpec, ContainerEdits, Hook, HookPoint};
use net::{InterfaceName, NetworkDevice, ResourceName};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Version of the CDI document format emitted.
pub const CDI_VERSION: &str = "0.5.0";

/// Length of the content hash carried in descriptor file names, in hex digits.
pub(crate) const HASH_LEN: usize = 16;

/// What every descriptor shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorConfig {
    /// Descriptor kind; the same name as the advertised resource.
    pub kind: ResourceName,
    /// Absolute path of the hook executable the runtime invokes.
    pub hook_binary: PathBuf,
}

/// A generated descriptor, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookDescriptor {
    pub device: InterfaceName,
    /// File name, including the `.json` extension.
    pub file_name: String,
    pub spec: CdiSpec,
    /// Serialized document; the file name hash is computed over these bytes.
    pub payload: Vec<u8>,
}

/// The fully qualified CDI name of `device`, as handed back to the kubelet.
#[must_use]
pub fn qualified_name(kind: &ResourceName, device: &InterfaceName) -> String {
    format!("{kind}={device}")
}

/// Prefix of every descriptor file of `kind`.
pub(crate) fn file_prefix(kind: &ResourceName) -> String {
    format!("{}-{}_", kind.vendor(), kind.class())
}

fn hook_args(binary: &str, verb: &str, device: &InterfaceName) -> Vec<String> {
    vec![binary.to_string(), verb.to_string(), device.to_string()]
}

/// Generate the descriptor of one device.
///
/// Identical input yields byte-identical output, so the file name doubles as a content check.
pub fn generate(
    device: &NetworkDevice,
    config: &DescriptorConfig,
) -> Result<HookDescriptor, serde_json::Error> {
    let binary = config.hook_binary.display().to_string();

    let enter = Hook {
        hook_name: HookPoint::CreateRuntime,
        path: config.hook_binary.clone(),
        args: hook_args(&binary, "enter", &device.name),
    };

    let mut args = hook_args(&binary, "configure", &device.name);
    args.push("--mtu".to_string());
    args.push(device.mtu.to_string());
    args.extend(device.addresses.iter().map(ToString::to_string));
    let configure = Hook {
        hook_name: HookPoint::CreateContainer,
        path: config.hook_binary.clone(),
        args,
    };

    let spec = CdiSpec {
        cdi_version: CDI_VERSION.to_string(),
        kind: config.kind.to_string(),
        devices: vec![CdiDevice {
            name: device.name.to_string(),
            container_edits: ContainerEdits {
                hooks: vec![enter, configure],
            },
        }],
    };
    let payload = serde_json::to_vec_pretty(&spec)?;
    let digest = hex::encode(&Sha256::digest(&payload)[..]);
    let file_name = format!(
        "{}{}-{}.json",
        file_prefix(&config.kind),
        device.name,
        &digest[..HASH_LEN]
    );
    Ok(HookDescriptor {
        device: device.name.clone(),
        file_name,
        spec,
        payload,
    })
}
