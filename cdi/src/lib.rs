// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Container Device Interface descriptors for network devices.
//!
//! Every allocatable device gets one descriptor file in the CDI directory.  The descriptor holds
//! no device nodes or mounts: it only names two hooks that the container runtime runs around
//! container creation, and those hooks move the link into the container's network namespace
//! and configure it there.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

mod descriptor;
pub mod oci;
mod registry;
mod spec;

pub use descriptor::{CDI_VERSION, DescriptorConfig, HookDescriptor, generate, qualified_name};
pub use registry::{Registry, RegistryError, WriteOutcome};
pub use spec::{CdiDevice, CdiSpec, ContainerEdits, Hook, HookPoint};
