// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Device plugin management: the kubelet facing gRPC server, its registration, and the
//! supervisor that keeps both alive across kubelet restarts.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod config;
pub mod inventory;
pub mod policy;
pub mod registration;
pub mod server;
pub mod supervisor;

pub use config::{PluginConfig, PluginConfigBuilder, PluginConfigBuilderError};
pub use inventory::Inventory;
pub use policy::{Backoff, Debounce};
pub use registration::{RegistrationError, RegistrationSession};
pub use server::DevicePluginService;
pub use supervisor::{Supervisor, SupervisorError};
