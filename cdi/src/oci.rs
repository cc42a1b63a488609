// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The container state a runtime hands to its hooks.
//!
//! Hooks receive the OCI state document on stdin.  The network namespace is not part of it: it
//! is found in the runtime configuration (`config.json`) of the bundle the state points at.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("failed to read container state: {0}")]
    ReadState(#[source] std::io::Error),
    #[error("malformed container state: {0}")]
    ParseState(#[source] serde_json::Error),
    #[error("failed to read {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed runtime configuration {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("container {0} has a network namespace with no path and no init process")]
    NoNamespacePath(String),
}

/// OCI container state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    #[serde(default)]
    pub oci_version: String,
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub pid: Option<i32>,
    pub bundle: PathBuf,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// The part of the runtime configuration we care about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub linux: Option<Linux>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Linux {
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl State {
    pub fn from_reader(mut reader: impl Read) -> Result<State, OciError> {
        let mut raw = String::new();
        reader
            .read_to_string(&mut raw)
            .map_err(OciError::ReadState)?;
        serde_json::from_str(&raw).map_err(OciError::ParseState)
    }

    pub fn runtime_config(&self) -> Result<RuntimeConfig, OciError> {
        let path = self.bundle.join("config.json");
        let raw = std::fs::read(&path).map_err(|source| OciError::ReadConfig {
            path: path.clone(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| OciError::ParseConfig { path, source })
    }

    /// The network namespace of the container.
    ///
    /// `None` means the container shares the runtime's network namespace and there is nothing
    /// to move.  A network namespace without a path is one the runtime created for the
    /// container; it is reached through the container's init process, and is an error without
    /// one.
    pub fn network_namespace(&self) -> Result<Option<PathBuf>, OciError> {
        let config = self.runtime_config()?;
        let namespace = config
            .linux
            .unwrap_or_default()
            .namespaces
            .into_iter()
            .find(|ns| ns.kind == "network");
        match namespace {
            None => Ok(None),
            Some(Namespace {
                path: Some(path), ..
            }) if !path.as_os_str().is_empty() => Ok(Some(path)),
            Some(_) => self
                .pid
                .filter(|pid| *pid > 0)
                .map(|pid| Some(proc_netns(pid)))
                .ok_or_else(|| OciError::NoNamespacePath(self.id.clone())),
        }
    }
}

fn proc_netns(pid: i32) -> PathBuf {
    Path::new("/proc").join(pid.to_string()).join("ns/net")
}
