// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The CDI directory, as far as descriptors of one kind are concerned.

use crate::descriptor::{DescriptorConfig, HASH_LEN, HookDescriptor, file_prefix, generate};
use net::{NetworkDevice, ResourceName};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize descriptor: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl RegistryError {
    fn io(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> RegistryError {
        let path = path.to_path_buf();
        move |source| RegistryError::Io {
            action,
            path,
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// A file with the same content hash was already present.
    Unchanged,
}

/// Descriptor files of one kind in one directory.
///
/// Files of other kinds, and files that do not look like descriptors, are never touched.
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
    kind: ResourceName,
}

impl Registry {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, kind: ResourceName) -> Registry {
        Registry {
            dir: dir.into(),
            kind,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a descriptor atomically: readers see either no file or the complete document.
    pub fn write(&self, descriptor: &HookDescriptor) -> Result<WriteOutcome, RegistryError> {
        let path = self.dir.join(&descriptor.file_name);
        if path.exists() {
            debug!("Descriptor {} is up to date", path.display());
            return Ok(WriteOutcome::Unchanged);
        }
        std::fs::create_dir_all(&self.dir)
            .map_err(RegistryError::io("create directory", &self.dir))?;

        let mut staged = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(RegistryError::io("stage", &path))?;
        staged
            .write_all(&descriptor.payload)
            .and_then(|()| staged.as_file().sync_all())
            .map_err(RegistryError::io("write", staged.path()))?;
        staged
            .persist(&path)
            .map_err(|e| RegistryError::io("install", &path)(e.error))?;
        info!("Wrote descriptor {}", path.display());
        Ok(WriteOutcome::Written)
    }

    /// Generate and write the descriptor of `device`.
    pub fn publish(
        &self,
        device: &NetworkDevice,
        config: &DescriptorConfig,
    ) -> Result<HookDescriptor, RegistryError> {
        let descriptor = generate(device, config)?;
        self.write(&descriptor)?;
        Ok(descriptor)
    }

    /// Returns the descriptor file names of our kind currently present.
    pub fn list(&self) -> Result<BTreeSet<String>, RegistryError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(RegistryError::io("list", &self.dir)(e)),
        };
        let prefix = file_prefix(&self.kind);
        let mut names = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(RegistryError::io("list", &self.dir))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_descriptor_of(&name, &prefix) {
                names.insert(name);
            }
        }
        Ok(names)
    }

    /// Remove every descriptor of our kind whose file name is not in `keep`.
    ///
    /// Returns the removed file names.  Failing to remove a single file is logged and skipped.
    pub fn prune(&self, keep: &BTreeSet<String>) -> Result<Vec<String>, RegistryError> {
        let mut removed = Vec::new();
        for name in self.list()?.difference(keep) {
            let path = self.dir.join(name);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!("Removed stale descriptor {}", path.display());
                    removed.push(name.clone());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {e}", path.display()),
            }
        }
        Ok(removed)
    }
}

/// `<prefix><device>-<16 hex>.json`
fn is_descriptor_of(name: &str, prefix: &str) -> bool {
    let Some(stem) = name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(".json"))
    else {
        return false;
    };
    match stem.rsplit_once('-') {
        Some((device, hash)) => {
            !device.is_empty()
                && hash.len() == HASH_LEN
                && hash.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}
