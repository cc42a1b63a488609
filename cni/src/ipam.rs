// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Delegation to an ipam plugin.
//!
//! The delegate runs with our environment (only `CNI_COMMAND` may differ) and receives our stdin.

use crate::config::Command as CniCommand;
use crate::error::{CniError, ErrorCode};
use crate::result::CniResult;
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

fn verb(command: CniCommand) -> &'static str {
    match command {
        CniCommand::Add => "ADD",
        CniCommand::Del => "DEL",
        CniCommand::Check => "CHECK",
        CniCommand::Version => "VERSION",
    }
}

/// Locate `plugin` in the `CNI_PATH` directories.
pub fn find(plugin: &str, path: &[PathBuf]) -> Result<PathBuf, CniError> {
    if plugin.contains('/') {
        return Err(CniError::new(
            ErrorCode::InvalidNetworkConfig,
            format!("ipam type '{plugin}' is not a plugin name"),
        ));
    }
    path.iter()
        .map(|dir| dir.join(plugin))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            CniError::new(
                ErrorCode::InvalidNetworkConfig,
                format!("ipam plugin '{plugin}' not found in CNI_PATH"),
            )
        })
}

#[derive(Deserialize)]
struct DelegateError {
    code: u32,
    msg: String,
    #[serde(default)]
    details: String,
}

/// Run `binary` for `command` with `stdin`, returning what it printed.
pub fn exec(binary: &Path, command: CniCommand, stdin: &[u8]) -> Result<Vec<u8>, CniError> {
    debug!("Delegating {} to {}", verb(command), binary.display());
    let io_failure = |e: std::io::Error| {
        CniError::new(
            ErrorCode::IoFailure,
            format!("failed to run {}", binary.display()),
        )
        .with_details(e)
    };
    let mut child = Command::new(binary)
        .env("CNI_COMMAND", verb(command))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(io_failure)?;
    // stdin is fed while stdout is drained; the child is reaped whatever happens to either
    let pipe = child.stdin.take();
    let (output, written) = std::thread::scope(|scope| {
        let writer = pipe.map(|mut pipe| scope.spawn(move || pipe.write_all(stdin)));
        let output = child.wait_with_output();
        let written = writer.map_or(Ok(()), |writer| {
            writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")))
        });
        (output, written)
    });
    let output = output.map_err(io_failure)?;
    if output.status.success() {
        written.map_err(io_failure)?;
        return Ok(output.stdout);
    }
    if let Err(e) = written {
        debug!("{} did not take all of its input: {e}", binary.display());
    }
    let error = match serde_json::from_slice::<DelegateError>(&output.stdout) {
        Ok(delegate) => CniError::new(ErrorCode::IoFailure, delegate.msg)
            .with_details(format!("code {}: {}", delegate.code, delegate.details)),
        Err(_) => CniError::new(
            ErrorCode::IoFailure,
            format!("{} failed with {}", binary.display(), output.status),
        ),
    };
    Err(error)
}

/// Ask the ipam plugin for addresses.
pub fn add(binary: &Path, stdin: &[u8]) -> Result<CniResult, CniError> {
    CniResult::from_slice(&exec(binary, CniCommand::Add, stdin)?)
}

pub fn del(binary: &Path, stdin: &[u8]) -> Result<(), CniError> {
    exec(binary, CniCommand::Del, stdin).map(|_| ())
}

pub fn check(binary: &Path, stdin: &[u8]) -> Result<(), CniError> {
    exec(binary, CniCommand::Check, stdin).map(|_| ())
}
