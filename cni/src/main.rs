// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! CNI plugin moving the host interfaces named in a pod annotation into the pod.
//!
//! stdout carries the CNI result or error object and nothing else; logs go to stderr or to the
//! file named by `NETDEVICE_LOG_FILE`.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

mod config;
mod error;
mod ipam;
mod plugin;
mod result;

use crate::config::{Command, Environment, NetConf};
use crate::error::{CniError, ErrorCode};
use crate::plugin::Kernel;
use crate::result::{SUPPORTED_VERSIONS, VersionResult};
use std::io::Read;
use std::path::PathBuf;
use tracectl::{LOG_FILE_ENV, LogConfig};
use tracing::{debug, error};

/// Version of the CNI specification results are produced in unless configured otherwise.
pub const CNI_VERSION: &str = "1.0.0";

/// Upper bound on the network configuration read from stdin.
const MAX_INPUT_SIZE: u64 = 1024 * 1024;

/// Run one invocation, returning what to print on success.
fn run(stdin: &[u8]) -> Result<Option<String>, CniError> {
    let env = Environment::from_process()?;
    debug!("{:?} for {}", env.command, env.container_id);
    if env.command == Command::Version {
        let version = serde_json::to_string(&VersionResult::current()).map_err(|e| {
            CniError::new(ErrorCode::IoFailure, "failed to encode versions").with_details(e)
        })?;
        return Ok(Some(version));
    }
    let conf = NetConf::parse(stdin)?;
    if !SUPPORTED_VERSIONS.contains(&conf.cni_version.as_str()) {
        return Err(CniError::new(
            ErrorCode::IncompatibleVersion,
            format!("unsupported cniVersion {}", conf.cni_version),
        )
        .with_details(format!("supported: {}", SUPPORTED_VERSIONS.join(", "))));
    }
    match env.command {
        Command::Add => plugin::add(&Kernel, &env, &conf, stdin)?
            .to_json()
            .map(Some),
        Command::Del => plugin::del(&Kernel, &env, &conf, stdin).map(|()| None),
        Command::Check => plugin::check(&Kernel, &env, &conf, stdin).map(|()| None),
        Command::Version => Ok(None),
    }
}

/// The version errors are reported in: that of the configuration when it can be read.
fn error_version(stdin: &[u8]) -> String {
    NetConf::parse(stdin).map_or_else(|_| CNI_VERSION.to_string(), |conf| conf.cni_version)
}

fn main() {
    let log = LogConfig::new(None, std::env::var_os(LOG_FILE_ENV).map(PathBuf::from));
    if let Err(e) = tracectl::init(&log) {
        eprintln!("{e}");
    }

    let mut stdin = Vec::new();
    if let Err(e) = std::io::stdin().take(MAX_INPUT_SIZE).read_to_end(&mut stdin) {
        let err = CniError::new(ErrorCode::IoFailure, "failed to read stdin").with_details(e);
        println!("{}", err.to_json(CNI_VERSION));
        std::process::exit(1);
    }

    match run(&stdin) {
        Ok(Some(output)) => println!("{output}"),
        Ok(None) => {}
        Err(e) => {
            error!("{e}");
            println!("{}", e.to_json(&error_version(&stdin)));
            std::process::exit(1);
        }
    }
}
