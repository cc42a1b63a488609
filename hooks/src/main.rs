// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Container runtime hook moving an allocated link in and out of a container.
//!
//! The runtime passes the container state on stdin and reads nothing from stdout; logs go to
//! stderr, or to the file named by `--log-file` / `NETDEVICE_LOG_FILE`.

#![deny(clippy::all, clippy::pedantic)]

use anyhow::Context;
use cdi::oci::State;
use clap::{Parser, Subcommand};
use interface_manager::migrate::{configure_current, enter_namespace, leave_namespace};
use interface_manager::{ConfigureRequest, EnterRequest, LeaveRequest};
use ipnet::IpNet;
use net::InterfaceName;
use std::io::Read;
use std::path::PathBuf;
use tracectl::{LOG_FILE_ENV, LogConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "netdevice-hook")]
#[command(version)]
#[command(about = "Moves an allocated network device into or out of a container", long_about = None)]
struct HookArgs {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, value_name = "DIRECTIVE", help = "Tracing filter directive")]
    log: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = LOG_FILE_ENV,
        help = "Append logs to this file instead of stderr"
    )]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Move a host link into the network namespace of the container described on stdin.
    Enter {
        device: InterfaceName,
        /// Name inside the container (default: the host name).
        #[arg(long)]
        ifname: Option<InterfaceName>,
    },
    /// Apply MTU and addresses to a link of the current namespace and bring it up.
    Configure {
        device: InterfaceName,
        #[arg(long)]
        mtu: Option<u32>,
        addresses: Vec<IpNet>,
    },
    /// Return a link from a container to the host namespace.
    Leave {
        /// Name of the link inside the container.
        device: InterfaceName,
        /// Network namespace to take the link from (default: that of the container on stdin).
        #[arg(long)]
        netns: Option<PathBuf>,
    },
}

/// Network namespace of the container whose state is read from `stdin`.
fn container_namespace(stdin: impl Read) -> anyhow::Result<Option<PathBuf>> {
    let state = State::from_reader(stdin)?;
    let namespace = state
        .network_namespace()
        .with_context(|| format!("Failed to resolve the network namespace of {}", state.id))?;
    Ok(namespace)
}

fn execute(command: Command, stdin: impl Read) -> anyhow::Result<()> {
    match command {
        Command::Enter { device, ifname } => {
            let Some(netns) = container_namespace(stdin)? else {
                info!("Container shares the host network namespace, leaving {device} in place");
                return Ok(());
            };
            let request = EnterRequest {
                ifname,
                ..EnterRequest::new(device.clone())
            };
            let migrated = enter_namespace(&netns, request)
                .with_context(|| format!("Failed to move {device} to {}", netns.display()))?;
            info!(
                "Moved {} to {} as {}",
                migrated.original,
                netns.display(),
                migrated.name
            );
        }
        Command::Configure {
            device,
            mtu,
            addresses,
        } => {
            configure_current(ConfigureRequest {
                name: device.clone(),
                mtu,
                addresses,
            })
            .with_context(|| format!("Failed to configure {device}"))?;
            info!("Configured {device}");
        }
        Command::Leave { device, netns } => {
            let netns = match netns {
                Some(netns) => netns,
                None => match container_namespace(stdin)? {
                    Some(netns) => netns,
                    None => {
                        info!("Container shares the host network namespace, nothing to return");
                        return Ok(());
                    }
                },
            };
            let restored = leave_namespace(
                &netns,
                LeaveRequest {
                    name: device.clone(),
                    restore_up: None,
                },
            )
            .with_context(|| format!("Failed to return {device} from {}", netns.display()))?;
            info!("Returned {device} to the host as {}", restored.name);
        }
    }
    Ok(())
}

fn main() {
    let args = HookArgs::parse();
    if let Err(e) = tracectl::init(&LogConfig::new(args.log, args.log_file)) {
        eprintln!("{e}");
        std::process::exit(1);
    }
    if let Err(e) = execute(args.command, std::io::stdin().lock()) {
        error!("{e:#}");
        std::process::exit(1);
    }
}
