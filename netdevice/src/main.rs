// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]

use anyhow::Context;
use args::{CmdArgs, Parser};
use interface_manager::{RtnlLinks, Scanner};
use mgmt::{PluginConfig, Supervisor};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn run(config: PluginConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("netdevice")
        .build()
        .context("Failed to build the tokio runtime")?;
    runtime.block_on(async move {
        let links = RtnlLinks::connect().context("Failed to open a netlink connection")?;
        let scanner = Scanner::new(links, config.scan_policy.clone());
        let supervisor = Supervisor::new(config, Arc::new(scanner));
        supervisor.run(cancel).await?;
        Ok(())
    })
}

fn main() {
    let args = CmdArgs::parse();
    if let Err(e) = tracectl::init(&args.log_config()) {
        eprintln!("{e}");
        std::process::exit(1);
    }
    let config = match PluginConfig::try_from(args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    info!(
        "Starting netdevice plugin for {} in {}",
        config.resource_name,
        config.device_plugin_dir.display()
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Shutdown requested");
        on_signal.cancel();
    }) {
        error!("Failed to install the signal handler: {e}");
        std::process::exit(1);
    }

    match run(config, cancel) {
        Ok(()) => info!("Netdevice plugin stopped"),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}
