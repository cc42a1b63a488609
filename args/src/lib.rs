// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Command line of the device plugin daemon.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub use clap::Parser;
use interface_manager::ScanPolicy;
use mgmt::config::{
    DEFAULT_CDI_DIR, DEFAULT_DEVICE_PLUGIN_DIR, DEFAULT_HOOK_BINARY, DEFAULT_KUBELET_SOCKET,
    DEFAULT_PLUGIN_SOCKET,
};
use mgmt::{Backoff, Debounce, PluginConfig, PluginConfigBuilder, PluginConfigBuilderError};
use net::{IllegalResourceName, ResourceName};
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use tracectl::LogConfig;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum InvalidCmdArguments {
    #[error("Invalid interface pattern: {0}")]
    InvalidInterfacePattern(#[from] regex::Error),
    #[error(transparent)]
    InvalidResourceName(#[from] IllegalResourceName),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(#[from] PluginConfigBuilderError),
}

/// Parse a duration given as integer seconds, or with an `ms`, `s` or `m` suffix.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (digits, unit): (&str, fn(u64) -> Duration) = if let Some(ms) = value.strip_suffix("ms") {
        (ms, Duration::from_millis)
    } else if let Some(s) = value.strip_suffix('s') {
        (s, Duration::from_secs)
    } else if let Some(m) = value.strip_suffix('m') {
        (m, |m| Duration::from_secs(m.saturating_mul(60)))
    } else {
        (value, Duration::from_secs)
    };
    digits
        .parse::<u64>()
        .map(unit)
        .map_err(|_| format!("'{value}' is not a duration (e.g. 30, 500ms, 15s, 2m)"))
}

#[derive(Parser, Debug)]
#[command(name = "netdevice-plugin")]
#[command(version)]
#[command(
    about = "Offers host network interfaces to containers as kubelet device plugin resources",
    long_about = None
)]
pub struct CmdArgs {
    #[arg(
        long,
        value_name = "REGEX",
        help = "Only offer links whose name matches this pattern (default: every link except loopback and the default route link)"
    )]
    interfaces: Option<String>,

    #[arg(
        long,
        value_name = "DIR",
        default_value = DEFAULT_DEVICE_PLUGIN_DIR,
        help = "Directory holding the kubelet and device plugin sockets"
    )]
    device_plugin_dir: PathBuf,

    #[arg(
        long,
        value_name = "PATH",
        default_value = DEFAULT_KUBELET_SOCKET,
        help = "Kubelet registration socket, relative to the device plugin directory"
    )]
    kubelet_socket: PathBuf,

    #[arg(
        long,
        value_name = "NAME",
        default_value = DEFAULT_PLUGIN_SOCKET,
        help = "File name of the socket this plugin serves on"
    )]
    plugin_socket: String,

    #[arg(
        long,
        value_name = "VENDOR/CLASS",
        default_value = ResourceName::DEFAULT,
        help = "Extended resource name the devices are advertised under"
    )]
    resource_name: String,

    #[arg(
        long,
        value_name = "DIR",
        default_value = DEFAULT_CDI_DIR,
        help = "Directory CDI descriptors are written to"
    )]
    cdi_dir: PathBuf,

    #[arg(
        long,
        value_name = "PATH",
        default_value = DEFAULT_HOOK_BINARY,
        help = "Path of the runtime hook binary, as seen by the container runtime"
    )]
    hook_binary: PathBuf,

    #[arg(long, value_name = "DURATION", default_value = "60s", value_parser = parse_duration)]
    resync_interval: Duration,

    #[arg(
        long,
        value_name = "DURATION",
        default_value = "2s",
        value_parser = parse_duration,
        help = "Quiet period used to coalesce bursts of link notifications"
    )]
    debounce: Duration,

    #[arg(
        long,
        value_name = "DURATION",
        default_value = "15s",
        value_parser = parse_duration,
        help = "How often the kubelet and plugin sockets are checked for a restart"
    )]
    endpoint_poll_interval: Duration,

    #[arg(long, value_name = "DURATION", default_value = "35s", value_parser = parse_duration)]
    register_timeout: Duration,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Registration attempts at startup before giving up"
    )]
    register_attempts: u32,

    #[arg(long, value_name = "DURATION", default_value = "1s", value_parser = parse_duration)]
    backoff_initial: Duration,

    #[arg(long, value_name = "DURATION", default_value = "30s", value_parser = parse_duration)]
    backoff_max: Duration,

    #[arg(
        long,
        value_name = "DIRECTIVE",
        help = "Tracing filter directive, e.g. info,netdevice_mgmt=debug (default: RUST_LOG, else info)"
    )]
    log: Option<String>,

    #[arg(long, value_name = "PATH", help = "Append logs to this file instead of stderr")]
    log_file: Option<PathBuf>,
}

impl CmdArgs {
    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig::new(self.log.clone(), self.log_file.clone())
    }
}

impl TryFrom<CmdArgs> for PluginConfig {
    type Error = InvalidCmdArguments;

    fn try_from(value: CmdArgs) -> Result<Self, InvalidCmdArguments> {
        let include = value.interfaces.as_deref().map(Regex::new).transpose()?;
        Ok(PluginConfigBuilder::default()
            .device_plugin_dir(value.device_plugin_dir)
            .kubelet_socket(value.kubelet_socket)
            .plugin_socket(value.plugin_socket)
            .resource_name(value.resource_name.parse::<ResourceName>()?)
            .scan_policy(ScanPolicy::new(include))
            .cdi_dir(value.cdi_dir)
            .hook_binary(value.hook_binary)
            .resync_interval(value.resync_interval)
            .debounce(Debounce::new(value.debounce))
            .endpoint_poll_interval(value.endpoint_poll_interval)
            .register_timeout(value.register_timeout)
            .register_attempts(value.register_attempts)
            .backoff(Backoff::new(value.backoff_initial, value.backoff_max))
            .build()?)
    }
}

#[cfg(test)]
mod test {
    use crate::{CmdArgs, InvalidCmdArguments, Parser, parse_duration};
    use mgmt::PluginConfig;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::time::Duration;

    fn config(args: &[&str]) -> Result<PluginConfig, InvalidCmdArguments> {
        let argv = std::iter::once("netdevice-plugin").chain(args.iter().copied());
        let args = CmdArgs::try_parse_from(argv).unwrap();
        PluginConfig::try_from(args)
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("30"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("15s"), Ok(Duration::from_secs(15)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("1h").is_err());
        assert!(parse_duration("-3s").is_err());
    }

    #[test]
    fn defaults_match_the_kubelet_layout() {
        let config = config(&[]).unwrap();
        assert_eq!(
            config.kubelet_socket_path(),
            PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock")
        );
        assert_eq!(config.plugin_socket, "netdevice.sock");
        assert_eq!(config.resource_name.to_string(), "networking.k8s.io/netdevice");
        assert_eq!(config.cdi_dir, PathBuf::from("/var/run/cdi"));
        assert_eq!(config.register_timeout, Duration::from_secs(35));
        assert_eq!(config.endpoint_poll_interval, Duration::from_secs(15));
        assert_eq!(config.backoff.initial(), Duration::from_secs(1));
        assert_eq!(config.backoff.max(), Duration::from_secs(30));
    }

    #[test]
    fn flags_reach_the_configuration() {
        let config = config(&[
            "--interfaces",
            "^ens[0-9]+$",
            "--device-plugin-dir",
            "/tmp/plugins",
            "--resource-name",
            "example.com/nic",
            "--debounce",
            "250ms",
            "--register-attempts",
            "2",
            "--backoff-max",
            "1m",
        ])
        .unwrap();
        assert_eq!(
            config.plugin_socket_path(),
            PathBuf::from("/tmp/plugins/netdevice.sock")
        );
        assert_eq!(config.resource_name.vendor(), "example.com");
        assert_eq!(config.resource_name.class(), "nic");
        assert_eq!(config.debounce.window(), Duration::from_millis(250));
        assert_eq!(config.register_attempts, 2);
        assert_eq!(config.backoff.max(), Duration::from_secs(60));
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        assert!(matches!(
            config(&["--interfaces", "eth[0-"]),
            Err(InvalidCmdArguments::InvalidInterfacePattern(_))
        ));
        assert!(matches!(
            config(&["--resource-name", "nic"]),
            Err(InvalidCmdArguments::InvalidResourceName(_))
        ));
        assert!(matches!(
            config(&["--plugin-socket", "a/b.sock"]),
            Err(InvalidCmdArguments::InvalidConfiguration(_))
        ));
        assert!(matches!(
            config(&["--resync-interval", "0"]),
            Err(InvalidCmdArguments::InvalidConfiguration(_))
        ));
        assert!(
            CmdArgs::try_parse_from(["netdevice-plugin", "--register-attempts", "0"]).is_err()
        );
    }

    #[test]
    fn log_flags() {
        let args = CmdArgs::try_parse_from([
            "netdevice-plugin",
            "--log",
            "debug",
            "--log-file",
            "/var/log/netdevice.log",
        ])
        .unwrap();
        let log = args.log_config();
        assert_eq!(log.directive.as_deref(), Some("debug"));
        assert_eq!(log.file, Some(PathBuf::from("/var/log/netdevice.log")));
    }
}
