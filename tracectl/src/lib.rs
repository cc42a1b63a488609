// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tracing subscriber setup shared by the plugin daemon and its helper binaries.
//!
//! The helper binaries speak their protocols on stdout, so nothing here ever writes there: events
//! go to stderr or to a log file opened in append mode.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{Subscriber, debug, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub use tracing_subscriber::filter::LevelFilter;

/// Directive used when neither an explicit one nor `RUST_LOG` is given.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Environment variable the helper binaries read their log file from.
pub const LOG_FILE_ENV: &str = "NETDEVICE_LOG_FILE";

#[derive(Debug, thiserror::Error)]
pub enum TraceCtlError {
    #[error("Invalid tracing directive '{directive}': {source}")]
    InvalidDirective {
        directive: String,
        #[source]
        source: ParseError,
    },
    #[error("Failed to open log file {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where events go and which of them are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// An `EnvFilter` directive string, e.g. `info,netdevice_mgmt=debug`.
    pub directive: Option<String>,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

impl LogConfig {
    #[must_use]
    pub fn new(directive: Option<String>, file: Option<PathBuf>) -> LogConfig {
        LogConfig { directive, file }
    }
}

/// The filter for `directive`, else `RUST_LOG`, else [`DEFAULT_DIRECTIVE`].
pub fn filter(directive: Option<&str>) -> Result<EnvFilter, TraceCtlError> {
    match directive {
        Some(directive) => {
            EnvFilter::try_new(directive).map_err(|source| TraceCtlError::InvalidDirective {
                directive: directive.to_string(),
                source,
            })
        }
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))),
    }
}

fn open_log_file(path: &Path) -> Result<std::fs::File, TraceCtlError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| TraceCtlError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

/// Build the subscriber described by `config` without installing it.
pub fn subscriber(
    config: &LogConfig,
) -> Result<impl Subscriber + Send + Sync + use<>, TraceCtlError> {
    let filter = filter(config.directive.as_deref())?;
    let (writer, ansi) = match &config.file {
        Some(path) => (BoxMakeWriter::new(Mutex::new(open_log_file(path)?)), false),
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_names(true);
    Ok(tracing_subscriber::registry().with(filter).with(layer))
}

/// Install the subscriber described by `config` as the global default.
///
/// A subscriber installed earlier stays in place; that is reported, not failed.
pub fn init(config: &LogConfig) -> Result<(), TraceCtlError> {
    let subscriber = subscriber(config)?;
    match subscriber.try_init() {
        Ok(()) => debug!("Tracing initialized"),
        Err(e) => warn!("Tracing was already initialized, keeping the existing subscriber: {e}"),
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use crate::{LogConfig, TraceCtlError, filter, subscriber};
    use pretty_assertions::assert_eq;
    use tracing::{debug, info};

    #[test]
    fn directives_are_validated() {
        assert!(filter(Some("info,netdevice_mgmt=debug")).is_ok());
        let err = filter(Some("info,netdevice_mgmt=loud")).unwrap_err();
        assert!(matches!(err, TraceCtlError::InvalidDirective { .. }));
    }

    #[test]
    fn events_are_appended_to_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hook.log");
        std::fs::write(&path, "earlier run\n").unwrap();
        let config = LogConfig::new(Some("info".to_string()), Some(path.clone()));

        tracing::subscriber::with_default(subscriber(&config).unwrap(), || {
            info!("moved eth1");
            debug!("filtered out");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("earlier run\n"));
        assert!(contents.contains("moved eth1"));
        assert!(!contents.contains("filtered out"));
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn unopenable_log_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::new(None, Some(dir.path().join("missing").join("hook.log")));
        let Err(err) = subscriber(&config) else {
            panic!("expected an error");
        };
        assert!(matches!(err, TraceCtlError::LogFile { .. }));
    }
}
