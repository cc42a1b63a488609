// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Keeps the plugin registered with the kubelet.
//!
//! One serving attempt binds the plugin socket, starts the gRPC server, registers, and then
//! watches the kubelet socket.  When the kubelet restarts (its socket disappears and comes back,
//! or is replaced), when our own socket is removed, or when the kubelet rejects us, the attempt
//! is cancelled and a fresh one starts.  The device pool outlives attempts.

use crate::api::pluginregistration::registration_server::RegistrationServer;
use crate::api::v1beta1::device_plugin_server::DevicePluginServer;
use crate::config::PluginConfig;
use crate::inventory::Inventory;
use crate::registration::{
    PluginRegistrationService, RegistrationError, RegistrationSession, register,
    register_request,
};
use crate::server::DevicePluginService;
use futures::future::OptionFuture;
use inotify::{Inotify, WatchMask};
use pool::DevicePool;
use std::fmt::{Display, Formatter};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("giving up after {attempts} registration attempts: {last}")]
    RegistrationExhausted {
        attempts: u32,
        #[source]
        last: RegistrationError,
    },
}

/// Why a serving attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    KubeletRestarted,
    PluginSocketRemoved,
    RegistrationRejected,
    ServerStopped,
}

impl Display for RestartReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            RestartReason::KubeletRestarted => "kubelet restarted",
            RestartReason::PluginSocketRemoved => "plugin socket removed",
            RestartReason::RegistrationRejected => "registration rejected",
            RestartReason::ServerStopped => "gRPC server stopped",
        };
        f.write_str(reason)
    }
}

/// What one look at the plugin directory means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Steady,
    /// The kubelet socket is gone; we are no longer registered.
    KubeletGone,
    Restart(RestartReason),
}

/// Tracks the kubelet socket by inode, from the registration on.
#[derive(Debug, Clone)]
pub struct EndpointTracker {
    kubelet: Option<u64>,
    gone: bool,
}

impl EndpointTracker {
    /// `kubelet` is the inode of the kubelet socket we registered with.
    #[must_use]
    pub fn new(kubelet: Option<u64>) -> EndpointTracker {
        EndpointTracker {
            kubelet,
            gone: kubelet.is_none(),
        }
    }

    pub fn observe(&mut self, kubelet: Option<u64>, plugin_present: bool) -> Observation {
        match kubelet {
            None if self.gone => Observation::Steady,
            None => {
                self.gone = true;
                Observation::KubeletGone
            }
            Some(_) if self.gone => Observation::Restart(RestartReason::KubeletRestarted),
            Some(inode) if Some(inode) != self.kubelet => {
                Observation::Restart(RestartReason::KubeletRestarted)
            }
            Some(_) if !plugin_present => Observation::Restart(RestartReason::PluginSocketRemoved),
            Some(_) => Observation::Steady,
        }
    }
}

fn inode(path: &Path) -> Option<u64> {
    match std::fs::metadata(path) {
        Ok(metadata) => Some(metadata.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Failed to stat {}: {e}", path.display());
            None
        }
    }
}

/// Wakes up when entries of a directory are created or removed.
struct DirectoryWatch {
    // deregistered before the inotify descriptor closes
    fd: AsyncFd<RawFd>,
    inotify: Inotify,
}

impl DirectoryWatch {
    fn new(dir: &Path) -> std::io::Result<DirectoryWatch> {
        let inotify = Inotify::init()?;
        inotify.watches().add(
            dir,
            WatchMask::CREATE
                | WatchMask::DELETE
                | WatchMask::MOVED_FROM
                | WatchMask::MOVED_TO
                | WatchMask::DELETE_SELF,
        )?;
        let fd = AsyncFd::new(inotify.as_raw_fd())?;
        Ok(DirectoryWatch { fd, inotify })
    }

    async fn changed(&mut self) -> std::io::Result<()> {
        loop {
            let mut guard = self.fd.readable().await?;
            let mut buffer = [0u8; 4096];
            match self.inotify.read_events(&mut buffer) {
                Ok(events) => {
                    let count = events.count();
                    guard.clear_ready();
                    if count > 0 {
                        trace!("{count} directory events");
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => guard.clear_ready(),
                Err(e) => return Err(e),
            }
        }
    }
}

async fn directory_changed(watch: &mut Option<DirectoryWatch>) -> std::io::Result<()> {
    match watch {
        Some(watch) => watch.changed().await,
        None => std::future::pending().await,
    }
}

/// Remove a leftover socket and bind a fresh one.
fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => info!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

type ServerHandle = JoinHandle<Result<(), tonic::transport::Error>>;

enum Wake {
    Look,
    WatchFailed(std::io::Error),
    Session,
}

pub struct Supervisor<I> {
    config: PluginConfig,
    inventory: Arc<I>,
    pool: Arc<DevicePool>,
    session: Arc<watch::Sender<RegistrationSession>>,
}

impl<I: Inventory> Supervisor<I> {
    pub fn new(config: PluginConfig, inventory: Arc<I>) -> Supervisor<I> {
        let (session, _) = watch::channel(RegistrationSession::default());
        Supervisor {
            config,
            inventory,
            pool: Arc::new(DevicePool::new()),
            session: Arc::new(session),
        }
    }

    #[must_use]
    pub fn pool(&self) -> Arc<DevicePool> {
        self.pool.clone()
    }

    #[must_use]
    pub fn session(&self) -> watch::Receiver<RegistrationSession> {
        self.session.subscribe()
    }

    /// Serve until `cancel` fires.
    ///
    /// Fails only if the very first registration does not succeed within the configured number
    /// of attempts; once registered, registration is retried forever.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        let mut registered_once = false;
        let mut generation = 0u64;
        while !cancel.is_cancelled() {
            generation += 1;
            let token = cancel.child_token();
            let outcome = self
                .attempt(&token, &mut registered_once)
                .instrument(info_span!("serving", generation))
                .await;
            token.cancel();
            match outcome? {
                Some(reason) => info!("Restarting the device plugin: {reason}"),
                None => break,
            }
        }
        info!("Device plugin stopped");
        Ok(())
    }

    fn spawn_server(&self, listener: UnixListener, token: &CancellationToken) -> ServerHandle {
        let plugin = DevicePluginService::new(
            self.inventory.clone(),
            self.pool.clone(),
            &self.config,
            token.clone(),
        );
        let registration = PluginRegistrationService::new(
            &self.config.resource_name,
            &self.config.plugin_socket_path(),
            self.session.clone(),
        );
        let incoming = UnixListenerStream::new(listener);
        let shutdown = token.clone().cancelled_owned();
        tokio::spawn(
            Server::builder()
                .add_service(DevicePluginServer::new(plugin))
                .add_service(RegistrationServer::new(registration))
                .serve_with_incoming_shutdown(incoming, shutdown),
        )
    }

    /// One serving attempt.  Returns `None` once cancelled.
    async fn attempt(
        &self,
        token: &CancellationToken,
        registered_once: &mut bool,
    ) -> Result<Option<RestartReason>, SupervisorError> {
        let plugin_socket = self.config.plugin_socket_path();
        let mut server = None;
        let mut failures = 0u32;

        // bind, serve, register
        loop {
            let served = match &server {
                Some(_) => Ok(()),
                None => match bind(&plugin_socket) {
                    Ok(listener) => {
                        debug!("Serving on {}", plugin_socket.display());
                        server = Some(self.spawn_server(listener, token));
                        Ok(())
                    }
                    Err(e) => Err(RegistrationError::Bind {
                        path: plugin_socket.clone(),
                        source: e,
                    }),
                },
            };
            let result = match served {
                Ok(()) => {
                    self.session.send_replace(RegistrationSession::default());
                    tokio::select! {
                        () = token.cancelled() => {
                            stop(token, &mut server).await;
                            return Ok(None);
                        }
                        result = self.register() => result.and_then(|()| self.confirm()),
                    }
                }
                Err(e) => Err(e),
            };
            let last = match result {
                Ok(()) => break,
                Err(e) => e,
            };
            failures += 1;
            self.session
                .send_replace(RegistrationSession::failed(last.to_string()));
            if !*registered_once && failures >= self.config.register_attempts {
                error!("Registration failed {failures} times, giving up: {last}");
                stop(token, &mut server).await;
                return Err(SupervisorError::RegistrationExhausted {
                    attempts: failures,
                    last,
                });
            }
            let delay = self.config.backoff.delay(failures - 1);
            warn!("Registration attempt {failures} failed: {last}; retrying in {delay:?}");
            tokio::select! {
                () = token.cancelled() => {
                    stop(token, &mut server).await;
                    return Ok(None);
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
        *registered_once = true;
        info!(
            "Registered {} with the kubelet",
            self.config.resource_name
        );

        let reason = self.monitor(token, &mut server).await;
        stop(token, &mut server).await;
        Ok(reason)
    }

    async fn register(&self) -> Result<(), RegistrationError> {
        register(
            &self.config.kubelet_socket_path(),
            register_request(&self.config.resource_name, &self.config.plugin_socket),
            self.config.register_timeout,
        )
        .await
    }

    /// Record a successful `Register`, unless the kubelet rejected us while it was in flight.
    fn confirm(&self) -> Result<(), RegistrationError> {
        let mut rejection = None;
        self.session.send_if_modified(|session| match &session.last_error {
            Some(error) => {
                rejection = Some(error.clone());
                false
            }
            None => {
                *session = RegistrationSession::registered();
                true
            }
        });
        rejection.map_or(Ok(()), |error| Err(RegistrationError::Rejected(error)))
    }

    /// Watch the endpoints until the attempt must end.
    async fn monitor(
        &self,
        token: &CancellationToken,
        server: &mut Option<ServerHandle>,
    ) -> Option<RestartReason> {
        let kubelet_socket = self.config.kubelet_socket_path();
        let plugin_socket = self.config.plugin_socket_path();
        let mut tracker = EndpointTracker::new(inode(&kubelet_socket));
        let mut session = self.session.subscribe();
        if !session.borrow_and_update().registered {
            return Some(RestartReason::RegistrationRejected);
        }
        let mut directory = DirectoryWatch::new(&self.config.device_plugin_dir)
            .inspect_err(|e| warn!("Not watching the plugin directory, polling only: {e}"))
            .ok();

        loop {
            let wake = tokio::select! {
                () = token.cancelled() => return None,
                Some(result) = OptionFuture::from(server.as_mut()) => {
                    *server = None;
                    match result {
                        Ok(Ok(())) => warn!("gRPC server exited"),
                        Ok(Err(e)) => error!("gRPC server failed: {e}"),
                        Err(e) => error!("gRPC server task failed: {e}"),
                    }
                    return Some(RestartReason::ServerStopped);
                }
                () = tokio::time::sleep(self.config.endpoint_poll_interval) => Wake::Look,
                result = directory_changed(&mut directory) => match result {
                    Ok(()) => Wake::Look,
                    Err(e) => Wake::WatchFailed(e),
                },
                Ok(()) = session.changed() => Wake::Session,
            };
            match wake {
                Wake::Look => {}
                Wake::WatchFailed(e) => {
                    warn!("Plugin directory watch failed, polling only: {e}");
                    directory = None;
                }
                Wake::Session => {
                    let current = session.borrow_and_update().clone();
                    if !current.registered {
                        return Some(RestartReason::RegistrationRejected);
                    }
                }
            }
            match tracker.observe(inode(&kubelet_socket), plugin_socket.exists()) {
                Observation::Steady => {}
                Observation::KubeletGone => {
                    warn!("Kubelet socket {} disappeared", kubelet_socket.display());
                    self.session
                        .send_replace(RegistrationSession::failed("kubelet socket disappeared"));
                    session.mark_unchanged();
                }
                Observation::Restart(reason) => return Some(reason),
            }
        }
    }
}

/// Cancel the attempt and wait for its server to wind down.
async fn stop(token: &CancellationToken, server: &mut Option<ServerHandle>) {
    token.cancel();
    if let Some(handle) = server.take() {
        match handle.await {
            Ok(Ok(())) => debug!("gRPC server stopped"),
            Ok(Err(e)) => warn!("gRPC server stopped with an error: {e}"),
            Err(e) => warn!("gRPC server task failed: {e}"),
        }
    }
}
