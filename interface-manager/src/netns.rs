// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Network namespace handles and namespace-pinned execution.
//!
//! The network namespace is a property of an OS thread, not of a process (and certainly not of an
//! async task).  Anything which switches namespace therefore runs on a thread of its own, driven by
//! a single threaded runtime which never migrates work to another thread.

use nix::sched::{CloneFlags, setns};
use std::fs::File;
use std::future::Future;
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where the calling thread's own network namespace is exposed.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

#[derive(Debug, thiserror::Error)]
pub enum NetnsError {
    #[error("network namespace {0} not found")]
    NotFound(PathBuf),
    #[error("failed to open network namespace {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to enter network namespace {path}: {source}")]
    Enter { path: PathBuf, source: nix::Error },
    #[error("failed to start namespace worker: {0}")]
    Worker(std::io::Error),
    #[error("namespace worker panicked")]
    Panicked,
}

impl NetnsError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, NetnsError::NotFound(_))
    }
}

/// An open handle on a network namespace.
///
/// Holding the handle keeps the namespace alive even if every process in it exits.
#[derive(Debug)]
pub struct Netns {
    path: PathBuf,
    file: File,
}

impl Netns {
    /// Open the namespace bound at `path` (e.g. `/var/run/netns/x` or `/proc/<pid>/ns/net`).
    pub fn open(path: impl AsRef<Path>) -> Result<Netns, NetnsError> {
        let path = path.as_ref().to_path_buf();
        match File::open(&path) {
            Ok(file) => Ok(Netns { path, file }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(NetnsError::NotFound(path)),
            Err(source) => Err(NetnsError::Open { path, source }),
        }
    }

    /// The namespace of the calling thread.
    pub fn current() -> Result<Netns, NetnsError> {
        Netns::open(THREAD_NETNS)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for Netns {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for Netns {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Proof that the holder runs on a namespace-pinned worker thread.
///
/// The context cannot leave the worker (it is neither `Send` nor `Sync`), so every namespace switch
/// it performs affects exactly the thread the pinned job runs on.
pub struct NamespaceContext {
    host: Netns,
    _pinned: PhantomData<*const ()>,
}

impl NamespaceContext {
    /// The namespace the worker started in.
    #[must_use]
    pub fn host(&self) -> &Netns {
        &self.host
    }

    /// Switch the worker thread to `netns`.
    ///
    /// Netlink sockets opened before the switch stay bound to the namespace they were opened in.
    pub fn enter(&self, netns: &Netns) -> Result<(), NetnsError> {
        debug!("Entering network namespace {}", netns.path().display());
        setns(netns, CloneFlags::CLONE_NEWNET).map_err(|source| NetnsError::Enter {
            path: netns.path().to_path_buf(),
            source,
        })
    }
}

/// Run `job` on a dedicated OS thread with its own current-thread runtime and wait for it.
///
/// The job may switch the worker's namespace through its [`NamespaceContext`] at any point; the
/// switch can never leak into another thread and the worker exits when the job completes.
/// Must not be called from within an async runtime, since it blocks until the job completes.
pub fn pinned<F, Fut, T>(name: &str, job: F) -> Result<T, NetnsError>
where
    F: FnOnce(NamespaceContext) -> Fut + Send + 'static,
    Fut: Future<Output = T>,
    T: Send + 'static,
{
    let worker = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || -> Result<T, NetnsError> {
            let context = NamespaceContext {
                host: Netns::current()?,
                _pinned: PhantomData,
            };
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()
                .map_err(NetnsError::Worker)?;
            Ok(runtime.block_on(job(context)))
        })
        .map_err(NetnsError::Worker)?;
    worker.join().map_err(|_| NetnsError::Panicked)?
}
