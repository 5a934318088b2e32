//! Network namespace handles and scoped execution.

use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::error::{Error, KernelError, Result};

const CURRENT_NETNS: &str = "/proc/self/ns/net";

/// An open network namespace. The handle is released when dropped.
#[derive(Debug)]
pub struct NetNs {
    path: PathBuf,
    file: Option<File>,
}

impl NetNs {
    pub fn new(path: impl Into<PathBuf>, file: File) -> Self {
        Self {
            path: path.into(),
            file: Some(file),
        }
    }

    /// A handle that only carries its path, for backends that track
    /// namespaces without file descriptors.
    pub fn unbacked(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }
}

/// Open and switch network namespaces for the calling thread.
pub trait Namespaces {
    fn current(&self) -> std::result::Result<NetNs, KernelError>;
    fn open(&self, path: &Path) -> std::result::Result<NetNs, KernelError>;
    fn enter(&self, ns: &NetNs) -> std::result::Result<(), KernelError>;
}

/// [`Namespaces`] backed by `setns(2)`.
#[derive(Debug, Clone, Default)]
pub struct SystemNamespaces;

impl Namespaces for SystemNamespaces {
    fn current(&self) -> std::result::Result<NetNs, KernelError> {
        self.open(Path::new(CURRENT_NETNS))
    }

    fn open(&self, path: &Path) -> std::result::Result<NetNs, KernelError> {
        let file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => KernelError::NotFound(format!("netns {}", path.display())),
            _ => KernelError::Other(format!("failed to open netns {}: {}", path.display(), e)),
        })?;
        Ok(NetNs::new(path, file))
    }

    fn enter(&self, ns: &NetNs) -> std::result::Result<(), KernelError> {
        let file = ns.file().ok_or_else(|| {
            KernelError::Other(format!("netns {} has no open handle", ns.path().display()))
        })?;
        setns(file.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
            KernelError::Other(format!("setns {}: {}", ns.path().display(), e))
        })
    }
}

fn namespace_error(ns: &NetNs, source: KernelError) -> Error {
    Error::Namespace {
        path: ns.path().display().to_string(),
        source,
    }
}

/// Switches back to the saved namespace if the scope unwinds.
struct Restore<'a> {
    namespaces: &'a dyn Namespaces,
    original: NetNs,
    armed: bool,
}

impl Restore<'_> {
    fn finish(mut self) -> Result<()> {
        self.armed = false;
        self.namespaces
            .enter(&self.original)
            .map_err(|e| namespace_error(&self.original, e))
    }
}

impl Drop for Restore<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.namespaces.enter(&self.original) {
                error!("Failed to restore original network namespace: {}", e);
            }
        }
    }
}

/// Run `f` inside `target`, then return to the caller's namespace on every
/// exit path. The closure's error wins over a restore failure.
pub fn with_netns<T, F>(namespaces: &dyn Namespaces, target: &NetNs, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let original = namespaces
        .current()
        .map_err(|e| Error::Namespace {
            path: CURRENT_NETNS.to_string(),
            source: e,
        })?;

    debug!("Entering network namespace {}", target.path().display());
    namespaces
        .enter(target)
        .map_err(|e| namespace_error(target, e))?;

    let restore = Restore {
        namespaces,
        original,
        armed: true,
    };
    let result = f();

    match (result, restore.finish()) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(restore_err)) => Err(restore_err),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(restore_err)) => {
            error!("{}", restore_err);
            Err(e)
        }
    }
}
