use core::net::SocketAddr;
use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid flag value or combination of flags.
    #[error("{0}")]
    Config(String),
    #[error("failed to read request file '{}': {err}", path.display())]
    RequestFile {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    /// The target address could not be resolved.
    ///
    /// Aborts the entire run.
    #[error("failed to resolve {addr}: {err}")]
    Resolve {
        addr: String,
        #[source]
        err: io::Error,
    },
    /// A non-blocking connect failed, either immediately or asynchronously
    /// before the connection was established.
    ///
    /// Aborts the entire run.
    #[error("failed to connect to {addr}: {err}")]
    Connect {
        addr: SocketAddr,
        #[source]
        err: io::Error,
    },
    /// Readiness polling failed.
    ///
    /// Only the affected worker stops.
    #[error("polling error: {0}")]
    Poll(#[source] io::Error),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

impl Error {
    /// Returns `true` if this error aborts the whole run rather than a single
    /// worker.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Resolve { .. } | Self::Connect { .. })
    }
}
