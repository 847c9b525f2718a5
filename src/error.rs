//! Errors shared by the low-level campaign modules.
use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Artifact or directory name matches no known pattern.
    #[error("bad artifact name: {0}")]
    Naming(String),
    /// On-disk invariant violated.
    #[error("corrupted campaign state: {0}")]
    Corruption(String),
    #[error("{pool}: job '{job}' (pid {pid}) failed: {status}")]
    WorkerFailure {
        pool: String,
        job: String,
        pid: i32,
        status: String,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn io<P: Into<PathBuf>>(path: P, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
