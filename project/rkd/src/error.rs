use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("failed to lock {}: {source}", .path.display())]
    LockAcquisition {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read bundle {name}: {reason}")]
    PayloadRead { name: String, reason: String },

    #[error("failed to extract bundle into {}: {source}", .path.display())]
    Extraction {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("bundle in {} failed verification: {reason}", .path.display())]
    Verification { path: PathBuf, reason: String },

    #[error("failed to publish {}: {source}", .path.display())]
    Publish {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{command}: executable file not found in search path")]
    CommandResolution { command: String },

    #[error("invalid argument {0:?}")]
    InvalidArgument(String),

    #[error("failed to exec {}: {source}", .path.display())]
    Exec {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
