//! Error kinds shared by the backup pipelines.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// The archive codec could not write the destination, or a source file
    /// could not be read.
    #[error("Could not create backup file {}: {source}", path.display())]
    ArchiveCreation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not locate the backup file {0}")]
    ArchiveNotFound(String),

    /// Extraction or overlay failed part way. The live tree may be partially
    /// overlaid.
    #[error("Restore of {archive} failed: {source}")]
    RestoreIo {
        archive: String,
        #[source]
        source: io::Error,
    },

    #[error("Could not list mirror {container}/{folder}: {reason}")]
    RemoteListing {
        container: String,
        folder: String,
        reason: String,
    },

    #[error("Transfer of {path} with mirror {container} failed: {reason}")]
    RemoteTransfer {
        container: String,
        path: String,
        reason: String,
    },

    #[error("Could not delete backup {}: {source}", path.display())]
    PurgeDeletion {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unknown storage container: {0}")]
    UnknownContainer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BackupError {
    /// Whether this failure should trigger the restore fallback chain.
    ///
    /// A missing archive is an expected, already reported outcome and leaves
    /// the live tree untouched, so there is nothing to recover from.
    pub fn is_unexpected(&self) -> bool {
        !matches!(self, BackupError::ArchiveNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
