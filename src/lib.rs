//! Site backups: create archives, retire old ones, and restore them onto the
//! live tree with a bounded fallback.

pub mod archive;
pub mod archiver;
pub mod config;
pub mod error;
pub mod events;
pub mod mover;
pub mod paths;
pub mod providers;
pub mod restorer;
pub mod retention;

pub use archiver::Archiver;
pub use config::AppConfig;
pub use error::{BackupError, Result};
pub use events::{Event, Observer};
pub use mover::Mover;
pub use paths::{Archive, LocalBackups, StoragePaths};
pub use providers::{Containers, MirrorRef, StorageProvider};
pub use restorer::{LocatedArchive, RestoreOptions, RestoreOutcome, RestoreReport, Restorer};
pub use retention::Purge;
