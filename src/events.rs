//! Progress events emitted by the pipelines.
//!
//! Components never print. They hand an [`Event`] to the [`Observer`] they
//! were constructed with, and the embedding layer decides how to show it.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    // Archiver
    BackupStarted { file_count: usize },
    PuttingFile { path: PathBuf },
    BackupCreated { destination: PathBuf },

    // Retention
    PurgingStarted { count: usize },
    PurgingFileStarted { path: PathBuf },
    PurgingFileComplete { path: PathBuf },
    PurgingComplete,

    // Restorer
    BackupFileSearchStarted { archive: String },
    FoundLocalBackupFile { path: PathBuf },
    FoundRemoteBackupFile { container: String, path: String },
    DownloadRemoteBackup { archive: String },
    DownloadRemoteBackupComplete { archive: String },
    RestoreStarted { file_count: usize },
    FileRestored { source: PathBuf, destination: PathBuf },
    RestoreComplete {
        archive: String,
        file_count: usize,
        restore_root: PathBuf,
    },
    RestoreCleanupStarted { directory: PathBuf },
    RestoreCleanupComplete { directory: PathBuf },
    RestoreFailed { archive: String, reason: String },

    // Mover
    MoveBackupStarted { path: PathBuf },
    MoveBackupComplete { path: PathBuf },

    Finished,
}

impl Event {
    /// Stable event name, identical to the serialized `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Event::BackupStarted { .. } => "backupStarted",
            Event::PuttingFile { .. } => "puttingFile",
            Event::BackupCreated { .. } => "backupCreated",
            Event::PurgingStarted { .. } => "purgingStarted",
            Event::PurgingFileStarted { .. } => "purgingFileStarted",
            Event::PurgingFileComplete { .. } => "purgingFileComplete",
            Event::PurgingComplete => "purgingComplete",
            Event::BackupFileSearchStarted { .. } => "backupFileSearchStarted",
            Event::FoundLocalBackupFile { .. } => "foundLocalBackupFile",
            Event::FoundRemoteBackupFile { .. } => "foundRemoteBackupFile",
            Event::DownloadRemoteBackup { .. } => "downloadRemoteBackup",
            Event::DownloadRemoteBackupComplete { .. } => "downloadRemoteBackupComplete",
            Event::RestoreStarted { .. } => "restoreStarted",
            Event::FileRestored { .. } => "fileRestored",
            Event::RestoreComplete { .. } => "restoreComplete",
            Event::RestoreCleanupStarted { .. } => "restoreCleanupStarted",
            Event::RestoreCleanupComplete { .. } => "restoreCleanupComplete",
            Event::RestoreFailed { .. } => "restoreFailed",
            Event::MoveBackupStarted { .. } => "moveBackupStarted",
            Event::MoveBackupComplete { .. } => "moveBackupComplete",
            Event::Finished => "finished",
        }
    }
}

/// Receives progress events from a pipeline.
pub trait Observer: Send + Sync {
    fn notify(&self, event: &Event);
}

impl<F> Observer for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn notify(&self, event: &Event) {
        self(event)
    }
}

/// Discards every event.
pub struct NullObserver;

impl Observer for NullObserver {
    fn notify(&self, _event: &Event) {}
}

/// Renders events as log records.
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn notify(&self, event: &Event) {
        match event {
            Event::BackupStarted { file_count } => {
                info!("Preparing to backup {} files...", file_count)
            }
            Event::PuttingFile { path } => tracing::debug!("Backing up {}", path.display()),
            Event::BackupCreated { destination } => {
                info!("Created {} backup file", destination.display())
            }
            Event::PurgingStarted { count } => {
                info!("Preparing to purge {} backup files...", count)
            }
            Event::PurgingFileStarted { .. } => {}
            Event::PurgingFileComplete { path } => info!("Purged {}", path.display()),
            Event::PurgingComplete => info!("Purged backup files"),
            Event::BackupFileSearchStarted { archive } => {
                info!("Looking for backup file {}...", archive)
            }
            Event::FoundLocalBackupFile { path } => {
                info!("Discovered {} on local server", path.display())
            }
            Event::FoundRemoteBackupFile { container, path } => {
                info!("Discovered {} on remote container {}", path, container)
            }
            Event::DownloadRemoteBackup { archive } => {
                info!("Starting to download remote {} backup...", archive)
            }
            Event::DownloadRemoteBackupComplete { archive } => {
                info!("Downloaded remote {} backup", archive)
            }
            Event::RestoreStarted { file_count } => {
                info!("Preparing to restore {} files...", file_count)
            }
            Event::FileRestored {
                source,
                destination,
            } => tracing::debug!(
                "Restored {} to {}",
                source.display(),
                destination.display()
            ),
            Event::RestoreComplete { archive, .. } => info!("Restored backup {}", archive),
            Event::RestoreCleanupStarted { directory } => {
                info!("Cleaning up restore files from {}...", directory.display())
            }
            Event::RestoreCleanupComplete { .. } => info!("Restore cleanup complete"),
            Event::RestoreFailed { archive, reason } => {
                error!("Restoration of {} failed: {}", archive, reason)
            }
            Event::MoveBackupStarted { path } => {
                info!("Starting to move {} backup file...", path.display())
            }
            Event::MoveBackupComplete { path } => {
                info!("Finished moving {} backup file", path.display())
            }
            Event::Finished => info!("Finished"),
        }
    }
}

/// Writes one JSON object per event, newline delimited.
pub struct JsonObserver<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonObserver<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl<W: Write + Send> Observer for JsonObserver<W> {
    fn notify(&self, event: &Event) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        if let Ok(mut out) = self.out.lock() {
            // A closed stdout must not abort a restore half way.
            let _ = writeln!(out, "{}", line);
        }
    }
}

/// Keeps every event in memory. Useful for embedding and for tests.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Event>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(Event::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }
}

impl Observer for RecordingObserver {
    fn notify(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
