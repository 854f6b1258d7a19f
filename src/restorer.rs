//! Restores an archive onto the live tree.
//!
//! A restore runs in four steps: locate the archive (local backup directory
//! first, then each mirror), extract it into a staging directory under
//! `<storage-root>/restores`, overlay every staged file onto the live root,
//! and remove the staging directory.
//!
//! The overlay copies files one at a time. A failure part way leaves the live
//! tree partially restored; [`Restorer::restore_with_options`] then falls
//! back to the most recent local archive, once.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::archive::ArchiveFormat;
use crate::archiver::Archiver;
use crate::config::AppConfig;
use crate::error::{BackupError, Result};
use crate::events::{Event, Observer};
use crate::mover::Mover;
use crate::paths::StoragePaths;
use crate::providers::{resolve_mirrors, Containers, MirrorRef, RemoteEntry};

/// Where the locate step found an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatedArchive {
    Local(PathBuf),
    Remote(MirrorRef, RemoteEntry),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub archive: String,
    pub file_count: usize,
    /// Whether the archive had to be downloaded from a mirror first.
    pub downloaded: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    /// Archive the live tree (and copy it to the mirrors) before restoring.
    pub pre_backup: bool,
    /// On an unexpected failure, restore the most recent local archive.
    pub fallback: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            pre_backup: true,
            fallback: true,
        }
    }
}

#[derive(Debug)]
pub enum RestoreOutcome {
    Restored(RestoreReport),
    /// The requested archive failed and the fallback archive was restored.
    Recovered {
        failed: String,
        cause: BackupError,
        report: RestoreReport,
    },
}

struct PreRestoreBackup {
    archiver: Archiver,
    mover: Mover,
}

pub struct Restorer {
    live_root: PathBuf,
    storage: StoragePaths,
    containers: Containers,
    mirrors: Vec<MirrorRef>,
    pre_backup: Option<PreRestoreBackup>,
    observer: Arc<dyn Observer>,
}

impl Restorer {
    pub fn new(
        live_root: impl Into<PathBuf>,
        storage: StoragePaths,
        containers: Containers,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            live_root: live_root.into(),
            storage,
            containers,
            mirrors: Vec::new(),
            pre_backup: None,
            observer,
        }
    }

    /// A restorer searching the `copy-backups` mirrors, with pre-restore
    /// backups built from the same configuration.
    pub fn from_config(
        config: &AppConfig,
        containers: Containers,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let archiver = Archiver::from_config(config, observer.clone());
        let mover = Mover::new(containers.clone(), observer.clone());
        let mut restorer = Self::new(
            &config.site_root,
            config.storage_paths(),
            containers,
            observer,
        )
        .with_pre_restore_backup(archiver, mover);
        restorer.set_remote_mirrors(&config.copy_backups);
        restorer
    }

    /// The archiver (and mover, for mirror copies) used for pre-restore
    /// backups. Without one, `pre_backup` is ignored.
    pub fn with_pre_restore_backup(mut self, archiver: Archiver, mover: Mover) -> Self {
        self.pre_backup = Some(PreRestoreBackup { archiver, mover });
        self
    }

    /// Container name to folder, searched in container name order.
    pub fn set_remote_mirrors(&mut self, locations: &BTreeMap<String, String>) {
        self.mirrors = MirrorRef::from_map(locations);
    }

    /// Restores `archive_name`. Every failure is reported as a
    /// `restoreFailed` event and returned.
    pub async fn restore(&self, archive_name: &str) -> Result<RestoreReport> {
        match self.try_restore(archive_name).await {
            Ok(report) => Ok(report),
            Err(e) => {
                error!("Restore of {} failed: {}", archive_name, e);
                self.observer.notify(&Event::RestoreFailed {
                    archive: archive_name.to_string(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Restore with the optional pre-restore backup and the bounded fallback.
    ///
    /// The fallback restores the most recent local archive with both options
    /// off, so it runs at most once. It is skipped when that archive is the
    /// one that just failed. When the fallback fails too, the first error is
    /// returned.
    pub async fn restore_with_options(
        &self,
        archive_name: &str,
        options: RestoreOptions,
    ) -> Result<RestoreOutcome> {
        if options.pre_backup {
            self.backup_before_restore().await?;
        }

        let cause = match self.restore(archive_name).await {
            Ok(report) => return Ok(RestoreOutcome::Restored(report)),
            Err(e) => e,
        };
        if !options.fallback || !cause.is_unexpected() {
            return Err(cause);
        }

        let candidate = match self.storage.local_backups().most_recent() {
            Ok(Some(candidate)) => candidate,
            Ok(None) => {
                warn!("No local backup to fall back to");
                return Err(cause);
            }
            Err(e) => {
                error!("Could not choose a backup to fall back to: {}", e);
                return Err(cause);
            }
        };
        if candidate.name == archive_name {
            warn!("{} is the most recent backup; not retrying it", archive_name);
            return Err(cause);
        }

        warn!("Falling back to {}", candidate.name);
        match self.restore(&candidate.name).await {
            Ok(report) => Ok(RestoreOutcome::Recovered {
                failed: archive_name.to_string(),
                cause,
                report,
            }),
            Err(fallback_error) => {
                error!("Fallback restore of {} failed: {}", candidate.name, fallback_error);
                Err(cause)
            }
        }
    }

    async fn backup_before_restore(&self) -> Result<()> {
        let Some(pre) = &self.pre_backup else {
            return Ok(());
        };
        info!("Creating a backup of the current site before restoring");
        let archive = pre.archiver.create_archive()?;
        let local_file = archive.path.to_string_lossy();
        pre.mover.move_to_all(&local_file, &self.mirrors).await
    }

    /// Finds `archive_name` locally, else by basename in the first mirror
    /// listing that holds it. Unreachable mirrors are skipped.
    pub async fn locate(&self, archive_name: &str) -> Result<Option<LocatedArchive>> {
        self.observer.notify(&Event::BackupFileSearchStarted {
            archive: archive_name.to_string(),
        });

        if let Some(archive) = self.storage.local_backups().find(archive_name)? {
            self.observer.notify(&Event::FoundLocalBackupFile {
                path: archive.path.clone(),
            });
            return Ok(Some(LocatedArchive::Local(archive.path)));
        }

        for mirror in resolve_mirrors(&self.containers, &self.mirrors) {
            let entry = match mirror.find(archive_name).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };
            if !is_plain_basename(&entry.basename) {
                warn!("Ignoring remote entry with unusable name: {}", entry.basename);
                continue;
            }
            self.observer.notify(&Event::FoundRemoteBackupFile {
                container: mirror.container().to_string(),
                path: entry.path.clone(),
            });
            return Ok(Some(LocatedArchive::Remote(mirror.reference().clone(), entry)));
        }

        Ok(None)
    }

    async fn try_restore(&self, archive_name: &str) -> Result<RestoreReport> {
        self.storage.ensure()?;

        let located = self
            .locate(archive_name)
            .await?
            .ok_or_else(|| BackupError::ArchiveNotFound(archive_name.to_string()))?;
        let downloaded = matches!(located, LocatedArchive::Remote(..));
        let archive_path = self.materialize(located).await?;

        let staging = self.storage.staging_dir(archive_name);
        let file_count = match self.extract_and_overlay(archive_name, &archive_path, &staging) {
            Ok(count) => count,
            Err(e) => {
                if staging.exists() {
                    if let Err(cleanup) = fs::remove_dir_all(&staging) {
                        warn!("Could not remove {}: {}", staging.display(), cleanup);
                    }
                }
                return Err(e);
            }
        };

        self.observer.notify(&Event::RestoreCleanupStarted {
            directory: staging.clone(),
        });
        fs::remove_dir_all(&staging).map_err(|e| restore_error(archive_name, e))?;
        self.observer
            .notify(&Event::RestoreCleanupComplete { directory: staging });

        Ok(RestoreReport {
            archive: archive_name.to_string(),
            file_count,
            downloaded,
        })
    }

    /// A local path for the located archive, downloading remote archives
    /// into the backup directory under their basename.
    async fn materialize(&self, located: LocatedArchive) -> Result<PathBuf> {
        let (reference, entry) = match located {
            LocatedArchive::Local(path) => return Ok(path),
            LocatedArchive::Remote(reference, entry) => (reference, entry),
        };

        self.observer.notify(&Event::DownloadRemoteBackup {
            archive: entry.basename.clone(),
        });
        let mirror = self.containers.mirror(&reference)?;
        let data = mirror.fetch(&entry).await?;

        let destination = self.storage.backups_dir().join(&entry.basename);
        let partial = destination.with_file_name(format!("{}.partial", entry.basename));
        let write = async {
            tokio::fs::write(&partial, &data).await?;
            tokio::fs::rename(&partial, &destination).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(restore_error(&entry.basename, e));
        }

        info!("Downloaded {} to {}", entry.path, destination.display());
        self.observer.notify(&Event::DownloadRemoteBackupComplete {
            archive: entry.basename,
        });
        Ok(destination)
    }

    fn extract_and_overlay(
        &self,
        archive_name: &str,
        archive_path: &Path,
        staging: &Path,
    ) -> Result<usize> {
        let fail = |e: io::Error| restore_error(archive_name, e);

        // Left behind by a crashed run.
        if staging.exists() {
            fs::remove_dir_all(staging).map_err(fail)?;
        }

        let format = ArchiveFormat::from_file_name(archive_name).ok_or_else(|| {
            fail(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported archive type",
            ))
        })?;
        format
            .codec(None)
            .extract(archive_path, staging)
            .map_err(fail)?;

        let mut staged = Vec::new();
        for entry in WalkDir::new(staging).sort_by_file_name() {
            let entry = entry.map_err(|e| fail(e.into()))?;
            if entry.file_type().is_file() {
                staged.push(entry.into_path());
            }
        }

        self.observer.notify(&Event::RestoreStarted {
            file_count: staged.len(),
        });

        for source in &staged {
            let relative = source.strip_prefix(staging).map_err(|_| {
                fail(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "staged file outside the staging directory",
                ))
            })?;
            let destination = self.live_root.join(relative);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).map_err(fail)?;
            }
            fs::copy(source, &destination).map_err(fail)?;
            self.observer.notify(&Event::FileRestored {
                source: source.clone(),
                destination,
            });
        }

        info!("Restored {} files from {}", staged.len(), archive_name);
        self.observer.notify(&Event::RestoreComplete {
            archive: archive_name.to_string(),
            file_count: staged.len(),
            restore_root: self.live_root.clone(),
        });
        Ok(staged.len())
    }
}

fn restore_error(archive: &str, source: io::Error) -> BackupError {
    BackupError::RestoreIo {
        archive: archive.to_string(),
        source,
    }
}

fn is_plain_basename(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_basename() {
        assert!(is_plain_basename("site-1.0-1.zip"));
        assert!(!is_plain_basename("../site-1.0-1.zip"));
        assert!(!is_plain_basename("a\\b.zip"));
        assert!(!is_plain_basename(".."));
        assert!(!is_plain_basename(""));
    }

    #[test]
    fn test_default_options_enable_both_safety_nets() {
        let options = RestoreOptions::default();
        assert!(options.pre_backup);
        assert!(options.fallback);
    }
}
