//! Builds one archive of the site tree into the local backup directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::archive::{ArchiveCodec, ArchiveFormat};
use crate::config::AppConfig;
use crate::error::{BackupError, Result};
use crate::events::{Event, Observer};
use crate::paths::{Archive, ArchiveName, StoragePaths};

const PARTIAL_SUFFIX: &str = ".partial";

pub struct Archiver {
    site_root: PathBuf,
    storage: StoragePaths,
    product: String,
    version: String,
    format: ArchiveFormat,
    codec: Box<dyn ArchiveCodec>,
    source_paths: Vec<PathBuf>,
    observer: Arc<dyn Observer>,
}

/// A file to archive and its name inside the archive.
struct SourceFile {
    path: PathBuf,
    entry_name: String,
}

impl Archiver {
    pub fn new(
        site_root: impl Into<PathBuf>,
        storage: StoragePaths,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let format = ArchiveFormat::default();
        Self {
            site_root: site_root.into(),
            storage,
            product: "site".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            format,
            codec: format.codec(None),
            source_paths: Vec::new(),
            observer,
        }
    }

    pub fn from_config(config: &AppConfig, observer: Arc<dyn Observer>) -> Self {
        let mut archiver = Self::new(&config.site_root, config.storage_paths(), observer)
            .with_identity(&config.product, &config.version)
            .with_format(config.archive_format, config.compression_level);
        archiver.set_source_paths(config.backup_folders.clone());
        archiver
    }

    /// Product and version embedded in archive names.
    pub fn with_identity(mut self, product: &str, version: &str) -> Self {
        self.product = product.to_string();
        self.version = version.to_string();
        self
    }

    pub fn with_format(mut self, format: ArchiveFormat, compression_level: Option<i32>) -> Self {
        self.format = format;
        self.codec = format.codec(compression_level);
        self
    }

    /// Paths to archive, relative to the site root. Empty means the whole
    /// site. Overlapping paths are walked independently.
    pub fn set_source_paths<P: Into<PathBuf>>(&mut self, paths: impl IntoIterator<Item = P>) {
        self.source_paths = paths.into_iter().map(Into::into).collect();
    }

    /// Writes a new archive and returns it. Nothing is left in the backup
    /// directory under the archive's name unless this succeeds.
    pub fn create_archive(&self) -> Result<Archive> {
        let backups_dir = self.storage.backups_dir();
        self.storage
            .ensure()
            .map_err(|e| creation_error(&backups_dir, e))?;

        let files = self.collect_files()?;
        self.observer.notify(&Event::BackupStarted {
            file_count: files.len(),
        });

        let destination = self.next_destination(&backups_dir);
        let partial = partial_path(&destination);
        if let Err(e) = self.write_archive(&files, &partial, &destination) {
            if partial.exists() {
                // The write already failed; the partial file is never listed.
                let _ = fs::remove_file(&partial);
            }
            return Err(e);
        }
        fs::rename(&partial, &destination).map_err(|e| BackupError::ArchiveCreation {
            path: destination.clone(),
            source: e,
        })?;

        info!("Created backup: {}", destination.display());
        self.observer.notify(&Event::BackupCreated {
            destination: destination.clone(),
        });

        Archive::from_path(destination.clone())?.ok_or_else(|| BackupError::ArchiveCreation {
            path: destination,
            source: io::Error::new(io::ErrorKind::NotFound, "archive vanished after creation"),
        })
    }

    fn collect_files(&self) -> Result<Vec<SourceFile>> {
        let site_root = self
            .site_root
            .canonicalize()
            .map_err(|e| creation_error(&self.site_root, e))?;
        // Prior backups live here; never archive them again.
        let storage_root = self.storage.root().canonicalize().ok();

        let roots: Vec<PathBuf> = if self.source_paths.is_empty() {
            vec![site_root.clone()]
        } else {
            self.source_paths.iter().map(|p| site_root.join(p)).collect()
        };

        let mut files = Vec::new();
        for root in roots {
            let walker = WalkDir::new(&root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| Some(e.path()) != storage_root.as_deref());

            for entry in walker {
                let entry = entry.map_err(|e| {
                    let path = e.path().unwrap_or(&root).to_path_buf();
                    creation_error(&path, e.into())
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }

                let path = entry.into_path();
                let entry_name = entry_name(&site_root, &path)?;
                files.push(SourceFile { path, entry_name });
            }
        }

        Ok(files)
    }

    /// First free `<product>-<version>-<ts>.<ext>`, starting at now.
    fn next_destination(&self, backups_dir: &Path) -> PathBuf {
        let mut timestamp = Utc::now().timestamp();
        loop {
            let name = ArchiveName::new(&self.product, &self.version, timestamp, self.format);
            let candidate = backups_dir.join(name.file_name());
            if !candidate.exists() && !partial_path(&candidate).exists() {
                return candidate;
            }
            debug!("{} already exists", candidate.display());
            timestamp += 1;
        }
    }

    fn write_archive(&self, files: &[SourceFile], partial: &Path, destination: &Path) -> Result<()> {
        let mut writer = self
            .codec
            .create_writer(partial)
            .map_err(|e| creation_error(destination, e))?;

        for file in files {
            self.observer.notify(&Event::PuttingFile {
                path: file.path.clone(),
            });
            let contents = fs::read(&file.path).map_err(|e| creation_error(&file.path, e))?;
            writer
                .add_entry(&file.entry_name, &contents)
                .map_err(|e| creation_error(destination, e))?;
        }

        writer.finalize().map_err(|e| creation_error(destination, e))
    }
}

fn creation_error(path: &Path, source: io::Error) -> BackupError {
    BackupError::ArchiveCreation {
        path: path.to_path_buf(),
        source,
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// `/`-separated path of `path` relative to the site root.
fn entry_name(site_root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(site_root).map_err(|_| {
        creation_error(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "source path is outside the site root"),
        )
    })?;

    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullObserver, RecordingObserver};
    use tempfile::TempDir;

    fn site(temp: &TempDir) -> PathBuf {
        let root = temp.path().join("site");
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("a.txt"), "1").unwrap();
        fs::write(root.join("b/c.txt"), "2").unwrap();
        root
    }

    #[test]
    fn test_entry_names_are_relative_and_slash_separated() {
        let root = Path::new("/srv/site");
        assert_eq!(
            entry_name(root, &root.join("b").join("c.txt")).unwrap(),
            "b/c.txt"
        );
        assert!(entry_name(root, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_storage_root_inside_site_is_skipped() {
        let temp = TempDir::new().unwrap();
        let root = site(&temp);
        let storage = StoragePaths::new(root.join("storage"));
        storage.ensure().unwrap();
        fs::write(storage.backups_dir().join("site-1.0-1.zip"), b"old").unwrap();

        let observer = RecordingObserver::new();
        let archiver = Archiver::new(&root, storage, observer.clone()).with_identity("site", "1.0");
        archiver.create_archive().unwrap();

        assert_eq!(
            observer.events().first(),
            Some(&Event::BackupStarted { file_count: 2 })
        );
    }

    #[test]
    fn test_overlapping_source_paths_are_not_deduplicated() {
        let temp = TempDir::new().unwrap();
        let root = site(&temp);
        let observer = RecordingObserver::new();
        let mut archiver = Archiver::new(
            &root,
            StoragePaths::new(temp.path().join("storage")),
            observer.clone(),
        );
        archiver.set_source_paths(["b", "b/c.txt"]);
        archiver.create_archive().unwrap();

        assert_eq!(observer.count("puttingFile"), 2);
    }

    #[test]
    fn test_missing_source_path_fails_without_leftovers() {
        let temp = TempDir::new().unwrap();
        let root = site(&temp);
        let storage = StoragePaths::new(temp.path().join("storage"));
        let mut archiver = Archiver::new(&root, storage.clone(), Arc::new(NullObserver));
        archiver.set_source_paths(["does-not-exist"]);

        let result = archiver.create_archive();
        assert!(matches!(result, Err(BackupError::ArchiveCreation { .. })));
        assert_eq!(fs::read_dir(storage.backups_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/b/site-1.0-1.zip")),
            PathBuf::from("/b/site-1.0-1.zip.partial")
        );
    }
}
