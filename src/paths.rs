//! Storage layout and the local backup listing shared by purge and restore.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::archive::ArchiveFormat;
use crate::error::Result;

const BACKUPS_DIR: &str = "backups";
const RESTORES_DIR: &str = "restores";

/// `<storage-root>/backups` and `<storage-root>/restores`.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(BACKUPS_DIR)
    }

    pub fn restores_dir(&self) -> PathBuf {
        self.root.join(RESTORES_DIR)
    }

    /// Staging directory for one archive: its name minus the archive extension.
    pub fn staging_dir(&self, archive_name: &str) -> PathBuf {
        self.restores_dir()
            .join(ArchiveFormat::strip_extension(archive_name))
    }

    /// Creates both directories. A no-op when they already exist.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(self.backups_dir())?;
        fs::create_dir_all(self.restores_dir())?;
        Ok(())
    }

    pub fn local_backups(&self) -> LocalBackups {
        LocalBackups::new(self.backups_dir())
    }
}

/// Parts of an archive file name: `<product>-<version>-<unix-seconds>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveName {
    pub product: String,
    pub version: String,
    pub timestamp: i64,
    pub format: ArchiveFormat,
}

impl ArchiveName {
    pub fn new(product: &str, version: &str, timestamp: i64, format: ArchiveFormat) -> Self {
        Self {
            product: product.to_string(),
            version: version.to_string(),
            timestamp,
            format,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}.{}",
            self.product,
            self.version,
            self.timestamp,
            self.format.extension()
        )
    }

    /// Splits a file name back into its parts. The product may itself contain
    /// dashes; the version is the segment right before the timestamp.
    pub fn parse(file_name: &str) -> Option<Self> {
        let format = ArchiveFormat::from_file_name(file_name)?;
        let stem = ArchiveFormat::strip_extension(file_name);
        let (rest, timestamp) = stem.rsplit_once('-')?;
        let timestamp = timestamp.parse::<i64>().ok()?;
        let (product, version) = rest.rsplit_once('-')?;
        if product.is_empty() || version.is_empty() {
            return None;
        }
        Some(Self::new(product, version, timestamp, format))
    }
}

/// A backup archive present in the local backup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub name: String,
    pub path: PathBuf,
    /// File modification time.
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Timestamp embedded in the file name, when it follows the naming scheme.
    pub timestamp: Option<i64>,
}

impl Archive {
    pub(crate) fn from_path(path: PathBuf) -> Result<Option<Self>> {
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            return Ok(None);
        };
        if ArchiveFormat::from_file_name(&name).is_none() {
            return Ok(None);
        }
        let metadata = fs::metadata(&path)?;
        if !metadata.is_file() {
            return Ok(None);
        }
        let created_at: DateTime<Utc> = metadata.modified()?.into();
        let timestamp = ArchiveName::parse(&name).map(|n| n.timestamp);

        Ok(Some(Self {
            name,
            path,
            created_at,
            size_bytes: metadata.len(),
            timestamp,
        }))
    }

    /// Whole days since the archive was written. Never negative.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days().max(0)
    }
}

fn by_creation(a: &Archive, b: &Archive) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then(a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.name.cmp(&b.name))
}

/// Reads the local backup directory. Every call lists the directory afresh.
#[derive(Debug, Clone)]
pub struct LocalBackups {
    dir: PathBuf,
}

impl LocalBackups {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All archives, oldest first. Ordered by modification time, then by the
    /// timestamp in the name, then by name.
    pub fn list(&self) -> Result<Vec<Archive>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut archives = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!("Skipping unreadable entry in {}: {}", self.dir.display(), e);
                    continue;
                }
            };
            match Archive::from_path(path.clone()) {
                Ok(Some(archive)) => archives.push(archive),
                Ok(None) => {}
                // A dangling link or unreadable file must not hide the others.
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }

        archives.sort_by(by_creation);
        Ok(archives)
    }

    pub fn find(&self, name: &str) -> Result<Option<Archive>> {
        Ok(self.list()?.into_iter().find(|a| a.name == name))
    }

    pub fn most_recent(&self) -> Result<Option<Archive>> {
        Ok(self.list()?.pop())
    }
}
