//! `roost.toml` configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::archive::ArchiveFormat;
use crate::paths::StoragePaths;
use crate::providers::{ContainerConfig, MirrorRef};

pub const DEFAULT_CONFIG_FILE: &str = "roost.toml";
pub const DEFAULT_MAX_AGE_DAYS: u32 = 30;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// The live tree that gets archived and restored onto.
    pub site_root: PathBuf,
    /// Holds `backups/` and `restores/`.
    pub storage_root: PathBuf,
    pub product: String,
    pub version: String,
    pub archive_format: ArchiveFormat,
    pub compression_level: Option<i32>,
    /// Paths below `site_root` to archive. Empty archives the whole site.
    #[serde(rename = "backup-folders")]
    pub backup_folders: Vec<PathBuf>,
    /// Container name to folder.
    #[serde(rename = "copy-backups")]
    pub copy_backups: BTreeMap<String, String>,
    #[serde(rename = "remove-backups")]
    pub remove_backups: RemoveBackupsConfig,
    pub containers: BTreeMap<String, ContainerConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoveBackupsConfig {
    #[serde(rename = "after-days")]
    pub after_days: u32,
}

impl Default for RemoveBackupsConfig {
    fn default() -> Self {
        Self {
            after_days: DEFAULT_MAX_AGE_DAYS,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            site_root: PathBuf::from("."),
            storage_root: PathBuf::from("./storage"),
            product: "site".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            archive_format: ArchiveFormat::default(),
            compression_level: None,
            backup_folders: Vec::new(),
            copy_backups: BTreeMap::new(),
            remove_backups: RemoveBackupsConfig::default(),
            containers: BTreeMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads a config file. Relative roots and local container paths
    /// resolve against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_against(base);
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.product.is_empty() || self.version.is_empty() {
            anyhow::bail!("product and version must not be empty");
        }
        for container in self.copy_backups.keys() {
            if !self.containers.contains_key(container) {
                anyhow::bail!(
                    "copy-backups names container {} but no [containers.{}] table exists",
                    container,
                    container
                );
            }
        }
        Ok(())
    }

    fn resolve_against(&mut self, base: &Path) {
        if self.site_root.is_relative() {
            self.site_root = base.join(&self.site_root);
        }
        if self.storage_root.is_relative() {
            self.storage_root = base.join(&self.storage_root);
        }
        for container in self.containers.values_mut() {
            if !matches!(container.provider.as_str(), "local" | "filesystem") {
                continue;
            }
            if let Some(path) = container.path.as_mut().filter(|p| p.is_relative()) {
                *path = base.join(&*path);
            }
        }
    }

    pub fn storage_paths(&self) -> StoragePaths {
        StoragePaths::new(&self.storage_root)
    }

    pub fn mirrors(&self) -> Vec<MirrorRef> {
        MirrorRef::from_map(&self.copy_backups)
    }
}

const EXAMPLE_CONFIG: &str = r#"# roost configuration

# The live site tree. Relative paths resolve against this file's directory.
site_root = "."

# Holds backups/ and restores/. Kept out of archives when inside site_root.
storage_root = "./storage"

# Archive names look like <product>-<version>-<unix-seconds>.<ext>
product = "site"
version = "1.0"

# "zip" or "tar.zst"
archive_format = "zip"
# compression_level = 3  # tar.zst only, 0-22

# Folders below site_root to archive. Empty archives the whole site.
backup-folders = [
    # "content",
    # "public/assets",
]

# Copy every new backup to these container folders. A local backup already
# present in any of them is purged regardless of age.
[copy-backups]
# offsite = "backups/site"

[remove-backups]
after-days = 30

# Storage containers referenced by copy-backups.
# Provider: local, s3, aws, minio, r2, digitalocean, wasabi, gcs, google, azure, dropbox

# [containers.nas]
# provider = "local"
# path = "/mnt/nas"

# [containers.offsite]
# provider = "s3"
# endpoint = "https://s3.amazonaws.com"
# region = "us-east-1"
# bucket = "your-bucket-name"
# access_key = "your-access-key"
# secret_key = "your-secret-key"

# [containers.gcs]
# provider = "gcs"
# bucket = "my-backups"
# credentials_path = "/path/to/service-account-key.json"  # Optional: uses GOOGLE_APPLICATION_CREDENTIALS env var if not set

# [containers.azure]
# provider = "azure"
# account_name = "your-account-name"
# account_key = "your-account-key"  # Optional: can also use AZURE_STORAGE_ACCOUNT_KEY env var
# bucket = "my-container"

# [containers.dropbox]
# provider = "dropbox"
# access_token = "sl.Bk..."
# root = "/Backups"

[logging]
level = "info"
"#;

/// Writes a commented example configuration to `output_path`.
pub fn generate_example_config(output_path: impl AsRef<Path>) -> Result<()> {
    let output_path = output_path.as_ref();
    fs::write(output_path, EXAMPLE_CONFIG)
        .with_context(|| format!("Failed to write config file: {}", output_path.display()))
}
