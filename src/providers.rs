//! Remote mirrors.
//!
//! A mirror is a folder inside a named storage container. Containers are
//! configured once; `copy-backups` then maps container names to folders.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{primitives::ByteStream, Client as S3Client, Config};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::BackupError;

#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Files directly inside `folder`. Listings are flat.
    async fn list(&self, folder: &str) -> Result<Vec<RemoteEntry>>;
    /// Reads the file at `path`, as returned by `list`.
    async fn fetch(&self, path: &str) -> Result<Vec<u8>>;
    async fn upload(
        &self,
        folder: &str,
        basename: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<()>;
    /// Human readable name of the bucket, directory or account behind the
    /// provider.
    fn label(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub basename: String,
    pub path: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// `folder/basename` with stray separators removed.
pub fn join_key(folder: &str, basename: &str) -> String {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        basename.to_string()
    } else {
        format!("{}/{}", folder, basename)
    }
}

fn basename_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

// A directory on another filesystem (NFS share, USB disk, ...)
pub struct LocalProvider {
    root: PathBuf,
    label: String,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let label = root.display().to_string();
        Self { root, label }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    async fn list(&self, folder: &str) -> Result<Vec<RemoteEntry>> {
        let dir = self.resolve(folder);
        let mut items = Vec::new();
        if !dir.exists() {
            return Ok(items);
        }

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read folder: {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Some(basename) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            items.push(RemoteEntry {
                path: join_key(folder, &basename),
                basename,
                size: metadata.len(),
                last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        Ok(items)
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        let source = self.resolve(path);
        tokio::fs::read(&source)
            .await
            .with_context(|| format!("Failed to read file: {}", source.display()))
    }

    async fn upload(
        &self,
        folder: &str,
        basename: &str,
        data: Vec<u8>,
        _content_type: &str,
    ) -> Result<()> {
        let dir = self.resolve(folder);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create folder: {}", dir.display()))?;
        let target = dir.join(basename);
        tokio::fs::write(&target, data)
            .await
            .with_context(|| format!("Failed to write file: {}", target.display()))?;
        info!("Copied {} to {}", basename, dir.display());
        Ok(())
    }

    fn label(&self) -> &str {
        &self.label
    }
}

// S3-compatible provider (AWS S3, MinIO, Cloudflare R2, DigitalOcean Spaces, etc.)
pub struct S3Provider {
    client: S3Client,
    bucket: String,
}

impl S3Provider {
    pub async fn new(
        endpoint: &str,
        region: &str,
        bucket: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self> {
        use aws_credential_types::Credentials;
        let credentials = Credentials::new(access_key, secret_key, None, None, "roost");

        let s3_config = Config::builder()
            .endpoint_url(endpoint)
            .region(aws_sdk_s3::config::Region::new(region.to_string()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: S3Client::from_conf(s3_config),
            bucket: bucket.to_string(),
        })
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    async fn list(&self, folder: &str) -> Result<Vec<RemoteEntry>> {
        let prefix = join_key(folder, "");
        let mut items = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/");

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token.as_str());
            }

            let response = request.send().await.context("Failed to list S3 objects")?;

            for obj in response.contents() {
                let Some(key) = obj.key() else {
                    continue;
                };
                if key.ends_with('/') {
                    continue;
                }
                items.push(RemoteEntry {
                    basename: basename_of(key).to_string(),
                    path: key.to_string(),
                    size: obj.size().unwrap_or(0) as u64,
                    last_modified: obj
                        .last_modified()
                        .and_then(|dt| DateTime::from_timestamp(dt.secs(), 0)),
                });
            }

            continuation_token = response.next_continuation_token().map(|s| s.to_string());
            if response.is_truncated() != Some(true) {
                break;
            }
        }

        Ok(items)
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        info!("Downloading {} from S3...", path);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .with_context(|| format!("Failed to download from S3: {}", path))?;

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read S3 stream")?;
        Ok(data.into_bytes().to_vec())
    }

    async fn upload(
        &self,
        folder: &str,
        basename: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let key = join_key(folder, basename);
        info!("Uploading {} to S3...", key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|| format!("Failed to upload to S3: {}", key))?;

        info!("Successfully uploaded: {}", key);
        Ok(())
    }

    fn label(&self) -> &str {
        &self.bucket
    }
}

// Google Cloud Storage and Azure Blob Storage through the object_store crate
pub struct ObjectStoreProvider {
    store: Arc<dyn object_store::ObjectStore>,
    bucket: String,
}

impl ObjectStoreProvider {
    pub fn gcs(bucket: &str, credentials_path: Option<&str>) -> Result<Self> {
        use object_store::gcp::GoogleCloudStorageBuilder;

        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
        if let Some(cred_path) = credentials_path {
            builder = builder.with_service_account_path(cred_path);
        }

        let store = builder
            .build()
            .context("Failed to build GCS client. Ensure GOOGLE_APPLICATION_CREDENTIALS is set or credentials_path is provided.")?;

        Ok(Self {
            store: Arc::new(store),
            bucket: bucket.to_string(),
        })
    }

    pub fn azure(account_name: &str, account_key: Option<&str>, container: &str) -> Result<Self> {
        use object_store::azure::MicrosoftAzureBuilder;

        let access_key = match account_key {
            Some(key) => key.to_string(),
            None => std::env::var("AZURE_STORAGE_ACCOUNT_KEY").map_err(|_| {
                anyhow::anyhow!(
                    "Azure account_key required. Set it in config (as account_key) or use AZURE_STORAGE_ACCOUNT_KEY env var."
                )
            })?,
        };

        let store = MicrosoftAzureBuilder::new()
            .with_account(account_name)
            .with_container_name(container)
            .with_access_key(access_key)
            .build()
            .context("Failed to build Azure client. Ensure account_name and account_key are correct.")?;

        Ok(Self {
            store: Arc::new(store),
            bucket: container.to_string(),
        })
    }
}

#[async_trait]
impl StorageProvider for ObjectStoreProvider {
    async fn list(&self, folder: &str) -> Result<Vec<RemoteEntry>> {
        use object_store::path::Path as ObjectStorePath;

        let folder = folder.trim_matches('/');
        let prefix = (!folder.is_empty()).then(|| ObjectStorePath::from(folder));
        let listing = self
            .store
            .list_with_delimiter(prefix.as_ref())
            .await
            .with_context(|| format!("Failed to list {}/{}", self.bucket, folder))?;

        Ok(listing
            .objects
            .into_iter()
            .map(|meta| RemoteEntry {
                basename: meta.location.filename().unwrap_or_default().to_string(),
                path: meta.location.to_string(),
                size: meta.size,
                last_modified: Some(meta.last_modified),
            })
            .collect())
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        use object_store::path::Path as ObjectStorePath;

        info!("Downloading {} from {}...", path, self.bucket);
        let data = self
            .store
            .get(&ObjectStorePath::from(path))
            .await
            .with_context(|| format!("Failed to download: {}", path))?
            .bytes()
            .await
            .context("Failed to read object data")?;
        Ok(data.to_vec())
    }

    async fn upload(
        &self,
        folder: &str,
        basename: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        use object_store::path::Path as ObjectStorePath;
        use object_store::{Attribute, Attributes, PutOptions};

        let key = join_key(folder, basename);
        info!("Uploading {} to {}...", key, self.bucket);

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());
        let options = PutOptions {
            attributes,
            ..Default::default()
        };

        self.store
            .put_opts(&ObjectStorePath::from(key.as_str()), data.into(), options)
            .await
            .with_context(|| format!("Failed to upload: {}", key))?;

        info!("Successfully uploaded: {}", key);
        Ok(())
    }

    fn label(&self) -> &str {
        &self.bucket
    }
}

// Dropbox through its HTTP API. Folders are paths below an optional root.
pub struct DropboxProvider {
    access_token: String,
    root: String,
    client: reqwest::Client,
}

impl DropboxProvider {
    pub fn new(access_token: &str, root: Option<&str>) -> Self {
        Self {
            access_token: access_token.to_string(),
            root: root.unwrap_or("").trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn get_path(&self, key: &str) -> String {
        let key = key.trim_matches('/');
        match (self.root.is_empty(), key.is_empty()) {
            (true, true) => String::new(),
            (true, false) => format!("/{}", key),
            (false, true) => self.root.clone(),
            (false, false) => format!("{}/{}", self.root, key),
        }
    }
}

#[async_trait]
impl StorageProvider for DropboxProvider {
    async fn list(&self, folder: &str) -> Result<Vec<RemoteEntry>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let request = match &cursor {
                Some(cursor) => self
                    .client
                    .post("https://api.dropboxapi.com/2/files/list_folder/continue")
                    .json(&serde_json::json!({ "cursor": cursor })),
                None => self
                    .client
                    .post("https://api.dropboxapi.com/2/files/list_folder")
                    .json(&serde_json::json!({
                        "path": self.get_path(folder),
                        "recursive": false
                    })),
            };
            let response = request
                .bearer_auth(&self.access_token)
                .send()
                .await
                .context("Failed to list Dropbox files")?;

            if !response.status().is_success() {
                let error = response.text().await.unwrap_or_default();
                return Err(anyhow::anyhow!("Dropbox listing failed: {}", error));
            }

            let page: serde_json::Value = response.json().await?;
            for entry in page["entries"].as_array().into_iter().flatten() {
                if entry[".tag"].as_str() != Some("file") {
                    continue;
                }
                let Some(name) = entry["name"].as_str() else {
                    continue;
                };
                items.push(RemoteEntry {
                    basename: name.to_string(),
                    path: join_key(folder, name),
                    size: entry["size"].as_u64().unwrap_or(0),
                    last_modified: entry["client_modified"]
                        .as_str()
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|dt| dt.with_timezone(&Utc)),
                });
            }

            if page["has_more"].as_bool() != Some(true) {
                break;
            }
            cursor = page["cursor"].as_str().map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        Ok(items)
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        info!("Downloading {} from Dropbox...", path);
        let response = self
            .client
            .post("https://content.dropboxapi.com/2/files/download")
            .bearer_auth(&self.access_token)
            .header(
                "Dropbox-API-Arg",
                serde_json::json!({ "path": self.get_path(path) }).to_string(),
            )
            .send()
            .await
            .context("Failed to download from Dropbox")?;

        if !response.status().is_success() {
            let error = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Dropbox download failed: {}", error));
        }

        Ok(response.bytes().await?.to_vec())
    }

    async fn upload(
        &self,
        folder: &str,
        basename: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let path = self.get_path(&join_key(folder, basename));
        info!("Uploading {} to Dropbox...", path);
        // The content endpoint only accepts octet-stream bodies.
        debug!("Dropbox ignores content type {}", content_type);

        let response = self
            .client
            .post("https://content.dropboxapi.com/2/files/upload")
            .bearer_auth(&self.access_token)
            .header(
                "Dropbox-API-Arg",
                serde_json::json!({
                    "path": path,
                    "mode": "overwrite"
                })
                .to_string(),
            )
            .header("Content-Type", "application/octet-stream")
            .body(data)
            .send()
            .await
            .context("Failed to upload to Dropbox")?;

        if !response.status().is_success() {
            let error = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Dropbox upload failed: {}", error));
        }

        info!("Successfully uploaded: {}", path);
        Ok(())
    }

    fn label(&self) -> &str {
        "Dropbox"
    }
}

pub enum Provider {
    Local(LocalProvider),
    S3(S3Provider),
    ObjectStore(ObjectStoreProvider),
    Dropbox(DropboxProvider),
}

impl Provider {
    pub async fn from_config(config: &ContainerConfig) -> Result<Self> {
        match config.provider.as_str() {
            "local" | "filesystem" => {
                let path = config
                    .path
                    .as_ref()
                    .context("local container requires path")?;
                Ok(Provider::Local(LocalProvider::new(path)))
            }
            "s3" | "aws" | "minio" | "r2" | "digitalocean" | "wasabi" => {
                let region = config.region.as_deref().unwrap_or("us-east-1");
                let endpoint = match config.provider.as_str() {
                    "aws" => format!("https://s3.{}.amazonaws.com", region),
                    "digitalocean" => format!("https://{}.digitaloceanspaces.com", region),
                    "wasabi" => format!("https://s3.{}.wasabisys.com", region),
                    "r2" => format!(
                        "https://{}.r2.cloudflarestorage.com",
                        config
                            .account_id
                            .as_deref()
                            .context("R2 account_id required")?
                    ),
                    _ => config
                        .endpoint
                        .clone()
                        .context("S3 endpoint required")?,
                };

                let provider = S3Provider::new(
                    &endpoint,
                    region,
                    config.bucket.as_deref().context("S3 bucket required")?,
                    config.access_key.as_deref().unwrap_or_default(),
                    config.secret_key.as_deref().unwrap_or_default(),
                )
                .await?;
                Ok(Provider::S3(provider))
            }
            "gcs" | "google" => {
                let provider = ObjectStoreProvider::gcs(
                    config.bucket.as_deref().context("GCS bucket required")?,
                    config.credentials_path.as_deref(),
                )?;
                Ok(Provider::ObjectStore(provider))
            }
            "azure" => {
                let provider = ObjectStoreProvider::azure(
                    config
                        .account_name
                        .as_deref()
                        .context("Azure account_name required")?,
                    config.account_key.as_deref(),
                    config.bucket.as_deref().context("Azure container (bucket) required")?,
                )?;
                Ok(Provider::ObjectStore(provider))
            }
            "dropbox" => {
                let token = config
                    .access_token
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .context("Dropbox access_token required")?;
                Ok(Provider::Dropbox(DropboxProvider::new(
                    token,
                    config.root.as_deref(),
                )))
            }
            other => Err(anyhow::anyhow!("Unknown provider: {}", other)),
        }
    }
}

#[async_trait]
impl StorageProvider for Provider {
    async fn list(&self, folder: &str) -> Result<Vec<RemoteEntry>> {
        match self {
            Provider::Local(p) => p.list(folder).await,
            Provider::S3(p) => p.list(folder).await,
            Provider::ObjectStore(p) => p.list(folder).await,
            Provider::Dropbox(p) => p.list(folder).await,
        }
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        match self {
            Provider::Local(p) => p.fetch(path).await,
            Provider::S3(p) => p.fetch(path).await,
            Provider::ObjectStore(p) => p.fetch(path).await,
            Provider::Dropbox(p) => p.fetch(path).await,
        }
    }

    async fn upload(
        &self,
        folder: &str,
        basename: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        match self {
            Provider::Local(p) => p.upload(folder, basename, data, content_type).await,
            Provider::S3(p) => p.upload(folder, basename, data, content_type).await,
            Provider::ObjectStore(p) => p.upload(folder, basename, data, content_type).await,
            Provider::Dropbox(p) => p.upload(folder, basename, data, content_type).await,
        }
    }

    fn label(&self) -> &str {
        match self {
            Provider::Local(p) => p.label(),
            Provider::S3(p) => p.label(),
            Provider::ObjectStore(p) => p.label(),
            Provider::Dropbox(p) => p.label(),
        }
    }
}

/// One `[containers.<name>]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerConfig {
    pub provider: String,
    /// Root directory for `local`.
    pub path: Option<PathBuf>,
    /// Folder every `dropbox` key lives under.
    pub root: Option<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub account_id: Option<String>,
    pub account_name: Option<String>,
    pub account_key: Option<String>,
    pub credentials_path: Option<String>,
    pub access_token: Option<String>,
}

/// A (container, folder) pair an archive may be copied to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorRef {
    pub container: String,
    pub folder: String,
}

impl MirrorRef {
    pub fn new(container: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            folder: folder.into(),
        }
    }

    /// Mirrors from a `copy-backups` style map, in container name order.
    pub fn from_map(locations: &BTreeMap<String, String>) -> Vec<Self> {
        locations
            .iter()
            .map(|(container, folder)| Self::new(container, folder))
            .collect()
    }
}

/// Named storage containers.
#[derive(Clone, Default)]
pub struct Containers {
    providers: HashMap<String, Arc<dyn StorageProvider>>,
}

impl Containers {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_config(configs: &BTreeMap<String, ContainerConfig>) -> Result<Self> {
        let mut containers = Self::new();
        for (name, config) in configs {
            let provider = Provider::from_config(config)
                .await
                .with_context(|| format!("Failed to set up container {}", name))?;
            containers.insert(name, Arc::new(provider));
        }
        Ok(containers)
    }

    pub fn insert(&mut self, name: impl Into<String>, provider: Arc<dyn StorageProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn mirror(&self, reference: &MirrorRef) -> crate::Result<RemoteMirror> {
        let provider = self
            .providers
            .get(&reference.container)
            .cloned()
            .ok_or_else(|| BackupError::UnknownContainer(reference.container.clone()))?;
        Ok(RemoteMirror {
            reference: reference.clone(),
            provider,
        })
    }
}

/// A resolved mirror: the folder plus the provider serving its container.
#[derive(Clone)]
pub struct RemoteMirror {
    reference: MirrorRef,
    provider: Arc<dyn StorageProvider>,
}

impl RemoteMirror {
    pub fn reference(&self) -> &MirrorRef {
        &self.reference
    }

    pub fn container(&self) -> &str {
        &self.reference.container
    }

    pub fn label(&self) -> &str {
        self.provider.label()
    }

    pub async fn list(&self) -> crate::Result<Vec<RemoteEntry>> {
        self.provider
            .list(&self.reference.folder)
            .await
            .map_err(|e| BackupError::RemoteListing {
                container: self.reference.container.clone(),
                folder: self.reference.folder.clone(),
                reason: format!("{:#}", e),
            })
    }

    /// The entry named `basename`, if the folder holds one.
    pub async fn find(&self, basename: &str) -> crate::Result<Option<RemoteEntry>> {
        Ok(self.list().await?.into_iter().find(|e| e.basename == basename))
    }

    pub async fn contains(&self, basename: &str) -> crate::Result<bool> {
        Ok(self.find(basename).await?.is_some())
    }

    pub async fn fetch(&self, entry: &RemoteEntry) -> crate::Result<Vec<u8>> {
        self.provider
            .fetch(&entry.path)
            .await
            .map_err(|e| self.transfer_error(&entry.path, e))
    }

    pub async fn upload(
        &self,
        basename: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> crate::Result<()> {
        self.provider
            .upload(&self.reference.folder, basename, data, content_type)
            .await
            .map_err(|e| self.transfer_error(basename, e))
    }

    fn transfer_error(&self, path: &str, error: anyhow::Error) -> BackupError {
        BackupError::RemoteTransfer {
            container: self.reference.container.clone(),
            path: path.to_string(),
            reason: format!("{:#}", error),
        }
    }
}

/// Mirrors for every reference, skipping (with a warning) unknown containers.
pub fn resolve_mirrors(containers: &Containers, references: &[MirrorRef]) -> Vec<RemoteMirror> {
    references
        .iter()
        .filter_map(|reference| match containers.mirror(reference) {
            Ok(mirror) => Some(mirror),
            Err(e) => {
                warn!("Skipping mirror {}/{}: {}", reference.container, reference.folder, e);
                None
            }
        })
        .collect()
}
