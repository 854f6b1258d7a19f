// Archive creation and purge integration tests

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use roost::archive::ArchiveFormat;
use roost::events::{Event, RecordingObserver};
use roost::providers::{LocalProvider, RemoteEntry, StorageProvider};
use roost::{Archiver, BackupError, Containers, LocalBackups, Purge, StoragePaths};
use tempfile::TempDir;

/// Creates `{a.txt: "1", b/c.txt: "2"}` under `<temp>/site`
fn create_site(temp: &TempDir) -> PathBuf {
    let site = temp.path().join("site");
    fs::create_dir_all(site.join("b")).unwrap();
    fs::write(site.join("a.txt"), "1").unwrap();
    fs::write(site.join("b/c.txt"), "2").unwrap();
    site
}

fn archiver(site: &Path, storage: &StoragePaths, observer: Arc<RecordingObserver>) -> Archiver {
    Archiver::new(site, storage.clone(), observer).with_identity("site", "1.0")
}

fn mirror_locations(container: &str, folder: &str) -> BTreeMap<String, String> {
    let mut locations = BTreeMap::new();
    locations.insert(container.to_string(), folder.to_string());
    locations
}

/// A mirror whose listing always fails
struct UnreachableProvider {
    lists: AtomicUsize,
}

#[async_trait]
impl StorageProvider for UnreachableProvider {
    async fn list(&self, _folder: &str) -> anyhow::Result<Vec<RemoteEntry>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("connection refused"))
    }

    async fn fetch(&self, _path: &str) -> anyhow::Result<Vec<u8>> {
        Err(anyhow::anyhow!("connection refused"))
    }

    async fn upload(&self, _: &str, _: &str, _: Vec<u8>, _: &str) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("connection refused"))
    }

    fn label(&self) -> &str {
        "unreachable"
    }
}

/// A mirror holding `basenames` that, while being listed, swaps the local
/// file at `blocked` for a directory so it cannot be deleted
struct BlockingProvider {
    basenames: Vec<String>,
    blocked: PathBuf,
}

#[async_trait]
impl StorageProvider for BlockingProvider {
    async fn list(&self, folder: &str) -> anyhow::Result<Vec<RemoteEntry>> {
        fs::remove_file(&self.blocked)?;
        fs::create_dir(&self.blocked)?;
        Ok(self
            .basenames
            .iter()
            .map(|basename| RemoteEntry {
                basename: basename.clone(),
                path: format!("{}/{}", folder, basename),
                size: 1,
                last_modified: None,
            })
            .collect())
    }

    async fn fetch(&self, _path: &str) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn upload(&self, _: &str, _: &str, _: Vec<u8>, _: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn label(&self) -> &str {
        "blocking"
    }
}

/// Test the archive name and its entries for a known tree
#[test]
fn test_archive_contains_site_entries() {
    let temp = TempDir::new().unwrap();
    let site = create_site(&temp);
    let storage = StoragePaths::new(temp.path().join("storage"));
    let observer = RecordingObserver::new();

    let archive = archiver(&site, &storage, observer.clone())
        .create_archive()
        .unwrap();

    assert!(archive.name.starts_with("site-1.0-"));
    assert!(archive.name.ends_with(".zip"));
    assert_eq!(archive.path.parent(), Some(storage.backups_dir().as_path()));
    assert!(storage.restores_dir().is_dir());

    let out = temp.path().join("extracted");
    let count = ArchiveFormat::Zip
        .codec(None)
        .extract(&archive.path, &out)
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(fs::read_to_string(out.join("a.txt")).unwrap(), "1");
    assert_eq!(fs::read_to_string(out.join("b/c.txt")).unwrap(), "2");

    assert_eq!(
        observer.names(),
        vec!["backupStarted", "puttingFile", "puttingFile", "backupCreated"]
    );
    assert_eq!(
        observer.events().last(),
        Some(&Event::BackupCreated {
            destination: archive.path.clone()
        })
    );
}

/// Test two immediate invocations produce two distinct archives
#[test]
fn test_immediate_invocations_are_unique() {
    let temp = TempDir::new().unwrap();
    let site = create_site(&temp);
    let storage = StoragePaths::new(temp.path().join("storage"));
    let archiver = archiver(&site, &storage, RecordingObserver::new());

    let first = archiver.create_archive().unwrap();
    let second = archiver.create_archive().unwrap();

    assert_ne!(first.name, second.name);
    assert!(first.path.exists());
    assert!(second.path.exists());
    assert!(second.timestamp > first.timestamp);

    let listed = storage.local_backups().list().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[1].name, second.name);
}

/// Test configured source folders limit what is archived
#[test]
fn test_source_paths_limit_archive() {
    let temp = TempDir::new().unwrap();
    let site = create_site(&temp);
    let storage = StoragePaths::new(temp.path().join("storage"));
    let mut archiver = archiver(&site, &storage, RecordingObserver::new());
    archiver.set_source_paths(["b"]);

    let archive = archiver.create_archive().unwrap();
    let out = temp.path().join("extracted");
    ArchiveFormat::Zip.codec(None).extract(&archive.path, &out).unwrap();

    assert!(out.join("b/c.txt").exists());
    assert!(!out.join("a.txt").exists());
}

/// Test the tar.zst format produces a listed archive
#[test]
fn test_tar_zst_archive() {
    let temp = TempDir::new().unwrap();
    let site = create_site(&temp);
    let storage = StoragePaths::new(temp.path().join("storage"));
    let archive = archiver(&site, &storage, RecordingObserver::new())
        .with_format(ArchiveFormat::TarZst, Some(9))
        .create_archive()
        .unwrap();

    assert!(archive.name.ends_with(".tar.zst"));
    assert_eq!(storage.local_backups().most_recent().unwrap(), Some(archive));
}

/// Test bootstrapping leaves existing backups and staging content untouched
#[test]
fn test_directory_bootstrap_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let site = create_site(&temp);
    let storage = StoragePaths::new(temp.path().join("storage"));
    storage.ensure().unwrap();
    fs::write(storage.backups_dir().join("notes.txt"), "keep").unwrap();
    fs::create_dir_all(storage.restores_dir().join("other")).unwrap();

    archiver(&site, &storage, RecordingObserver::new())
        .create_archive()
        .unwrap();

    assert_eq!(
        fs::read_to_string(storage.backups_dir().join("notes.txt")).unwrap(),
        "keep"
    );
    assert!(storage.restores_dir().join("other").is_dir());
}

/// Test a fresh archive survives an immediate purge with no mirrors
#[tokio::test]
async fn test_fresh_archive_is_not_purged() {
    let temp = TempDir::new().unwrap();
    let site = create_site(&temp);
    let storage = StoragePaths::new(temp.path().join("storage"));
    let archive = archiver(&site, &storage, RecordingObserver::new())
        .create_archive()
        .unwrap();

    let observer = RecordingObserver::new();
    let mut purge = Purge::new(storage.local_backups(), Containers::new(), observer.clone());
    purge.set_max_age_days(30);
    let purged = purge.purge().await.unwrap();

    assert!(purged.is_empty());
    assert!(archive.path.exists());
    assert_eq!(
        observer.events(),
        vec![Event::PurgingStarted { count: 0 }, Event::PurgingComplete]
    );
}

/// Test the retention boundary is inclusive
#[tokio::test]
async fn test_retention_boundary() {
    let temp = TempDir::new().unwrap();
    let site = create_site(&temp);
    let storage = StoragePaths::new(temp.path().join("storage"));
    let archive = archiver(&site, &storage, RecordingObserver::new())
        .create_archive()
        .unwrap();

    let mut purge = Purge::new(
        storage.local_backups(),
        Containers::new(),
        RecordingObserver::new(),
    );
    purge.set_max_age_days(30);

    let one_day_younger = archive.created_at + Duration::days(29);
    assert!(purge.candidates(one_day_younger).await.unwrap().is_empty());
    assert!(purge.purge_at(one_day_younger).await.unwrap().is_empty());
    assert!(archive.path.exists());

    let exactly_max_age = archive.created_at + Duration::days(30);
    let purged = purge.purge_at(exactly_max_age).await.unwrap();
    assert_eq!(purged.len(), 1);
    assert_eq!(purged[0].name, archive.name);
    assert!(!archive.path.exists());
}

/// Test a young archive already present on a mirror is purged locally only
#[tokio::test]
async fn test_mirrored_archive_is_purged() {
    let temp = TempDir::new().unwrap();
    let site = create_site(&temp);
    let storage = StoragePaths::new(temp.path().join("storage"));
    let mirrored = archiver(&site, &storage, RecordingObserver::new())
        .create_archive()
        .unwrap();
    let local_only = archiver(&site, &storage, RecordingObserver::new())
        .create_archive()
        .unwrap();

    let nas = temp.path().join("nas");
    fs::create_dir_all(nas.join("backups")).unwrap();
    fs::copy(&mirrored.path, nas.join("backups").join(&mirrored.name)).unwrap();

    let mut containers = Containers::new();
    containers.insert("nas", Arc::new(LocalProvider::new(&nas)));
    let observer = RecordingObserver::new();
    let mut purge = Purge::new(storage.local_backups(), containers, observer.clone());
    purge.set_mirror_locations(&mirror_locations("nas", "backups"));

    let purged = purge.purge().await.unwrap();

    assert_eq!(purged.len(), 1);
    assert!(!mirrored.path.exists());
    assert!(local_only.path.exists());
    assert!(nas.join("backups").join(&mirrored.name).exists());
    assert_eq!(
        observer.names(),
        vec![
            "purgingStarted",
            "purgingFileStarted",
            "purgingFileComplete",
            "purgingComplete"
        ]
    );
}

/// Test an unreachable mirror does not stop the other mirrors or the age check
#[tokio::test]
async fn test_unreachable_mirror_is_treated_as_empty() {
    let temp = TempDir::new().unwrap();
    let backups_dir = temp.path().join("backups");
    fs::create_dir_all(&backups_dir).unwrap();
    fs::write(backups_dir.join("site-1.0-100.zip"), b"a").unwrap();
    fs::write(backups_dir.join("site-1.0-200.zip"), b"b").unwrap();

    let nas = temp.path().join("nas");
    fs::create_dir_all(nas.join("site")).unwrap();
    fs::write(nas.join("site/site-1.0-200.zip"), b"b").unwrap();

    let unreachable = Arc::new(UnreachableProvider {
        lists: AtomicUsize::new(0),
    });
    let mut containers = Containers::new();
    containers.insert("broken", unreachable.clone());
    containers.insert("nas", Arc::new(LocalProvider::new(&nas)));

    let mut locations = mirror_locations("broken", "site");
    locations.insert("nas".to_string(), "site".to_string());

    let backups = LocalBackups::new(&backups_dir);
    let mut purge = Purge::new(backups.clone(), containers, RecordingObserver::new());
    purge.set_mirror_locations(&locations);

    let purged = purge.purge().await.unwrap();

    assert_eq!(unreachable.lists.load(Ordering::SeqCst), 1);
    let names: Vec<_> = purged.into_iter().map(|a| a.name).collect();
    assert_eq!(names, vec!["site-1.0-200.zip"]);
    assert!(backups_dir.join("site-1.0-100.zip").exists());
}

/// Test an archive both expired and mirrored is deleted once
#[tokio::test]
async fn test_union_does_not_duplicate() {
    let temp = TempDir::new().unwrap();
    let site = create_site(&temp);
    let storage = StoragePaths::new(temp.path().join("storage"));
    let archive = archiver(&site, &storage, RecordingObserver::new())
        .create_archive()
        .unwrap();

    let nas = temp.path().join("nas");
    fs::create_dir_all(&nas).unwrap();
    fs::copy(&archive.path, nas.join(&archive.name)).unwrap();

    let mut containers = Containers::new();
    containers.insert("nas", Arc::new(LocalProvider::new(&nas)));
    let observer = RecordingObserver::new();
    let mut purge = Purge::new(storage.local_backups(), containers, observer.clone());
    purge.set_mirror_locations(&mirror_locations("nas", ""));
    purge.set_max_age_days(1);

    let purged = purge
        .purge_at(archive.created_at + Duration::days(2))
        .await
        .unwrap();

    assert_eq!(purged.len(), 1);
    assert_eq!(observer.count("purgingFileComplete"), 1);
}

/// Test the first failed deletion stops the purge after earlier deletions
#[tokio::test]
async fn test_failed_deletion_aborts_purge() {
    let temp = TempDir::new().unwrap();
    let backups_dir = temp.path().join("backups");
    fs::create_dir_all(&backups_dir).unwrap();
    fs::write(backups_dir.join("site-1.0-100.zip"), b"a").unwrap();
    fs::write(backups_dir.join("site-1.0-200.zip"), b"b").unwrap();
    let blocked = backups_dir.join("site-1.0-200.zip");

    let mut containers = Containers::new();
    containers.insert(
        "nas",
        Arc::new(BlockingProvider {
            basenames: vec!["site-1.0-100.zip".into(), "site-1.0-200.zip".into()],
            blocked: blocked.clone(),
        }),
    );
    let observer = RecordingObserver::new();
    let mut purge = Purge::new(LocalBackups::new(&backups_dir), containers, observer.clone());
    purge.set_mirror_locations(&mirror_locations("nas", "site"));

    let result = purge.purge().await;

    match result {
        Err(BackupError::PurgeDeletion { path, .. }) => assert_eq!(path, blocked),
        other => panic!("expected a deletion failure, got {:?}", other),
    }
    assert!(!backups_dir.join("site-1.0-100.zip").exists());
    assert!(blocked.is_dir());
    assert_eq!(
        observer.names(),
        vec![
            "purgingStarted",
            "purgingFileStarted",
            "purgingFileComplete",
            "purgingFileStarted"
        ]
    );
}

/// Test a dangling link in the backup directory does not block the purge
#[cfg(unix)]
#[tokio::test]
async fn test_dangling_link_does_not_block_purge() {
    let temp = TempDir::new().unwrap();
    let site = create_site(&temp);
    let storage = StoragePaths::new(temp.path().join("storage"));
    let archive = archiver(&site, &storage, RecordingObserver::new())
        .create_archive()
        .unwrap();
    std::os::unix::fs::symlink(
        temp.path().join("gone.zip"),
        storage.backups_dir().join("site-1.0-5.zip"),
    )
    .unwrap();

    let mut purge = Purge::new(
        storage.local_backups(),
        Containers::new(),
        RecordingObserver::new(),
    );
    purge.set_max_age_days(1);

    let purged = purge
        .purge_at(archive.created_at + Duration::days(1))
        .await
        .unwrap();

    let names: Vec<_> = purged.into_iter().map(|a| a.name).collect();
    assert_eq!(names, vec![archive.name]);
}
