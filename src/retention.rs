//! Purge: retires local archives that are expired or already mirrored.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, DEFAULT_MAX_AGE_DAYS};
use crate::error::{BackupError, Result};
use crate::events::{Event, Observer};
use crate::paths::{Archive, LocalBackups};
use crate::providers::{resolve_mirrors, Containers, MirrorRef};

pub struct Purge {
    backups: LocalBackups,
    containers: Containers,
    mirrors: Vec<MirrorRef>,
    max_age_days: i64,
    observer: Arc<dyn Observer>,
}

impl Purge {
    pub fn new(backups: LocalBackups, containers: Containers, observer: Arc<dyn Observer>) -> Self {
        Self {
            backups,
            containers,
            mirrors: Vec::new(),
            max_age_days: i64::from(DEFAULT_MAX_AGE_DAYS),
            observer,
        }
    }

    pub fn from_config(
        config: &AppConfig,
        containers: Containers,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let mut purge = Self::new(config.storage_paths().local_backups(), containers, observer);
        purge.set_mirror_locations(&config.copy_backups);
        purge.set_max_age_days(config.remove_backups.after_days);
        purge
    }

    /// Container name to folder.
    pub fn set_mirror_locations(&mut self, locations: &BTreeMap<String, String>) {
        self.mirrors = MirrorRef::from_map(locations);
    }

    pub fn set_max_age_days(&mut self, days: u32) {
        self.max_age_days = i64::from(days);
    }

    pub async fn purge(&self) -> Result<Vec<Archive>> {
        self.purge_at(Utc::now()).await
    }

    /// Deletes every candidate as of `now`, stopping at the first failed
    /// deletion. Remote copies are never touched.
    pub async fn purge_at(&self, now: DateTime<Utc>) -> Result<Vec<Archive>> {
        let candidates = self.candidates(now).await?;
        self.observer.notify(&Event::PurgingStarted {
            count: candidates.len(),
        });

        for archive in &candidates {
            self.observer.notify(&Event::PurgingFileStarted {
                path: archive.path.clone(),
            });
            fs::remove_file(&archive.path).map_err(|e| BackupError::PurgeDeletion {
                path: archive.path.clone(),
                source: e,
            })?;
            info!("Deleted old backup: {}", archive.name);
            self.observer.notify(&Event::PurgingFileComplete {
                path: archive.path.clone(),
            });
        }

        self.observer.notify(&Event::PurgingComplete);
        Ok(candidates)
    }

    /// Local archives at least `max_age_days` old, plus those present by
    /// basename in any mirror. Oldest first, each at most once.
    pub async fn candidates(&self, now: DateTime<Utc>) -> Result<Vec<Archive>> {
        let archives = self.backups.list()?;
        if archives.is_empty() {
            return Ok(archives);
        }
        let mirrored = self.mirrored_basenames().await;

        Ok(archives
            .into_iter()
            .filter(|archive| {
                let expired = archive.age_days(now) >= self.max_age_days;
                let copied = mirrored.contains(&archive.name);
                if expired || copied {
                    debug!(
                        "{} is a purge candidate (expired: {}, mirrored: {})",
                        archive.name, expired, copied
                    );
                }
                expired || copied
            })
            .collect())
    }

    async fn mirrored_basenames(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        for mirror in resolve_mirrors(&self.containers, &self.mirrors) {
            match mirror.list().await {
                Ok(entries) => names.extend(entries.into_iter().map(|e| e.basename)),
                // An unreachable mirror counts as empty.
                Err(e) => warn!("{}", e),
            }
        }
        names
    }
}
