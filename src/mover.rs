//! Copies a local archive into a mirror folder.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{BackupError, Result};
use crate::events::{Event, Observer};
use crate::providers::{Containers, MirrorRef};

pub struct Mover {
    containers: Containers,
    observer: Arc<dyn Observer>,
}

impl Mover {
    pub fn new(containers: Containers, observer: Arc<dyn Observer>) -> Self {
        Self {
            containers,
            observer,
        }
    }

    /// Uploads `local_file` into `folder` of `container` under its own
    /// basename. Backslashes in `local_file` are treated as separators.
    pub async fn move_backup(&self, local_file: &str, container: &str, folder: &str) -> Result<()> {
        let normalized = local_file.replace('\\', "/");
        let path = PathBuf::from(&normalized);
        let basename = normalized
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| BackupError::Config(format!("{} does not name a file", local_file)))?;

        let mirror = self.containers.mirror(&MirrorRef::new(container, folder))?;
        self.observer
            .notify(&Event::MoveBackupStarted { path: path.clone() });

        let data = tokio::fs::read(&path).await?;
        let content_type = mime_guess::from_path(basename).first_or_octet_stream();
        mirror
            .upload(basename, data, content_type.essence_str())
            .await?;

        self.observer.notify(&Event::MoveBackupComplete { path });
        Ok(())
    }

    /// Uploads `local_file` to every mirror in turn.
    pub async fn move_to_all(&self, local_file: &str, mirrors: &[MirrorRef]) -> Result<()> {
        for mirror in mirrors {
            self.move_backup(local_file, &mirror.container, &mirror.folder)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingObserver;

    #[tokio::test]
    async fn test_unknown_container_emits_nothing() {
        let observer = RecordingObserver::new();
        let mover = Mover::new(Containers::new(), observer.clone());
        let result = mover.move_backup("site-1.0-1.zip", "offsite", "backups").await;
        assert!(matches!(result, Err(BackupError::UnknownContainer(_))));
        assert!(observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_directory_path_is_rejected() {
        let mover = Mover::new(Containers::new(), RecordingObserver::new());
        let result = mover.move_backup("backups\\", "offsite", "backups").await;
        assert!(matches!(result, Err(BackupError::Config(_))));
    }
}
