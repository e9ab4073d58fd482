use super::{Snapshot, SnapshotStore};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Snapshot in a JSON file.
///
/// Writes go to a temp file that is renamed over the target, so a crash
/// mid-write never leaves a truncated file. Before each write the previous
/// file is copied to `{stem}_backup_{timestamp}.json`; only the newest
/// `max_backups` copies are kept.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    max_backups: usize,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            path: path.into(),
            max_backups,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bot_data".to_string())
    }

    fn directory(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn backup_prefix(&self) -> String {
        format!("{}_backup_", self.stem())
    }

    /// Backup files, newest first
    pub async fn backups(&self) -> Result<Vec<PathBuf>> {
        let prefix = self.backup_prefix();
        let mut found = Vec::new();

        let mut entries = match fs::read_dir(self.directory()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(".json") {
                found.push(entry.path());
            }
        }

        // timestamps sort lexicographically
        found.sort();
        found.reverse();
        Ok(found)
    }

    async fn create_backup(&self) -> Result<()> {
        if self.max_backups == 0 || fs::metadata(&self.path).await.is_err() {
            return Ok(());
        }

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let backup = self
            .directory()
            .join(format!("{}{}.json", self.backup_prefix(), stamp));
        fs::copy(&self.path, &backup).await?;

        for stale in self.backups().await?.into_iter().skip(self.max_backups) {
            if let Err(e) = fs::remove_file(&stale).await {
                tracing::warn!("Failed to remove old backup {}: {}", stale.display(), e);
            }
        }
        Ok(())
    }

    /// Parse and validate one snapshot file
    async fn read(path: &Path) -> Result<Snapshot> {
        let json = fs::read_to_string(path).await?;
        let snapshot: Snapshot = serde_json::from_str(&json)?;

        let problems = snapshot.problems();
        if !problems.is_empty() {
            return Err(format!("invalid snapshot: {}", problems.join("; ")).into());
        }
        Ok(snapshot)
    }

    /// Load the newest readable backup and restore it as the main file
    pub async fn recover_from_backup(&self) -> Result<Option<Snapshot>> {
        for backup in self.backups().await? {
            match Self::read(&backup).await {
                Ok(snapshot) => {
                    tracing::warn!("♻️  Recovered snapshot from {}", backup.display());
                    self.write_atomic(&snapshot).await?;
                    return Ok(Some(snapshot));
                }
                Err(e) => tracing::warn!("Unreadable backup {}: {}", backup.display(), e),
            }
        }
        Ok(None)
    }

    async fn write_atomic(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_string_pretty(snapshot)?;
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        fs::write(&temp, json).await?;
        fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        if fs::metadata(&self.path).await.is_err() {
            return Ok(None);
        }

        match Self::read(&self.path).await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::error!("Snapshot {} is unreadable: {}", self.path.display(), e);
                self.recover_from_backup().await
            }
        }
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Err(e) = self.create_backup().await {
            tracing::warn!("Backup before save failed: {}", e);
        }
        self.write_atomic(snapshot).await
    }
}
