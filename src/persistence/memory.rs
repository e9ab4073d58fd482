use super::{Snapshot, SnapshotStore};
use crate::Result;
use async_trait::async_trait;
use std::sync::Mutex;

/// Keeps the latest snapshot in memory. Used by backtests and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    latest: Mutex<Option<Snapshot>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            latest: Mutex::new(Some(snapshot)),
            saves: Mutex::new(0),
        }
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|n| *n).unwrap_or(0)
    }

    pub fn latest(&self) -> Option<Snapshot> {
        self.latest.lock().ok().and_then(|s| s.clone())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.latest.lock().map_err(|_| "memory store poisoned")?.clone())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.latest.lock().map_err(|_| "memory store poisoned")? = Some(snapshot.clone());
        *self.saves.lock().map_err(|_| "memory store poisoned")? += 1;
        Ok(())
    }
}
