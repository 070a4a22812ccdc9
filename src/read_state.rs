use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::PersistError;

/// Read markers older than this are eligible for eviction.
const RETENTION_DAYS: i64 = 60;
/// How often the eviction sweep runs (plus once at startup).
const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Durable map from mark-read identity to the time it was last marked or
/// re-seen. Absence of a key means unread; presence means read, whatever
/// the timestamp says - timestamps only drive eviction.
pub struct ReadStateStore {
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
    path: PathBuf,
}

impl ReadStateStore {
    /// Load the store from `path`. A missing file starts empty; an
    /// unparsable one is discarded with a warning rather than aborting
    /// startup.
    pub async fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(err) => {
                    warn!(%err, path = %path.display(), "read cache unparsable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            entries: RwLock::new(entries),
            path,
        }
    }

    pub async fn is_unread(&self, id: &str) -> bool {
        !self.entries.read().await.contains_key(id)
    }

    pub async fn mark_read(&self, id: &str) {
        self.entries.write().await.insert(id.to_owned(), Utc::now());
    }

    /// Reset the eviction clock for an id that is already marked read.
    /// Called during refresh for every identity still present in a feed,
    /// so markers for items still being served never age out. No-op for
    /// unread ids.
    pub async fn extend_life(&self, id: &str) {
        if let Some(timestamp) = self.entries.write().await.get_mut(id) {
            *timestamp = Utc::now();
        }
    }

    /// Drop every entry strictly older than `cutoff`. An entry stamped
    /// exactly at the cutoff is retained.
    pub async fn remove_older_than(&self, cutoff: DateTime<Utc>) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, timestamp| *timestamp >= cutoff);

        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "evicted stale read markers");
        }
    }

    /// Write the whole map to disk as one flat JSON object with RFC3339
    /// timestamp values.
    pub async fn persist(&self) -> Result<(), PersistError> {
        let entries = self.entries.read().await;
        let bytes = serde_json::to_vec(&*entries)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

/// Run the eviction sweep: once immediately, then every `SWEEP_INTERVAL`.
/// This is the only background mutation that runs on wall-clock time
/// rather than the poll schedule.
pub fn spawn_eviction(store: Arc<ReadStateStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - chrono::Duration::days(RETENTION_DAYS);
            store.remove_older_than(cutoff).await;
            if let Err(err) = store.persist().await {
                warn!(%err, "failed to persist read cache after eviction");
            }
        }
    })
}
