use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::config::{ConfigSection, FeedDefinition, FeedsFile};
use crate::error::PersistError;
use crate::feed::FeedEntry;
use crate::read_state::ReadStateStore;

/// Global content-change marker backing the HTTP Last-Modified /
/// If-Modified-Since cheap change detection. Bumped by feed refreshes,
/// mark-read actions, and collection mutations.
pub struct ChangeStamp(Mutex<DateTime<Utc>>);

impl ChangeStamp {
    pub fn new() -> Self {
        Self(Mutex::new(Utc::now()))
    }

    pub async fn touch(&self) {
        *self.0.lock().await = Utc::now();
    }

    pub async fn current(&self) -> DateTime<Utc> {
        *self.0.lock().await
    }
}

impl Default for ChangeStamp {
    fn default() -> Self {
        Self::new()
    }
}

/// The set of all subscribed feeds. Owns add/remove/lookup, persistence
/// of the feeds file, and starting/stopping each entry's poll loop.
///
/// Lock order: the collection lock is always taken before any entry's
/// own lock.
pub struct FeedCollection {
    entries: RwLock<Vec<Arc<FeedEntry>>>,
    config: ConfigSection,
    path: PathBuf,
    read_state: Arc<ReadStateStore>,
    changes: Arc<ChangeStamp>,
    client: Client,
}

impl FeedCollection {
    pub fn new(
        file: FeedsFile,
        path: impl Into<PathBuf>,
        read_state: Arc<ReadStateStore>,
        changes: Arc<ChangeStamp>,
        client: Client,
    ) -> Self {
        let entries = file
            .feeds
            .into_iter()
            .map(|definition| {
                Arc::new(FeedEntry::new(
                    definition,
                    read_state.clone(),
                    changes.clone(),
                    client.clone(),
                ))
            })
            .collect();

        Self {
            entries: RwLock::new(entries),
            config: file.config,
            path: path.into(),
            read_state,
            changes,
            client,
        }
    }

    pub fn config(&self) -> &ConfigSection {
        &self.config
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.config.update_seconds)
    }

    /// Start every entry's poll loop at the global interval.
    pub async fn start_all(&self) {
        let entries = self.snapshot().await;
        for entry in entries {
            entry.start_polling(self.update_interval()).await;
        }
    }

    /// Create a feed from `definition`, start its poll loop, and append
    /// it. Display order is insertion order.
    pub async fn add(&self, definition: FeedDefinition) -> Arc<FeedEntry> {
        let entry = Arc::new(FeedEntry::new(
            definition,
            self.read_state.clone(),
            self.changes.clone(),
            self.client.clone(),
        ));
        Arc::clone(&entry).start_polling(self.update_interval()).await;

        self.entries.write().await.push(Arc::clone(&entry));
        self.changes.touch().await;
        entry
    }

    /// Remove the feed with the given id, stopping its poll loop.
    /// Returns false when no feed matches.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut entries = self.entries.write().await;
            let mut index = None;
            for (i, entry) in entries.iter().enumerate() {
                if entry.id().await == id {
                    index = Some(i);
                    break;
                }
            }
            index.map(|i| entries.remove(i))
        };

        match removed {
            Some(entry) => {
                let url = entry.definition().await.url;
                info!(feed = %url, "removed feed");
                entry.stop_polling().await;
                self.changes.touch().await;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<FeedEntry>> {
        let entries = self.entries.read().await;
        for entry in entries.iter() {
            if entry.id().await == id {
                return Some(Arc::clone(entry));
            }
        }
        None
    }

    pub async fn snapshot(&self) -> Vec<Arc<FeedEntry>> {
        self.entries.read().await.clone()
    }

    /// Feeds grouped by category label, insertion order preserved within
    /// each group. Uncategorized feeds group under the empty string.
    pub async fn feed_tree(&self) -> BTreeMap<String, Vec<Arc<FeedEntry>>> {
        let entries = self.entries.read().await;
        let mut tree: BTreeMap<String, Vec<Arc<FeedEntry>>> = BTreeMap::new();
        for entry in entries.iter() {
            let category = entry.definition().await.category.unwrap_or_default();
            tree.entry(category).or_default().push(Arc::clone(entry));
        }
        tree
    }

    /// Rewrite the whole feeds file: config section plus every feed
    /// definition, pretty-printed with 2-space indentation.
    pub async fn save(&self) -> Result<(), PersistError> {
        let feeds = {
            let entries = self.entries.read().await;
            let mut feeds = Vec::with_capacity(entries.len());
            for entry in entries.iter() {
                feeds.push(entry.definition().await);
            }
            feeds
        };

        let file = FeedsFile {
            config: self.config.clone(),
            feeds,
        };
        let mut json = serde_json::to_string_pretty(&file)?;
        json.push('\n');
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}
