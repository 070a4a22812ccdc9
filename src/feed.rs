use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, Response, StatusCode};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::collection::ChangeStamp;
use crate::config::FeedDefinition;
use crate::error::UpdateError;
use crate::item::{sort_items, Item};
use crate::read_state::ReadStateStore;

/// Maximum lines kept in a feed's recent-activity buffer.
pub const MAX_RECENT_LOG_LINES: usize = 30;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the shared HTTP client used for feed fetches and scrapes.
pub fn http_client(accept_invalid_certs: bool) -> Client {
    Client::builder()
        .timeout(FETCH_TIMEOUT)
        .user_agent("feedstand/0.1 (feed reader)")
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .expect("Failed to create HTTP client")
}

/// Stable external reference for a feed: hex SHA-256 of its subscription
/// URL. Two feeds with identical URLs collide; accepted edge case.
pub fn feed_id(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

/// Outcome of a successful refresh. `NotModified` means the remote
/// answered 304 and nothing was touched; schedulers must not treat it as
/// a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NotModified,
}

#[derive(Debug, Clone, Default)]
pub struct FeedMeta {
    pub title: Option<String>,
    pub link: Option<String>,
}

/// Everything guarded by the entry's read-write lock: parsed feed
/// metadata, the item list, and the conditional-fetch validators.
#[derive(Debug, Default)]
struct FeedState {
    meta: Option<FeedMeta>,
    items: Vec<Item>,
    etag: Option<String>,
    last_modified: Option<String>,
}

/// Bounded ring buffer of recent activity lines for one feed, mirrored
/// to the UI so a feed's fetch history is visible without server logs.
pub struct ActivityLog {
    lines: StdMutex<std::collections::VecDeque<String>>,
}

impl ActivityLog {
    fn new() -> Self {
        Self {
            lines: StdMutex::new(std::collections::VecDeque::with_capacity(
                MAX_RECENT_LOG_LINES,
            )),
        }
    }

    pub fn push(&self, message: &str) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == MAX_RECENT_LOG_LINES {
            lines.pop_front();
        }
        lines.push_back(format!(
            "{} {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
            message
        ));
    }

    pub fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().cloned().collect()
    }
}

struct PollHandle {
    cancel: broadcast::Sender<()>,
    // detached on stop; an in-flight update is allowed to finish
    _join: JoinHandle<()>,
}

/// One subscribed feed: its definition, current items, conditional-fetch
/// cache, activity buffer, and poll loop handle.
pub struct FeedEntry {
    definition: RwLock<FeedDefinition>,
    state: RwLock<FeedState>,
    pub activity: ActivityLog,
    poller: Mutex<Option<PollHandle>>,
    read_state: Arc<ReadStateStore>,
    changes: Arc<ChangeStamp>,
    client: Client,
}

impl FeedEntry {
    pub fn new(
        definition: FeedDefinition,
        read_state: Arc<ReadStateStore>,
        changes: Arc<ChangeStamp>,
        client: Client,
    ) -> Self {
        Self {
            definition: RwLock::new(definition),
            state: RwLock::new(FeedState::default()),
            activity: ActivityLog::new(),
            poller: Mutex::new(None),
            read_state,
            changes,
            client,
        }
    }

    pub async fn id(&self) -> String {
        feed_id(&self.definition.read().await.url)
    }

    pub async fn definition(&self) -> FeedDefinition {
        self.definition.read().await.clone()
    }

    /// Replace the definition in place. The poll loop, if running, keeps
    /// its schedule and picks the new definition up on the next tick.
    pub async fn set_definition(&self, definition: FeedDefinition) {
        *self.definition.write().await = definition;
    }

    /// Display title: name override, else parsed feed title, else URL.
    pub async fn title(&self) -> String {
        let definition = self.definition.read().await;
        if let Some(name) = definition.name.as_ref().filter(|n| !n.is_empty()) {
            return name.clone();
        }
        if let Some(meta) = &self.state.read().await.meta {
            if let Some(title) = meta.title.as_ref().filter(|t| !t.is_empty()) {
                return title.clone();
            }
        }
        definition.url.clone()
    }

    pub async fn site_link(&self) -> Option<String> {
        self.state.read().await.meta.as_ref()?.link.clone()
    }

    pub async fn unread_count(&self) -> usize {
        self.state
            .read()
            .await
            .items
            .iter()
            .filter(|i| i.unread)
            .count()
    }

    pub async fn items(&self) -> Vec<Item> {
        self.state.read().await.items.clone()
    }

    #[cfg(test)]
    pub async fn cached_validators(&self) -> (Option<String>, Option<String>) {
        let state = self.state.read().await;
        (state.etag.clone(), state.last_modified.clone())
    }

    /// Run one fetch/merge cycle. On success the item list is replaced
    /// wholesale; on any error the previous list is left untouched.
    pub async fn update(&self) -> Result<UpdateOutcome, UpdateError> {
        let definition = self.definition.read().await.clone();

        let (parsed, new_etag, new_last_modified) = if let Some(scrape) = &definition.scrape {
            info!(feed = %definition.url, sources = scrape.urls.len(), "scraping source pages");
            self.activity.push("scraping source pages");

            let pseudo = scrape.generate_pseudo_feed(&self.client).await?;
            (feed_rs::parser::parse(pseudo.as_bytes())?, None, None)
        } else {
            info!(feed = %definition.url, "fetching feed");
            self.activity.push("fetching feed");

            let response = self.conditional_get(&definition.url).await?;

            if response.status() == StatusCode::NOT_MODIFIED {
                debug!(feed = %definition.url, "not modified");
                self.activity.push("not modified");
                return Ok(UpdateOutcome::NotModified);
            }
            if !response.status().is_success() {
                return Err(UpdateError::Status {
                    url: definition.url.clone(),
                    status: response.status(),
                });
            }

            let etag = header_string(&response, ETAG);
            let last_modified = header_string(&response, LAST_MODIFIED);
            let bytes = response.bytes().await?;

            (feed_rs::parser::parse(&bytes[..])?, etag, last_modified)
        };

        let meta = FeedMeta {
            title: parsed.title.as_ref().map(|t| t.content.clone()),
            link: parsed.links.first().map(|l| l.href.clone()),
        };

        // Build the replacement list before taking the write lock, so
        // readers are only ever blocked by the swap itself.
        let mut items = Vec::with_capacity(parsed.entries.len());
        for entry in &parsed.entries {
            let mut item = Item::from_entry(entry);
            item.unread = self.read_state.is_unread(&item.read_id).await;
            items.push(item);
        }
        sort_items(&mut items);

        let read_ids: Vec<String> = items.iter().map(|i| i.read_id.clone()).collect();
        info!(feed = %definition.url, count = items.len(), "items in feed");
        self.activity.push(&format!("{} item(s) in feed", items.len()));

        {
            let mut state = self.state.write().await;
            state.meta = Some(meta);
            state.items = items;
            if let Some(etag) = new_etag {
                state.etag = Some(etag);
            }
            if let Some(last_modified) = new_last_modified {
                state.last_modified = Some(last_modified);
            }
        }

        // Anything still being served keeps its read marker alive.
        for read_id in &read_ids {
            self.read_state.extend_life(read_id).await;
        }
        if let Err(err) = self.read_state.persist().await {
            error!(feed = %definition.url, error = %err, "failed to persist read cache");
            self.activity.push(&format!("failed to persist read cache: {err}"));
        }
        self.changes.touch().await;

        Ok(UpdateOutcome::Updated)
    }

    async fn conditional_get(&self, url: &str) -> Result<Response, reqwest::Error> {
        let (etag, last_modified) = {
            let state = self.state.read().await;
            (state.etag.clone(), state.last_modified.clone())
        };

        let mut request = self.client.get(url);
        if let Some(etag) = &etag {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }
        if let Some(last_modified) = &last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
        }

        request.send().await
    }

    /// Mark every item whose mark-read identity appears in `read_ids` as
    /// read. Unknown identities are ignored. Returns the identities that
    /// actually matched; the caller persists the read state once per
    /// batch.
    pub async fn mark_items_read(&self, read_ids: &HashSet<String>) -> Vec<String> {
        let mut matched = Vec::new();
        {
            let mut state = self.state.write().await;
            for item in &mut state.items {
                if item.unread && read_ids.contains(&item.read_id) {
                    item.unread = false;
                    matched.push(item.read_id.clone());
                }
            }
        }
        for read_id in &matched {
            self.read_state.mark_read(read_id).await;
        }
        matched
    }

    /// Look up an item by display id, marking it read. Returns the item
    /// as it will be rendered.
    pub async fn read_item(&self, item_id: &str) -> Option<Item> {
        let found = {
            let mut state = self.state.write().await;
            let item = state.items.iter_mut().find(|i| i.id == item_id)?;
            item.unread = false;
            item.clone()
        };
        self.read_state.mark_read(&found.read_id).await;
        Some(found)
    }

    // --- poll scheduling ---

    /// Start the poll loop: one immediate update, then one per interval
    /// until stopped. No-op if already running.
    pub async fn start_polling(self: Arc<Self>, every: Duration) {
        let mut poller = self.poller.lock().await;
        if poller.is_some() {
            return;
        }

        let url = self.definition.read().await.url.clone();
        info!(feed = %url, interval = ?every, "starting poll loop");
        self.activity.push("poll loop started");

        let (cancel, mut cancel_rx) = broadcast::channel(1);
        let entry = Arc::clone(&self);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel_rx.recv() => {
                        debug!(feed = %url, "poll loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match entry.update().await {
                            Ok(UpdateOutcome::Updated) => {}
                            Ok(UpdateOutcome::NotModified) => {
                                debug!(feed = %url, "feed not modified");
                            }
                            Err(err) => {
                                error!(feed = %url, error = %err, "update failed");
                                entry.activity.push(&format!("update failed: {err}"));
                            }
                        }
                    }
                }
            }
        });

        *poller = Some(PollHandle {
            cancel,
            _join: join,
        });
    }

    /// Cancel future ticks. An update already in flight is allowed to
    /// finish. No-op if not running.
    pub async fn stop_polling(&self) {
        let mut poller = self.poller.lock().await;
        if let Some(handle) = poller.take() {
            self.activity.push("poll loop stopped");
            let _ = handle.cancel.send(());
        }
    }

    /// Change the poll interval. Implemented as stop + start; never
    /// leaves two loops running for the same entry.
    pub async fn retune_polling(self: Arc<Self>, every: Duration) {
        self.stop_polling().await;
        self.start_polling(every).await;
    }

    pub async fn is_polling(&self) -> bool {
        self.poller.lock().await.is_some()
    }
}

fn header_string(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}
