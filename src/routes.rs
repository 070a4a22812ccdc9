use std::collections::HashSet;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Form, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::error;

use crate::collection::{ChangeStamp, FeedCollection};
use crate::config::FeedDefinition;
use crate::feed::FeedEntry;
use crate::item::Item;
use crate::read_state::ReadStateStore;
use crate::scrape::ScrapeConfig;

pub struct AppState {
    pub feeds: Arc<FeedCollection>,
    pub read_state: Arc<ReadStateStore>,
    pub changes: Arc<ChangeStamp>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/feeds", get(feed_list))
        .route("/items", get(items).post(mark_items_read))
        .route("/item", get(item_detail))
        .route("/feed", get(feed_form).post(feed_submit))
        .with_state(state)
}

// Template structs
#[derive(Template)]
#[template(path = "base.html")]
pub struct BaseTemplate {}

#[derive(Template)]
#[template(path = "feedlist.html")]
pub struct FeedListTemplate {
    pub categories: Vec<CategoryView>,
    pub selected: String,
}

pub struct CategoryView {
    pub name: String,
    pub feeds: Vec<FeedView>,
}

pub struct FeedView {
    pub id: String,
    pub title: String,
    pub unread: usize,
}

#[derive(Template)]
#[template(path = "items.html")]
pub struct ItemsTemplate {
    pub feed_id: String,
    pub feed_title: String,
    pub site_link: String,
    pub items: Vec<Item>,
}

#[derive(Template)]
#[template(path = "item.html")]
pub struct ItemTemplate {
    pub item: Item,
}

#[derive(Template)]
#[template(path = "feed_form.html")]
pub struct FeedFormTemplate {
    pub form: FeedFormView,
    /// Recent fetch activity for the feed being edited
    pub logs: Vec<String>,
}

#[derive(Default)]
pub struct FeedFormView {
    pub id: String,
    pub url: String,
    pub name: String,
    pub category: String,
    pub scrape_urls: String,
    pub scrape_item: String,
    pub scrape_title: String,
    pub scrape_link: String,
}

impl FeedFormView {
    fn from_definition(id: String, definition: FeedDefinition) -> Self {
        let scrape = definition.scrape.unwrap_or(ScrapeConfig {
            urls: Vec::new(),
            item: String::new(),
            title: String::new(),
            link: String::new(),
        });
        Self {
            id,
            url: definition.url,
            name: definition.name.unwrap_or_default(),
            category: definition.category.unwrap_or_default(),
            scrape_urls: scrape.urls.join("\n"),
            scrape_item: scrape.item,
            scrape_title: scrape.title,
            scrape_link: scrape.link,
        }
    }
}

// Wrapper for HTML responses
struct HtmlTemplate<T>(T);

impl<T: Template> IntoResponse for HtmlTemplate<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to render template: {}", err),
            )
                .into_response(),
        }
    }
}

fn not_found() -> Response {
    Html("Not found.".to_string()).into_response()
}

/// Format a timestamp as an HTTP date (always GMT).
pub fn http_date(stamp: DateTime<Utc>) -> String {
    stamp.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an If-Modified-Since value. HTTP dates have whole-second
/// precision, so comparisons against the change stamp truncate to
/// seconds.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

// Route handlers
pub async fn index() -> impl IntoResponse {
    HtmlTemplate(BaseTemplate {})
}

#[derive(Deserialize)]
pub struct FeedListQuery {
    #[serde(default)]
    pub selected: String,
}

pub async fn feed_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedListQuery>,
    headers: HeaderMap,
) -> Response {
    let stamp = state.changes.current().await;

    if let Some(since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
    {
        if stamp.timestamp() <= since.timestamp() {
            return (
                StatusCode::NOT_MODIFIED,
                [(header::LAST_MODIFIED, http_date(stamp))],
            )
                .into_response();
        }
    }

    let tree = state.feeds.feed_tree().await;
    let mut categories = Vec::new();
    for (name, entries) in tree {
        let mut feeds = Vec::new();
        for entry in entries {
            feeds.push(FeedView {
                id: entry.id().await,
                title: entry.title().await,
                unread: entry.unread_count().await,
            });
        }
        categories.push(CategoryView { name, feeds });
    }

    (
        [(header::LAST_MODIFIED, http_date(stamp))],
        HtmlTemplate(FeedListTemplate {
            categories,
            selected: query.selected,
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct ItemsQuery {
    pub feed: String,
}

async fn items_fragment(entry: &Arc<FeedEntry>) -> ItemsTemplate {
    ItemsTemplate {
        feed_id: entry.id().await,
        feed_title: entry.title().await,
        site_link: entry.site_link().await.unwrap_or_default(),
        items: entry.items().await,
    }
}

pub async fn items(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ItemsQuery>,
) -> Response {
    let Some(entry) = state.feeds.get(&query.feed).await else {
        return not_found();
    };
    HtmlTemplate(items_fragment(&entry).await).into_response()
}

/// Mark a batch of items read. The form carries one `read` field per
/// identity; identities not matching a currently-known item are silently
/// ignored.
pub async fn mark_items_read(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ItemsQuery>,
    Form(form): Form<Vec<(String, String)>>,
) -> Response {
    let Some(entry) = state.feeds.get(&query.feed).await else {
        return not_found();
    };

    let read_ids: HashSet<String> = form
        .into_iter()
        .filter(|(key, _)| key == "read")
        .map(|(_, value)| value)
        .collect();

    let matched = entry.mark_items_read(&read_ids).await;
    if !matched.is_empty() {
        if let Err(err) = state.read_state.persist().await {
            error!(error = %err, "failed to persist read cache");
        }
        state.changes.touch().await;
    }

    HtmlTemplate(items_fragment(&entry).await).into_response()
}

#[derive(Deserialize)]
pub struct ItemQuery {
    pub feed: String,
    pub id: String,
}

pub async fn item_detail(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ItemQuery>,
) -> Response {
    let Some(entry) = state.feeds.get(&query.feed).await else {
        return not_found();
    };

    match entry.read_item(&query.id).await {
        Some(item) => {
            if let Err(err) = state.read_state.persist().await {
                error!(error = %err, "failed to persist read cache");
            }
            state.changes.touch().await;
            HtmlTemplate(ItemTemplate { item }).into_response()
        }
        None => not_found(),
    }
}

#[derive(Deserialize)]
pub struct FeedQuery {
    #[serde(default)]
    pub feed: String,
}

pub async fn feed_form(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> Response {
    let (form, logs) = if query.feed.is_empty() {
        (FeedFormView::default(), Vec::new())
    } else {
        match state.feeds.get(&query.feed).await {
            Some(entry) => (
                FeedFormView::from_definition(entry.id().await, entry.definition().await),
                entry.activity.snapshot(),
            ),
            None => return not_found(),
        }
    };
    HtmlTemplate(FeedFormTemplate { form, logs }).into_response()
}

#[derive(Deserialize)]
pub struct FeedForm {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, rename = "scrape.urls")]
    pub scrape_urls: String,
    #[serde(default, rename = "scrape.item")]
    pub scrape_item: String,
    #[serde(default, rename = "scrape.title")]
    pub scrape_title: String,
    #[serde(default, rename = "scrape.link")]
    pub scrape_link: String,
    #[serde(default)]
    pub delete: String,
}

impl FeedForm {
    fn into_definition(self) -> FeedDefinition {
        let scrape = if self.scrape_urls.is_empty()
            && self.scrape_item.is_empty()
            && self.scrape_title.is_empty()
            && self.scrape_link.is_empty()
        {
            None
        } else {
            Some(ScrapeConfig {
                urls: self
                    .scrape_urls
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect(),
                item: self.scrape_item,
                title: self.scrape_title,
                link: self.scrape_link,
            })
        };

        FeedDefinition {
            url: self.url,
            name: Some(self.name).filter(|n| !n.is_empty()),
            category: Some(self.category).filter(|c| !c.is_empty()),
            scrape,
        }
    }
}

fn load_items_fragment(feed_id: &str) -> Response {
    Html(format!(
        r##"<div hx-get="/items?feed={feed_id}" hx-trigger="load" hx-target="#items"></div>"##
    ))
    .into_response()
}

/// Add, edit, or delete a feed. The whole collection is re-saved after
/// every mutation; save failures are logged server-side only.
pub async fn feed_submit(
    State(state): State<Arc<AppState>>,
    Form(form): Form<FeedForm>,
) -> Response {
    let id = form.id.clone();
    let delete = !form.delete.is_empty();
    let definition = form.into_definition();

    let response = if !id.is_empty() {
        if delete {
            if state.feeds.remove(&id).await {
                Html("Deleted.".to_string()).into_response()
            } else {
                return not_found();
            }
        } else {
            match state.feeds.get(&id).await {
                Some(entry) => {
                    entry.set_definition(definition).await;
                    state.changes.touch().await;
                    load_items_fragment(&entry.id().await)
                }
                None => return not_found(),
            }
        }
    } else {
        let entry = state.feeds.add(definition).await;
        load_items_fragment(&entry.id().await)
    };

    // something may have changed, so save it
    if let Err(err) = state.feeds.save().await {
        error!(error = %err, "failed to save feeds file");
    }

    response
}
