use std::collections::HashSet;

use chrono::{DateTime, Utc};
use feed_rs::model::Entry;
use ego_tree::{NodeId, NodeRef};
use scraper::{Html, Node};
use sha2::{Digest, Sha256};

/// Elements stripped from item descriptions, subtree and all.
const DROP_TAGS: &[&str] = &["script", "style", "link", "meta", "iframe"];

/// Elements serialized without a closing tag.
const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const SUMMARY_MAX_CHARS: usize = 200;

/// One feed item as served to the HTML layer. Rebuilt wholesale on every
/// refresh; derived fields are computed once here rather than lazily.
#[derive(Debug, Clone)]
pub struct Item {
    /// Opaque display id: hex SHA-256 of `read_id`
    pub id: String,
    /// Mark-read identity: link, else GUID, else URL-escaped title
    pub read_id: String,
    pub title: String,
    pub link: Option<String>,
    /// Sanitized description HTML
    pub description: String,
    /// Short plain-text rendering of the description
    pub summary: String,
    /// Attached images not already present in the description
    pub images: Vec<String>,
    pub updated: Option<DateTime<Utc>>,
    pub published: Option<DateTime<Utc>>,
    pub unread: bool,
}

impl Item {
    pub fn from_entry(entry: &Entry) -> Self {
        let title = entry
            .title
            .as_ref()
            .map(|t| t.content.clone())
            .unwrap_or_default();
        let link = entry.links.first().map(|l| l.href.clone());

        let raw_description = entry
            .summary
            .as_ref()
            .map(|t| t.content.clone())
            .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
            .unwrap_or_default();

        let (description, description_images) = sanitize_description(&raw_description);
        let summary = summarize(&raw_description, &title);
        let images = entry_images(entry, &description_images);

        let read_id = mark_read_identity(link.as_deref(), &entry.id, &title);
        let id = display_id(&read_id);

        Self {
            id,
            read_id,
            title,
            link,
            description,
            summary,
            images,
            updated: entry.updated,
            published: entry.published,
            unread: true,
        }
    }

    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            "(Untitled)"
        } else {
            &self.title
        }
    }

    /// Recency prefers the update timestamp, falling back to publication.
    pub fn effective_date(&self) -> Option<DateTime<Utc>> {
        self.updated.or(self.published)
    }

    pub fn date_label(&self) -> String {
        self.effective_date()
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default()
    }
}

/// The durable key for read/unread tracking: first non-empty of link,
/// GUID, URL-escaped title. Must stay stable across re-fetches of the
/// same logical item.
pub fn mark_read_identity(link: Option<&str>, guid: &str, title: &str) -> String {
    if let Some(link) = link.filter(|l| !l.is_empty()) {
        return link.to_string();
    }
    if !guid.is_empty() {
        return guid.to_string();
    }
    url::form_urlencoded::byte_serialize(title.as_bytes()).collect()
}

/// Opaque per-item id derived from the mark-read identity.
pub fn display_id(read_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(read_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Sort contract for a feed's item list: unread strictly before read;
/// within equal unread status, most recent effective date first; items
/// without a comparable date keep their relative parse order. Relies on
/// `sort_by` being stable.
pub fn sort_items(items: &mut [Item]) {
    items.sort_by(|a, b| {
        b.unread.cmp(&a.unread).then_with(|| {
            match (a.effective_date(), b.effective_date()) {
                (Some(a_date), Some(b_date)) => b_date.cmp(&a_date),
                _ => std::cmp::Ordering::Equal,
            }
        })
    });
}

/// Sanitize untrusted description HTML as a pure transform: parse, mark
/// disallowed nodes, then serialize everything that was not marked.
/// Returns the cleaned HTML plus the `src` of every image in it, for
/// de-duplicating attached images.
pub fn sanitize_description(raw: &str) -> (String, Vec<String>) {
    let fragment = Html::parse_fragment(raw);

    let mut doomed = HashSet::new();
    mark_doomed(fragment.tree.root(), &mut doomed);

    let mut out = String::new();
    let mut images = Vec::new();
    for child in fragment.root_element().children() {
        render_node(child, &doomed, &mut out, &mut images);
    }

    (out, images)
}

fn mark_doomed(node: NodeRef<'_, Node>, doomed: &mut HashSet<NodeId>) {
    if let Node::Element(element) = node.value() {
        if DROP_TAGS.contains(&element.name()) {
            doomed.insert(node.id());
            return;
        }
    }
    for child in node.children() {
        mark_doomed(child, doomed);
    }
}

fn render_node(
    node: NodeRef<'_, Node>,
    doomed: &HashSet<NodeId>,
    out: &mut String,
    images: &mut Vec<String>,
) {
    if doomed.contains(&node.id()) {
        return;
    }

    match node.value() {
        Node::Text(text) => {
            let content: &str = &text;
            out.push_str(&html_escape::encode_text(content));
        }
        Node::Element(element) => {
            let name = element.name();
            let overridden: &[&str] = match name {
                // links open away from the reader
                "a" => &["target"],
                // keep oversized media inside the item column
                "img" | "svg" => &["style"],
                _ => &[],
            };

            out.push('<');
            out.push_str(name);
            for (key, value) in element.attrs() {
                if overridden.contains(&key) {
                    continue;
                }
                out.push(' ');
                out.push_str(key);
                out.push_str("=\"");
                out.push_str(&html_escape::encode_double_quoted_attribute(value));
                out.push('"');
            }
            match name {
                "a" => out.push_str(" target=\"_new\""),
                "img" | "svg" => {
                    out.push_str(" style=\"max-width: 60%;\"");
                    if let Some(src) = element.attr("src") {
                        images.push(src.to_string());
                    }
                }
                _ => {}
            }
            out.push('>');

            if VOID_TAGS.contains(&name) {
                return;
            }
            for child in node.children() {
                render_node(child, doomed, out, images);
            }
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
        // comments, doctypes and processing instructions are dropped
        _ => {}
    }
}

/// Plain-text summary of a description: capped length, and emptied when
/// it adds nothing over the title or is just a bare URL (link
/// aggregators do this).
fn summarize(raw_description: &str, title: &str) -> String {
    let plain = nanohtml2text::html2text(raw_description);
    let plain: String = plain.chars().take(SUMMARY_MAX_CHARS).collect();

    if plain == title {
        return String::new();
    }
    if url::Url::parse(plain.trim()).is_ok() {
        return String::new();
    }

    plain
}

/// Images attached to the entry via media extensions, excluding any that
/// already appear in the sanitized description.
fn entry_images(entry: &Entry, description_images: &[String]) -> Vec<String> {
    let mut images = Vec::new();

    for media in &entry.media {
        for content in &media.content {
            let media_type = content.content_type.as_ref().map(|m| m.to_string());
            let is_image = media_type
                .as_deref()
                .map(|m| m.starts_with("image/"))
                .unwrap_or(false);
            if !is_image {
                continue;
            }
            if let Some(url) = content.url.as_ref().map(|u| u.to_string()) {
                if !description_images.contains(&url) {
                    images.push(url);
                }
            }
        }
        for thumbnail in &media.thumbnails {
            let url = thumbnail.image.uri.clone();
            if !description_images.contains(&url) && !images.contains(&url) {
                images.push(url);
            }
        }
    }

    images
}
