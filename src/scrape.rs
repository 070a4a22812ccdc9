use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use crate::error::ScrapeError;

const MISSING_LINK: &str = "(No link available)";

/// CSS-selector recipe for building a pseudo-feed from pages that have no
/// native feed. Stored verbatim in the feeds file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// Pages to scrape, in output order
    pub urls: Vec<String>,
    /// Selector matching one repeated item container
    pub item: String,
    /// Selector for the title inside a container
    pub title: String,
    /// Selector whose first match's `href` becomes the item link
    pub link: String,
}

impl ScrapeConfig {
    /// Fetch every configured page and assemble one RSS document with an
    /// entry per matched container, in source-URL order. The result is
    /// parsed by the same feed parser as native feeds. Any page fetch
    /// failing or answering non-2xx aborts the whole cycle; partial
    /// results are never returned.
    pub async fn generate_pseudo_feed(&self, client: &Client) -> Result<String, ScrapeError> {
        let channel_url = self.urls.first().map(String::as_str).unwrap_or_default();
        let channel_url = html_escape::encode_text(channel_url);

        let mut rss = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n\
             <rss version=\"2.0\">\n\
             <channel>\n\
             \x20 <title>{channel_url}</title>\n\
             \x20 <link>{channel_url}</link>\n\
             \x20 <description>This feed was scraped</description>\n"
        );

        for url in self.urls.iter().filter(|u| !u.is_empty()) {
            let response = client.get(url).send().await.map_err(|source| {
                ScrapeError::Fetch {
                    url: url.clone(),
                    source,
                }
            })?;

            let status = response.status();
            if !status.is_success() {
                return Err(ScrapeError::Status {
                    url: url.clone(),
                    status,
                });
            }

            let body = response.text().await.map_err(|source| ScrapeError::Fetch {
                url: url.clone(),
                source,
            })?;

            self.push_page_items(&body, &mut rss);
        }

        rss.push_str("</channel>\n</rss>\n");

        Ok(rss)
    }

    fn push_page_items(&self, body: &str, rss: &mut String) {
        let document = Html::parse_document(body);

        // a selector that fails to parse simply matches nothing
        let Ok(item_selector) = Selector::parse(&self.item) else {
            return;
        };

        for container in document.select(&item_selector) {
            // containers without a title match contribute nothing
            let Some(title) = select_first(container, &self.title)
                .and_then(|el| el.text().next())
                .map(str::to_string)
            else {
                continue;
            };

            let link = select_first(container, &self.link)
                .and_then(|el| el.value().attr("href"))
                .unwrap_or(MISSING_LINK);

            let title = html_escape::encode_text(&title);
            let link = html_escape::encode_text(link);

            rss.push_str(&format!(
                "  <item>\n\
                 \x20   <title>{title}</title>\n\
                 \x20   <link>{link}</link>\n\
                 \x20   <description>{title}</description>\n\
                 \x20 </item>\n"
            ));
        }
    }
}

fn select_first<'a>(scope: ElementRef<'a>, selector: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(selector).ok()?;
    scope.select(&selector).next()
}
