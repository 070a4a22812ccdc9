use thiserror::Error;

/// Errors from one refresh cycle of a feed. A `304 Not Modified` response
/// is not an error; see [`crate::feed::UpdateOutcome`].
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("feed parse failed: {0}")]
    Parse(#[from] feed_rs::parser::ParseFeedError),
    #[error("scrape failed: {0}")]
    Scrape(#[from] ScrapeError),
}

/// Errors while turning scraped pages into a pseudo-feed. Any one source
/// URL failing aborts the whole scrape cycle.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("get {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("get non-success {status} from {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
}

/// Failure writing the feeds file or the read cache. Logged by callers;
/// never fatal to the background tickers.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
