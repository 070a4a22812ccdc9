use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::scrape::ScrapeConfig;

/// The persisted feeds file: a `config` section plus the feed list.
/// Rewritten in place (2-space pretty JSON) whenever a feed is added,
/// edited, or removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedsFile {
    #[serde(default)]
    pub config: ConfigSection,
    #[serde(default)]
    pub feeds: Vec<FeedDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Global poll interval in seconds
    #[serde(default = "default_update_seconds")]
    pub update_seconds: u64,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_listen() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_update_seconds() -> u64 {
    300
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            update_seconds: default_update_seconds(),
            accept_invalid_certs: false,
        }
    }
}

/// One subscribed feed as it appears in the feeds file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedDefinition {
    pub url: String,
    /// Optional display-name override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional grouping label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrape: Option<ScrapeConfig>,
}

impl FeedsFile {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: FeedsFile = serde_json::from_str(&content)?;
        Ok(file)
    }

    /// Parse a feeds file from a JSON string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let file: FeedsFile = serde_json::from_str(content)?;
        Ok(file)
    }
}
