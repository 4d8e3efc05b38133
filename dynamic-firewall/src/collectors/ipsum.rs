//! IPsum daily threat feed (https://github.com/stamparm/ipsum).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use threat_database::CollectedEntry;
use tracing::{debug, info};

use super::{Collector, CollectorError, http_client};
use crate::core::config::ConfigError;

pub const NAME: &str = "ipsum";

pub const IPSUM_URL: &str = "https://raw.githubusercontent.com/stamparm/ipsum/master/ipsum.txt";

#[derive(Debug, Clone, Deserialize)]
pub struct IpsumConfig {
    /// Minimum number of blacklists an address must appear on
    #[serde(default = "default_min_score")]
    pub min_score: u32,
    #[serde(default = "default_url")]
    pub url: String,
}

fn default_min_score() -> u32 {
    3
}

fn default_url() -> String {
    IPSUM_URL.to_string()
}

pub struct IpsumCollector {
    config: IpsumConfig,
    client: Client,
}

impl IpsumCollector {
    pub fn new(config: IpsumConfig, timeout: Duration) -> Result<Self, ConfigError> {
        Ok(Self {
            config,
            client: http_client(timeout)?,
        })
    }

    pub fn from_section(
        section: &toml::Value,
        timeout: Duration,
    ) -> Result<Arc<dyn Collector>, ConfigError> {
        let config: IpsumConfig = section.clone().try_into()?;
        Ok(Arc::new(Self::new(config, timeout)?))
    }
}

#[async_trait]
impl Collector for IpsumCollector {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch(&self) -> Result<Vec<CollectedEntry>, CollectorError> {
        debug!("[{}] Fetching {}", NAME, self.config.url);

        let body = self
            .client
            .get(&self.config.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let entries = parse_ipsum(&body, self.config.min_score, Utc::now());
        info!(
            "[{}] Fetched {} IPs (min_score={})",
            NAME,
            entries.len(),
            self.config.min_score
        );
        Ok(entries)
    }
}

/// Parse the `IP<TAB>COUNT` listing, keeping entries with `COUNT >= min_score`.
///
/// Comments, blank lines and malformed lines are skipped.
pub fn parse_ipsum(body: &str, min_score: u32, observed_at: DateTime<Utc>) -> Vec<CollectedEntry> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let ip = parts.next()?.trim();
            let score = parts.next()?.trim().parse::<u32>().ok()?;
            if parts.next().is_some() || ip.is_empty() {
                return None;
            }
            Some((ip, score))
        })
        .filter(|(_, score)| *score >= min_score)
        .map(|(ip, score)| CollectedEntry::new(ip, NAME, score, observed_at))
        .collect()
}
