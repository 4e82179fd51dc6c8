//! Creator-history API client.
//!
//! Counts how many distinct mints a creator wallet has launched, by paging
//! through an external indexer until it returns a short page.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

const PAGE_LIMIT: usize = 100;
// The indexer caps result depth anyway; this bounds a misbehaving API.
const MAX_PAGES: u32 = 50;

#[derive(Debug, Deserialize)]
struct TokenPage {
    items: Vec<TokenItem>,
}

#[derive(Debug, Deserialize)]
struct TokenItem {
    mint: String,
}

pub struct CreatorHistoryClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl CreatorHistoryClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Distinct mints launched by `creator`.
    pub async fn creator_token_count(&self, creator: &str) -> Result<u64> {
        let mut mints: HashSet<String> = HashSet::new();

        for page in 1..=MAX_PAGES {
            let url = format!(
                "{}/creators/{}/tokens?page={}&limit={}",
                self.base_url, creator, page, PAGE_LIMIT
            );
            let mut request = self.client.get(&url);
            if let Some(key) = &self.api_key {
                request = request.header("x-api-key", key);
            }

            let body: TokenPage = request
                .send()
                .await
                .context("Creator-history request failed")?
                .error_for_status()
                .context("Creator-history API returned an error")?
                .json()
                .await
                .context("Failed to parse creator-history response")?;

            let received = body.items.len();
            for item in body.items {
                mints.insert(item.mint);
            }
            debug!(
                "Creator {} page {}: {} items, {} distinct mints",
                creator,
                page,
                received,
                mints.len()
            );

            if received < PAGE_LIMIT {
                break;
            }
        }

        Ok(mints.len() as u64)
    }
}
