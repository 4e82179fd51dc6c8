//! SOL/USD price feed via the Pyth Hermes HTTP API.
//!
//! Polls the latest SOL/USD price, filters out low-confidence readings, and
//! persists accepted prices through the store so market-cap computation
//! always has a recent quote.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::store::Store;

const PYTH_HERMES_API: &str = "https://hermes.pyth.network/v2/updates/price/latest";
const SOL_USD_FEED_ID: &str = "0xef0d8b6fda2ceba41da15d4095d1da392a0d2f8ed0c6c7bc0f4cfac8c280b56d";

const POLL_INTERVAL_SECS: u64 = 5;

/// Maximum confidence interval relative to price (3% = usable quality).
const MAX_CONFIDENCE_RATIO: f64 = 0.03;

const INITIAL_RETRY_DELAY_MS: u64 = 100;
const MAX_RETRY_DELAY_MS: u64 = 5000;
const MAX_RETRIES: u32 = 5;

#[derive(Debug, Deserialize)]
struct PythResponse {
    parsed: Vec<PythParsed>,
}

#[derive(Debug, Deserialize)]
struct PythParsed {
    price: PythPrice,
}

#[derive(Debug, Deserialize)]
struct PythPrice {
    price: String,
    conf: String,
    expo: i32,
    publish_time: i64,
}

#[derive(Debug, Clone)]
struct PriceData {
    price: f64,
    confidence_ratio: f64,
    timestamp: i64,
}

pub struct SolPriceFeed {
    client: reqwest::Client,
    store: Arc<dyn Store>,
    // Last 3 accepted prices for median filtering.
    recent: Vec<f64>,
}

impl SolPriceFeed {
    pub fn new(store: Arc<dyn Store>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            store,
            recent: Vec::with_capacity(3),
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("🔮 SOL/USD price feed started (Pyth Hermes)");
        let mut rng = StdRng::from_entropy();

        loop {
            // ±2s jitter so many instances don't hit the API in lockstep.
            let jitter_ms = rng.gen_range(-2000..=2000);
            let interval_ms = ((POLL_INTERVAL_SECS * 1000) as i64 + jitter_ms).max(1000) as u64;
            sleep(Duration::from_millis(interval_ms)).await;

            match self.fetch_price_with_retry().await {
                Ok(price_data) => {
                    if price_data.confidence_ratio > MAX_CONFIDENCE_RATIO {
                        warn!(
                            "⚠️  Skipping low-confidence SOL price: ${:.4} (conf {:.1}%)",
                            price_data.price,
                            price_data.confidence_ratio * 100.0
                        );
                        continue;
                    }

                    self.recent.push(price_data.price);
                    if self.recent.len() > 3 {
                        self.recent.remove(0);
                    }
                    let filtered = if self.recent.len() >= 3 {
                        let mut sorted = self.recent.clone();
                        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
                        sorted[1]
                    } else {
                        price_data.price
                    };

                    if let Err(e) = self.store.record_sol_price(filtered, price_data.timestamp) {
                        warn!("Failed to persist SOL price: {}", e);
                    }
                }
                Err(e) => {
                    warn!("Failed to fetch SOL price after retries: {}", e);
                }
            }
        }
    }

    async fn fetch_price_with_retry(&self) -> Result<PriceData> {
        let mut retry_count = 0;
        let mut delay_ms = INITIAL_RETRY_DELAY_MS;

        loop {
            match self.fetch_price().await {
                Ok(price_data) => return Ok(price_data),
                Err(e) => {
                    retry_count += 1;
                    if retry_count >= MAX_RETRIES {
                        return Err(e.context(format!("Failed after {} retries", MAX_RETRIES)));
                    }
                    sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(MAX_RETRY_DELAY_MS);
                }
            }
        }
    }

    async fn fetch_price(&self) -> Result<PriceData> {
        let url = format!("{}?ids[]={}", PYTH_HERMES_API, SOL_USD_FEED_ID);

        let response: PythResponse = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to send request to Pyth API")?
            .json()
            .await
            .context("Failed to parse Pyth response")?;

        let price_info = &response
            .parsed
            .first()
            .context("No price data in response")?
            .price;

        let price_raw: i64 = price_info.price.parse().context("Failed to parse price string")?;
        let price = price_raw as f64 * 10f64.powi(price_info.expo);

        let conf_raw: i64 = price_info.conf.parse().context("Failed to parse confidence string")?;
        let confidence = conf_raw as f64 * 10f64.powi(price_info.expo);

        let confidence_ratio = if price > 0.0 { confidence / price } else { 1.0 };

        if !(1.0..=10_000.0).contains(&price) {
            anyhow::bail!("Price out of range: ${:.2}", price);
        }

        Ok(PriceData {
            price,
            confidence_ratio,
            timestamp: price_info.publish_time,
        })
    }
}

/// Spawn the price feed with automatic restart on failure.
pub fn spawn_sol_price_feed(store: Arc<dyn Store>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match SolPriceFeed::new(store.clone()) {
                Ok(mut feed) => {
                    if let Err(e) = feed.run().await {
                        error!("❌ SOL price feed error: {}", e);
                    }
                }
                Err(e) => {
                    error!("❌ Failed to create SOL price feed: {}", e);
                }
            }
            sleep(Duration::from_secs(5)).await;
        }
    })
}
