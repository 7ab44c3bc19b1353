// src/price_feeds.rs

use crate::cache::CacheLayer;
use crate::settings::PriceFeeds;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// USD price of a symbol with its 24h move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub symbol: String,
    pub price: f64,
    /// Percent
    pub change_24h: f64,
    pub fetched_at: DateTime<Utc>,
    /// Served from the last good value after a failed lookup
    #[serde(default)]
    pub stale: bool,
}

/// External price lookup used to enrich risk scoring.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<PriceQuote>;
}

// CoinGecko simple/price returns { "<id>": { "usd": 1.0, "usd_24h_change": -0.5 } }
type CoinGeckoPriceResponse = HashMap<String, CoinGeckoTokenPrice>;

#[derive(Debug, Deserialize)]
struct CoinGeckoTokenPrice {
    usd: f64,
    #[serde(default)]
    usd_24h_change: Option<f64>,
}

/// CoinGecko-backed oracle.
///
/// A failed or timed-out lookup falls back to the last good quote, first from
/// memory and then from the cache price namespace, flagged `stale`.
pub struct CoinGeckoPriceOracle {
    client: reqwest::Client,
    base_url: String,
    symbol_ids: HashMap<String, String>,
    last_good: DashMap<String, PriceQuote>,
    cache: Arc<CacheLayer>,
}

impl CoinGeckoPriceOracle {
    pub fn new(settings: &PriceFeeds, cache: Arc<CacheLayer>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            client,
            base_url: settings.coingecko_base_url.trim_end_matches('/').to_string(),
            symbol_ids: settings
                .symbol_ids
                .iter()
                .map(|(s, id)| (s.to_uppercase(), id.clone()))
                .collect(),
            last_good: DashMap::new(),
            cache,
        })
    }

    async fn fetch(&self, symbol: &str) -> Result<PriceQuote> {
        let id = self
            .symbol_ids
            .get(symbol)
            .ok_or_else(|| anyhow!("No CoinGecko id configured for {}", symbol))?;
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies=usd&include_24hr_change=true",
            self.base_url, id
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("HTTP request failed: {}", e))?;
        if !response.status().is_success() {
            if response.status() == 429 {
                return Err(anyhow!("Rate limited (429)"));
            }
            return Err(anyhow!("HTTP error: {}", response.status()));
        }
        let data: CoinGeckoPriceResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("JSON parse failed: {}", e))?;

        let entry = data
            .get(id)
            .ok_or_else(|| anyhow!("CoinGecko response has no entry for {}", id))?;
        if !(entry.usd > 0.0 && entry.usd <= 1_000_000_000.0) {
            return Err(anyhow!("Price {} for {} out of range", entry.usd, symbol));
        }
        Ok(PriceQuote {
            symbol: symbol.to_string(),
            price: entry.usd,
            change_24h: entry.usd_24h_change.unwrap_or(0.0),
            fetched_at: Utc::now(),
            stale: false,
        })
    }

    async fn stale_fallback(&self, symbol: &str) -> Option<PriceQuote> {
        if let Some(q) = self.last_good.get(symbol) {
            return Some(PriceQuote {
                stale: true,
                ..q.value().clone()
            });
        }
        self.cache
            .get_price_data::<PriceQuote>(symbol)
            .await
            .map(|q| PriceQuote { stale: true, ..q })
    }
}

#[async_trait]
impl PriceOracle for CoinGeckoPriceOracle {
    async fn quote(&self, symbol: &str) -> Result<PriceQuote> {
        let symbol = symbol.to_uppercase();
        match self.fetch(&symbol).await {
            Ok(quote) => {
                self.last_good.insert(symbol.clone(), quote.clone());
                self.cache.set_price_data(&symbol, &quote).await;
                debug!("💲 {} = ${:.4} ({:+.2}% 24h)", symbol, quote.price, quote.change_24h);
                Ok(quote)
            }
            Err(e) => match self.stale_fallback(&symbol).await {
                Some(quote) => {
                    warn!("⚠️ Price lookup for {} failed ({}), serving stale quote", symbol, e);
                    Ok(quote)
                }
                None => Err(e),
            },
        }
    }
}

/// Fixed quotes, for offline runs and tests.
#[derive(Default)]
pub struct StaticPriceOracle {
    quotes: DashMap<String, (f64, f64)>,
}

impl StaticPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quote(self, symbol: &str, price: f64, change_24h: f64) -> Self {
        self.set_quote(symbol, price, change_24h);
        self
    }

    pub fn set_quote(&self, symbol: &str, price: f64, change_24h: f64) {
        self.quotes.insert(symbol.to_uppercase(), (price, change_24h));
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn quote(&self, symbol: &str) -> Result<PriceQuote> {
        let symbol = symbol.to_uppercase();
        let (price, change_24h) = *self
            .quotes
            .get(&symbol)
            .ok_or_else(|| anyhow!("No quote for {}", symbol))?;
        Ok(PriceQuote {
            symbol,
            price,
            change_24h,
            fetched_at: Utc::now(),
            stale: false,
        })
    }
}
