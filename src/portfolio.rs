// src/portfolio.rs
//
// Holdings of a tracked portfolio and the risk signals derived from them.

use crate::price_feeds::PriceOracle;
use crate::risk::RiskInputs;
use crate::rpc_pool::ConnectorPool;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Positions under 1% of the portfolio don't count towards diversification.
const MIN_DIVERSIFYING_WEIGHT: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub chain_id: u64,
    pub symbol: String,
    pub amount: Decimal,
    pub usd_value: f64,
    /// Percent
    pub change_24h: f64,
    /// Can be exited without unwinding a position
    pub liquid: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub address: String,
    pub holdings: Vec<Holding>,
    pub fetched_at: DateTime<Utc>,
}

impl PortfolioSnapshot {
    pub fn new(address: impl Into<String>, holdings: Vec<Holding>) -> Self {
        Self {
            address: address.into(),
            holdings,
            fetched_at: Utc::now(),
        }
    }

    pub fn total_value(&self) -> f64 {
        self.holdings.iter().map(|h| h.usd_value.max(0.0)).sum()
    }

    /// Value-weighted signals. An empty or worthless portfolio yields the defaults.
    pub fn risk_inputs(&self) -> RiskInputs {
        let total = self.total_value();
        if total <= 0.0 {
            return RiskInputs::default();
        }

        let mut inputs = RiskInputs {
            volatility_index: 0.0,
            liquidity_ratio: 0.0,
            concentration_risk: 0.0,
            diversification_score: 0.0,
            price_change_24h: 0.0,
        };
        let mut largest: f64 = 0.0;
        let mut positions = 0usize;
        for h in &self.holdings {
            let w = h.usd_value.max(0.0) / total;
            inputs.volatility_index += w * h.change_24h.abs();
            inputs.price_change_24h += w * h.change_24h;
            if h.liquid {
                inputs.liquidity_ratio += w;
            }
            largest = largest.max(w);
            if w >= MIN_DIVERSIFYING_WEIGHT {
                positions += 1;
            }
        }
        inputs.concentration_risk = largest * 100.0;
        inputs.diversification_score = (positions as f64 * 20.0).min(100.0);
        inputs
    }
}

/// Where portfolio holdings come from.
#[async_trait]
pub trait PortfolioSource: Send + Sync {
    async fn snapshot(&self, address: &str) -> Result<PortfolioSnapshot>;
}

/// Native balance on every connected chain, valued with the price oracle.
/// A symbol without a quote is kept at zero value.
pub struct NativeBalancePortfolioSource {
    pool: Arc<ConnectorPool>,
    prices: Arc<dyn PriceOracle>,
}

impl NativeBalancePortfolioSource {
    pub fn new(pool: Arc<ConnectorPool>, prices: Arc<dyn PriceOracle>) -> Self {
        Self { pool, prices }
    }
}

#[async_trait]
impl PortfolioSource for NativeBalancePortfolioSource {
    async fn snapshot(&self, address: &str) -> Result<PortfolioSnapshot> {
        let balances = self.pool.native_balances(address).await;
        if balances.is_empty() && self.pool.connected_count() > 0 {
            anyhow::bail!("no chain returned a balance for {}", address);
        }

        let mut quotes: HashMap<String, Option<(f64, f64)>> = HashMap::new();
        let mut holdings = Vec::with_capacity(balances.len());
        for (chain, amount) in balances {
            let symbol = chain.native_currency.symbol.clone();
            if !quotes.contains_key(&symbol) {
                let quote = match self.prices.quote(&symbol).await {
                    Ok(q) => Some((q.price, q.change_24h)),
                    Err(e) => {
                        debug!("No price for {}: {}", symbol, e);
                        None
                    }
                };
                quotes.insert(symbol.clone(), quote);
            }
            let (price, change_24h) = quotes.get(&symbol).copied().flatten().unwrap_or((0.0, 0.0));
            holdings.push(Holding {
                chain_id: chain.chain_id,
                usd_value: amount.to_f64().unwrap_or(0.0) * price,
                symbol,
                amount,
                change_24h,
                liquid: true,
            });
        }
        Ok(PortfolioSnapshot::new(address.to_lowercase(), holdings))
    }
}
