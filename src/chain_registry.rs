//! # Chain Registry
//!
//! Table of supported networks, built once at startup from [`Settings`] and never
//! shrunk while the process runs. Every chain carries an indexing cursor
//! ([`ChainCursor`]) that only ever moves forward.
//!
//! [`Settings`]: crate::settings::Settings

use crate::errors::{EngineError, EngineResult};
use crate::settings::ChainSettings;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

impl Default for NativeCurrency {
    fn default() -> Self {
        Self {
            name: "Ether".to_string(),
            symbol: "ETH".to_string(),
            decimals: 18,
        }
    }
}

/// Testnets served when the configuration has no `[[chains]]` table.
pub static DEFAULT_CHAINS: Lazy<Vec<ChainSettings>> = Lazy::new(|| {
    let eth = NativeCurrency::default();
    vec![
        ChainSettings {
            chain_id: 11155111,
            name: "Ethereum Sepolia".to_string(),
            rpc_url: "https://rpc.sepolia.org".to_string(),
            explorer_url: "https://sepolia.etherscan.io".to_string(),
            bridge_router: Some("0x0BF3dE8c5D3e8A2B34D2BEeB17ABfCeBaf363A59".to_string()),
            bridge_selector: Some(16015286601757825753),
            native_currency: eth.clone(),
            active: true,
        },
        ChainSettings {
            chain_id: 421614,
            name: "Arbitrum Sepolia".to_string(),
            rpc_url: "https://sepolia-rollup.arbitrum.io/rpc".to_string(),
            explorer_url: "https://sepolia.arbiscan.io".to_string(),
            bridge_router: Some("0x2a9C5afB0d0e4BAb2BCdaE109EC4b0c4Be15a165".to_string()),
            bridge_selector: Some(3478487238524512106),
            native_currency: eth.clone(),
            active: true,
        },
        ChainSettings {
            chain_id: 84532,
            name: "Base Sepolia".to_string(),
            rpc_url: "https://sepolia.base.org".to_string(),
            explorer_url: "https://sepolia.basescan.org".to_string(),
            bridge_router: Some("0xD3b06cEbF099CE7DA4AcCf578aaebFDBd6e88a93".to_string()),
            bridge_selector: Some(10344971235874465080),
            native_currency: eth.clone(),
            active: true,
        },
        ChainSettings {
            chain_id: 11155420,
            name: "Optimism Sepolia".to_string(),
            rpc_url: "https://sepolia.optimism.io".to_string(),
            explorer_url: "https://sepolia-optimism.etherscan.io".to_string(),
            bridge_router: Some("0x114A20A10b43D4115e5aeef7345a1A71d2a60C57".to_string()),
            bridge_selector: Some(5224473277236331295),
            native_currency: eth,
            active: true,
        },
        ChainSettings {
            chain_id: 80002,
            name: "Polygon Amoy".to_string(),
            rpc_url: "https://rpc-amoy.polygon.technology".to_string(),
            explorer_url: "https://amoy.polygonscan.com".to_string(),
            bridge_router: Some("0x9C32fCB86BF0f4a1A8921a9Fe46de3198bb884B2".to_string()),
            bridge_selector: Some(16281711391670634445),
            native_currency: NativeCurrency {
                name: "POL".to_string(),
                symbol: "POL".to_string(),
                decimals: 18,
            },
            active: true,
        },
    ]
});

/// Last fully processed block of one chain.
///
/// Written by exactly two call sites: connect-time [`initialize`](Self::initialize)
/// (only while still unset) and the chain's own indexer via
/// [`advance`](Self::advance). Both refuse to move the value backwards.
///
/// Stored as `block + 1` so that block 0 and "unset" stay distinct.
#[derive(Debug, Default)]
pub struct ChainCursor(AtomicU64);

impl ChainCursor {
    /// 0 while unset.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire).saturating_sub(1)
    }

    pub fn is_initialized(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    /// Sets the starting point if no block was indexed yet. Returns `true` if it was applied.
    pub fn initialize(&self, block: u64) -> bool {
        self.0
            .compare_exchange(0, block.saturating_add(1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves the cursor to `block` unless it already points further. Returns the previous value.
    pub fn advance(&self, block: u64) -> u64 {
        self.0
            .fetch_max(block.saturating_add(1), Ordering::AcqRel)
            .saturating_sub(1)
    }
}

/// Identity and connectivity of one network.
#[derive(Debug)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_url: String,
    pub explorer_url: String,
    pub bridge_router: Option<String>,
    pub bridge_selector: Option<u64>,
    pub native_currency: NativeCurrency,
    pub active: bool,
    pub last_indexed_block: ChainCursor,
}

impl From<&ChainSettings> for ChainConfig {
    fn from(s: &ChainSettings) -> Self {
        Self {
            chain_id: s.chain_id,
            name: s.name.clone(),
            rpc_url: s.rpc_url.clone(),
            explorer_url: s.explorer_url.clone(),
            bridge_router: s.bridge_router.clone(),
            bridge_selector: s.bridge_selector,
            native_currency: s.native_currency.clone(),
            active: s.active,
            last_indexed_block: ChainCursor::default(),
        }
    }
}

impl ChainConfig {
    pub fn tx_url(&self, tx_hash: &str) -> String {
        format!("{}/tx/{}", self.explorer_url.trim_end_matches('/'), tx_hash)
    }

    pub fn supports_bridge(&self) -> bool {
        self.bridge_router.is_some() && self.bridge_selector.is_some()
    }
}

/// Serializable view of a chain, cursor included.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainSummary {
    pub chain_id: u64,
    pub name: String,
    pub explorer_url: String,
    pub native_symbol: String,
    pub active: bool,
    pub last_indexed_block: u64,
}

/// Chains in configuration order, keyed by chain id.
#[derive(Debug, Default)]
pub struct ChainRegistry {
    chains: IndexMap<u64, Arc<ChainConfig>>,
}

impl ChainRegistry {
    pub fn from_settings(chains: &[ChainSettings]) -> Self {
        let mut map = IndexMap::with_capacity(chains.len());
        for chain in chains {
            map.entry(chain.chain_id)
                .or_insert_with(|| Arc::new(ChainConfig::from(chain)));
        }
        Self { chains: map }
    }

    pub fn lookup(&self, chain_id: u64) -> Option<Arc<ChainConfig>> {
        self.chains.get(&chain_id).cloned()
    }

    /// Registered and active, or `UnknownChain`.
    pub fn resolve_active(&self, chain_id: u64) -> EngineResult<Arc<ChainConfig>> {
        match self.chains.get(&chain_id) {
            Some(chain) if chain.active => Ok(Arc::clone(chain)),
            _ => Err(EngineError::UnknownChain(chain_id)),
        }
    }

    pub fn by_selector(&self, selector: u64) -> Option<Arc<ChainConfig>> {
        self.chains
            .values()
            .find(|c| c.bridge_selector == Some(selector))
            .cloned()
    }

    pub fn active_chains(&self) -> Vec<Arc<ChainConfig>> {
        self.chains.values().filter(|c| c.active).cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.chains.values().filter(|c| c.active).count()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn summaries(&self) -> Vec<ChainSummary> {
        self.chains
            .values()
            .map(|c| ChainSummary {
                chain_id: c.chain_id,
                name: c.name.clone(),
                explorer_url: c.explorer_url.clone(),
                native_symbol: c.native_currency.symbol.clone(),
                active: c.active,
                last_indexed_block: c.last_indexed_block.get(),
            })
            .collect()
    }
}
