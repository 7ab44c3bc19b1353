use crate::automation::TriggerRule;
use crate::chain_registry::{NativeCurrency, DEFAULT_CHAINS};
use crate::errors::EngineError;
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::Path;
use std::time::Duration;

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainSettings {
    pub chain_id: u64,
    pub name: String,
    pub rpc_url: String,
    #[serde(default)]
    pub explorer_url: String,
    #[serde(default)]
    pub bridge_router: Option<String>,
    #[serde(default)]
    pub bridge_selector: Option<u64>,
    #[serde(default)]
    pub native_currency: NativeCurrency,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    /// Upper bound for every single RPC call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: usize,
    /// Per-chain request budget
    #[serde(default = "default_qps_per_chain")]
    pub qps_per_chain: u32,
}

fn default_request_timeout_ms() -> u64 {
    5_000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_connect_retries() -> usize {
    2
}
fn default_qps_per_chain() -> u32 {
    10
}

impl Default for Rpc {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_retries: default_connect_retries(),
            qps_per_chain: default_qps_per_chain(),
        }
    }
}

impl Rpc {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerSettings {
    #[serde(default = "default_indexer_interval_seconds")]
    pub interval_seconds: u64,
    /// Max blocks fetched per cycle. The cursor still jumps to the head after the batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
}

fn default_indexer_interval_seconds() -> u64 {
    30
}
fn default_batch_size() -> u64 {
    10
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_indexer_interval_seconds(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorSettings {
    #[serde(default = "default_monitor_interval_seconds")]
    pub interval_seconds: u64,
    /// Portfolio addresses scored on every cycle
    #[serde(default)]
    pub portfolios: Vec<String>,
}

fn default_monitor_interval_seconds() -> u64 {
    60
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_monitor_interval_seconds(),
            portfolios: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AutomationSettings {
    /// Empty means the built-in rule set
    #[serde(default)]
    pub triggers: Vec<TriggerRule>,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    500
}

impl Default for AutomationSettings {
    fn default() -> Self {
        Self {
            triggers: Vec::new(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    /// When unset the in-process store is used
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_cache_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_multi_chain_ttl_secs")]
    pub multi_chain_ttl_secs: u64,
    #[serde(default = "default_portfolio_ttl_secs")]
    pub portfolio_ttl_secs: u64,
    #[serde(default = "default_risk_ttl_secs")]
    pub risk_ttl_secs: u64,
    #[serde(default = "default_price_ttl_secs")]
    pub price_ttl_secs: u64,
}

fn default_cache_op_timeout_ms() -> u64 {
    2_000
}
fn default_ttl_secs() -> u64 {
    300
}
fn default_multi_chain_ttl_secs() -> u64 {
    30
}
fn default_portfolio_ttl_secs() -> u64 {
    300
}
fn default_risk_ttl_secs() -> u64 {
    120
}
fn default_price_ttl_secs() -> u64 {
    60
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            op_timeout_ms: default_cache_op_timeout_ms(),
            default_ttl_secs: default_ttl_secs(),
            multi_chain_ttl_secs: default_multi_chain_ttl_secs(),
            portfolio_ttl_secs: default_portfolio_ttl_secs(),
            risk_ttl_secs: default_risk_ttl_secs(),
            price_ttl_secs: default_price_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BroadcastSettings {
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default = "default_recent_alerts")]
    pub recent_alerts: usize,
}

fn default_subscriber_buffer() -> usize {
    256
}
fn default_recent_alerts() -> usize {
    100
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            recent_alerts: default_recent_alerts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrossChainSettings {
    #[serde(default = "default_confirmation_delay_ms")]
    pub confirmation_delay_ms: u64,
    /// How long confirmed/failed messages stay queryable
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
}

fn default_confirmation_delay_ms() -> u64 {
    5_000
}

fn default_retention_secs() -> u64 {
    3_600
}

fn default_prune_interval_secs() -> u64 {
    300
}

impl Default for CrossChainSettings {
    fn default() -> Self {
        Self {
            confirmation_delay_ms: default_confirmation_delay_ms(),
            retention_secs: default_retention_secs(),
            prune_interval_secs: default_prune_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PriceFeeds {
    #[serde(default = "default_coingecko_base_url")]
    pub coingecko_base_url: String,
    #[serde(default = "default_price_timeout_ms")]
    pub timeout_ms: u64,
    /// Symbol -> CoinGecko id
    #[serde(default = "default_symbol_ids")]
    pub symbol_ids: HashMap<String, String>,
}

fn default_coingecko_base_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}
fn default_price_timeout_ms() -> u64 {
    3_000
}
fn default_symbol_ids() -> HashMap<String, String> {
    [
        ("ETH", "ethereum"),
        ("POL", "polygon-ecosystem-token"),
        ("MATIC", "matic-network"),
        ("LINK", "chainlink"),
        ("USDC", "usd-coin"),
    ]
    .into_iter()
    .map(|(s, id)| (s.to_string(), id.to_string()))
    .collect()
}

impl Default for PriceFeeds {
    fn default() -> Self {
        Self {
            coingecko_base_url: default_coingecko_base_url(),
            timeout_ms: default_price_timeout_ms(),
            symbol_ids: default_symbol_ids(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[default]
    #[serde(rename = "pretty")]
    Pretty,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// Empty means the built-in testnet table
    #[serde(default)]
    pub chains: Vec<ChainSettings>,
    #[serde(default)]
    pub rpc: Rpc,
    #[serde(default)]
    pub indexer: IndexerSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub automation: AutomationSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub broadcast: BroadcastSettings,
    #[serde(default)]
    pub cross_chain: CrossChainSettings,
    #[serde(default)]
    pub price_feeds: PriceFeeds,
    #[serde(default)]
    pub log: LogSettings,
}

impl Settings {
    /// Loads `Config.toml` from the working directory plus environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_path("Config.toml")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides();
        settings.ensure_chains();
        Ok(settings)
    }

    /// Defaults only, with the built-in chain table. Useful for tests and embedding.
    pub fn with_defaults() -> Self {
        let mut settings = Self::default();
        settings.ensure_chains();
        settings
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("SENTINEL_REDIS_URL") {
            let trimmed = url.trim();
            if !trimmed.is_empty() {
                self.cache.redis_url = Some(trimmed.to_string());
            }
        }

        if let Ok(level) = env::var("SENTINEL_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.log.level = level.trim().to_string();
            }
        }

        if let Ok(raw) = env::var("SENTINEL_PORTFOLIOS") {
            let list = parse_string_list(&raw);
            if !list.is_empty() {
                self.monitor.portfolios = list;
            }
        }

        // SENTINEL_RPC_<chain_id> replaces one endpoint, applied after the table is known
        self.ensure_chains();
        for chain in self.chains.iter_mut() {
            if let Ok(url) = env::var(format!("SENTINEL_RPC_{}", chain.chain_id)) {
                let trimmed = url.trim();
                if !trimmed.is_empty() {
                    chain.rpc_url = trimmed.to_string();
                }
            }
        }
    }

    fn ensure_chains(&mut self) {
        if self.chains.is_empty() {
            self.chains = DEFAULT_CHAINS.clone();
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.indexer.batch_size == 0 {
            return Err(EngineError::Config("indexer.batch_size must be non-zero".into()));
        }
        if self.indexer.interval_seconds == 0 || self.monitor.interval_seconds == 0 {
            return Err(EngineError::Config("intervals must be non-zero".into()));
        }
        if self.rpc.qps_per_chain == 0 {
            return Err(EngineError::Config("rpc.qps_per_chain must be non-zero".into()));
        }
        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(EngineError::Config(format!(
                    "duplicate chain id {}",
                    chain.chain_id
                )));
            }
            if url::Url::parse(&chain.rpc_url).is_err() {
                return Err(EngineError::Config(format!(
                    "chain {} has an invalid rpc_url {}",
                    chain.chain_id, chain.rpc_url
                )));
            }
        }
        Ok(())
    }
}

/// Accepts `a,b,c` or a JSON array of strings.
fn parse_string_list(input: &str) -> Vec<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return vec![];
    }
    if trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Vec<String>>(trimmed) {
            return v;
        }
    }
    trimmed
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
