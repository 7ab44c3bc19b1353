// src/rpc_pool.rs

use crate::chain_provider::{ChainConnector, ChainProvider, IndexedBlock};
use crate::chain_registry::{ChainConfig, ChainRegistry};
use crate::errors::{EngineError, EngineResult};
use crate::metrics;
use crate::settings::Rpc;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use std::future::Future;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

type DefaultDirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Live, rate-limited connection to one chain.
///
/// Every call is bounded by the configured request timeout; a timeout or remote
/// failure surfaces as [`EngineError::TransientRpc`].
pub struct ConnectorHandle {
    chain: Arc<ChainConfig>,
    provider: Arc<dyn ChainProvider>,
    limiter: Arc<DefaultDirectRateLimiter>,
    timeout: Duration,
    connected_at: DateTime<Utc>,
}

impl std::fmt::Debug for ConnectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorHandle")
            .field("chain_id", &self.chain.chain_id)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

impl ConnectorHandle {
    pub fn chain(&self) -> &Arc<ChainConfig> {
        &self.chain
    }

    pub fn chain_id(&self) -> u64 {
        self.chain.chain_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    async fn call<T, Fut>(&self, method: &'static str, fut: Fut) -> EngineResult<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.limiter.until_ready().await;
        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, fut).await;
        let duration = start.elapsed();
        metrics::record_rpc_call_latency(self.chain.chain_id, method, duration);

        let outcome = match result {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!("timed out after {:?}", self.timeout)),
        };

        outcome.map_err(|reason| {
            metrics::increment_rpc_errors(self.chain.chain_id, method);
            debug!(
                "[RPC_TRACE] chain {} -> {} failed in {:?}: {}",
                self.chain.chain_id, method, duration, reason
            );
            EngineError::TransientRpc {
                chain_id: self.chain.chain_id,
                method,
                reason,
            }
        })
    }

    pub async fn current_block_height(&self) -> EngineResult<u64> {
        self.call("eth_blockNumber", self.provider.block_number()).await
    }

    pub async fn get_block(&self, number: u64) -> EngineResult<IndexedBlock> {
        self.call("eth_getBlockByNumber", self.provider.block(number))
            .await?
            .ok_or(EngineError::BlockNotFound {
                chain_id: self.chain.chain_id,
                block_number: number,
            })
    }

    /// Native balance in whole units (e.g. ETH, not wei).
    pub async fn native_balance(&self, address: &str) -> EngineResult<Decimal> {
        let raw = self.call("eth_getBalance", self.provider.balance(address)).await?;
        let decimals = self.chain.native_currency.decimals as u32;
        let formatted = ethers::utils::format_units(raw, decimals).map_err(|e| {
            EngineError::TransientRpc {
                chain_id: self.chain.chain_id,
                method: "eth_getBalance",
                reason: e.to_string(),
            }
        })?;
        Decimal::from_str(&formatted)
            .map(|d| d.normalize())
            .map_err(|e| EngineError::TransientRpc {
                chain_id: self.chain.chain_id,
                method: "eth_getBalance",
                reason: format!("balance {} not representable: {}", formatted, e),
            })
    }
}

/// One connector per active chain.
///
/// Chains connect independently: a failure on one never blocks the others, and
/// the pool counts as healthy as soon as a single chain is connected.
///
/// ## Usage
///
/// ```rust,ignore
/// let pool = Arc::new(ConnectorPool::new(registry, Arc::new(EthersConnector), settings.rpc.clone()));
/// let connected = pool.connect_all().await;
/// let height = pool.handle(11155111).unwrap().current_block_height().await?;
/// ```
pub struct ConnectorPool {
    registry: Arc<ChainRegistry>,
    connector: Arc<dyn ChainConnector>,
    handles: DashMap<u64, Arc<ConnectorHandle>>,
    settings: Rpc,
}

impl ConnectorPool {
    pub fn new(registry: Arc<ChainRegistry>, connector: Arc<dyn ChainConnector>, settings: Rpc) -> Self {
        Self {
            registry,
            connector,
            handles: DashMap::new(),
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<ChainRegistry> {
        &self.registry
    }

    /// Connects every active chain in parallel and returns how many succeeded.
    pub async fn connect_all(self: &Arc<Self>) -> usize {
        let chains = self.registry.active_chains();
        let attempted = chains.len();
        let mut set = JoinSet::new();
        for chain in chains {
            let pool = Arc::clone(self);
            set.spawn(async move {
                let chain_id = chain.chain_id;
                (chain_id, pool.connect_chain(chain_id).await)
            });
        }

        let mut connected = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(_))) => connected += 1,
                Ok((chain_id, Err(e))) => {
                    warn!("⚠️ Chain {} failed to connect: {}", chain_id, e);
                }
                Err(e) => warn!("⚠️ Connect task aborted: {}", e),
            }
        }

        metrics::set_chains_connected(self.handles.len());
        info!("🔗 Connected {}/{} chains", connected, attempted);
        connected
    }

    /// Connects (or reconnects) a single chain. On first success the chain's
    /// cursor starts at the current head.
    pub async fn connect_chain(&self, chain_id: u64) -> EngineResult<Arc<ConnectorHandle>> {
        let chain = self.registry.resolve_active(chain_id)?;
        let connect_timeout = self.settings.connect_timeout();

        let strategy = ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.settings.connect_retries);

        let provider = Retry::spawn(strategy, || {
            let chain = Arc::clone(&chain);
            let connector = Arc::clone(&self.connector);
            async move {
                let attempt = async {
                    let provider = connector.open(&chain).await?;
                    let remote_id = provider.chain_id().await?;
                    if remote_id != chain.chain_id {
                        anyhow::bail!(
                            "endpoint reports chain id {} (expected {})",
                            remote_id,
                            chain.chain_id
                        );
                    }
                    Ok::<_, anyhow::Error>(provider)
                };
                match tokio::time::timeout(connect_timeout, attempt).await {
                    Ok(r) => r,
                    Err(_) => Err(anyhow::anyhow!("timed out after {:?}", connect_timeout)),
                }
            }
        })
        .await
        .map_err(|e| EngineError::Connection {
            chain_id,
            reason: format!("{:#}", e),
        })?;

        let qps = NonZeroU32::new(self.settings.qps_per_chain)
            .ok_or_else(|| EngineError::Config("rpc.qps_per_chain must be non-zero".into()))?;
        let handle = Arc::new(ConnectorHandle {
            chain: Arc::clone(&chain),
            provider,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(qps))),
            timeout: self.settings.request_timeout(),
            connected_at: Utc::now(),
        });

        let head = handle
            .current_block_height()
            .await
            .map_err(|e| EngineError::Connection {
                chain_id,
                reason: e.to_string(),
            })?;
        if chain.last_indexed_block.initialize(head) {
            debug!("Chain {} cursor initialized at block {}", chain_id, head);
        }

        self.handles.insert(chain_id, Arc::clone(&handle));
        metrics::set_chains_connected(self.handles.len());
        info!("✅ Connected to {} ({}) at block {}", chain.name, chain_id, head);
        Ok(handle)
    }

    /// Returns the live handle, connecting the chain first if it has none.
    pub async fn reconnect(&self, chain_id: u64) -> EngineResult<Arc<ConnectorHandle>> {
        match self.handle(chain_id) {
            Some(handle) => Ok(handle),
            None => self.connect_chain(chain_id).await,
        }
    }

    pub fn handle(&self, chain_id: u64) -> Option<Arc<ConnectorHandle>> {
        self.handles.get(&chain_id).map(|h| Arc::clone(h.value()))
    }

    pub fn is_healthy(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.handles.len()
    }

    pub fn connected_chains(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.handles.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn disconnect(&self, chain_id: u64) -> bool {
        let removed = self.handles.remove(&chain_id).is_some();
        metrics::set_chains_connected(self.handles.len());
        removed
    }

    pub fn disconnect_all(&self) {
        let count = self.handles.len();
        self.handles.clear();
        metrics::set_chains_connected(0);
        info!("🔌 Released {} chain connectors", count);
    }

    /// Native balance of `address` on every connected chain. Chains that fail are left out.
    pub async fn native_balances(&self, address: &str) -> Vec<(Arc<ChainConfig>, Decimal)> {
        let handles: Vec<Arc<ConnectorHandle>> =
            self.handles.iter().map(|e| Arc::clone(e.value())).collect();
        let lookups = handles.iter().map(|h| async move {
            match h.native_balance(address).await {
                Ok(balance) => Some((Arc::clone(h.chain()), balance)),
                Err(e) => {
                    debug!("Balance lookup for {} on {} failed: {}", address, h.chain_id(), e);
                    None
                }
            }
        });
        futures::future::join_all(lookups)
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ChainSettings;
    use anyhow::Result;
    use async_trait::async_trait;
    use ethers::types::U256;

    struct FixedProvider {
        reported_id: u64,
        stall: bool,
    }

    #[async_trait]
    impl ChainProvider for FixedProvider {
        async fn chain_id(&self) -> Result<u64> {
            Ok(self.reported_id)
        }
        async fn block_number(&self) -> Result<u64> {
            if self.stall {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(500)
        }
        async fn block(&self, _number: u64) -> Result<Option<IndexedBlock>> {
            Ok(None)
        }
        async fn balance(&self, _address: &str) -> Result<U256> {
            // 1.5 units at 18 decimals
            Ok(U256::from(15u64) * U256::exp10(17))
        }
    }

    /// Chain 2 refuses, chain 3 reports the wrong id, the rest connect.
    struct MixedConnector;

    #[async_trait]
    impl ChainConnector for MixedConnector {
        async fn open(&self, chain: &ChainConfig) -> Result<Arc<dyn ChainProvider>> {
            match chain.chain_id {
                2 => anyhow::bail!("connection refused"),
                3 => Ok(Arc::new(FixedProvider {
                    reported_id: 999,
                    stall: false,
                })),
                id => Ok(Arc::new(FixedProvider {
                    reported_id: id,
                    stall: false,
                })),
            }
        }
    }

    fn pool(ids: &[u64]) -> Arc<ConnectorPool> {
        let chains: Vec<ChainSettings> = ids
            .iter()
            .map(|&id| ChainSettings {
                chain_id: id,
                name: format!("chain-{}", id),
                rpc_url: "http://127.0.0.1:8545".to_string(),
                explorer_url: String::new(),
                bridge_router: None,
                bridge_selector: None,
                native_currency: Default::default(),
                active: true,
            })
            .collect();
        let registry = Arc::new(ChainRegistry::from_settings(&chains));
        let settings = Rpc {
            connect_retries: 0,
            request_timeout_ms: 100,
            ..Rpc::default()
        };
        Arc::new(ConnectorPool::new(registry, Arc::new(MixedConnector), settings))
    }

    #[tokio::test]
    async fn test_partial_failure_isolated() {
        let pool = pool(&[1, 2, 3, 4]);
        assert!(!pool.is_healthy());

        assert_eq!(pool.connect_all().await, 2);
        assert!(pool.is_healthy());
        assert_eq!(pool.connected_chains(), vec![1, 4]);

        match pool.connect_chain(3).await {
            Err(EngineError::Connection { chain_id, reason }) => {
                assert_eq!(chain_id, 3);
                assert!(reason.contains("999"));
            }
            other => panic!("expected a connection error, got {:?}", other),
        }
        assert!(matches!(
            pool.connect_chain(77).await,
            Err(EngineError::UnknownChain(77))
        ));
    }

    #[tokio::test]
    async fn test_connect_initializes_cursor_once() {
        let pool = pool(&[1]);
        pool.connect_all().await;
        let chain = pool.registry().lookup(1).unwrap();
        assert_eq!(chain.last_indexed_block.get(), 500);

        chain.last_indexed_block.advance(510);
        pool.disconnect(1);
        pool.reconnect(1).await.unwrap();
        assert_eq!(chain.last_indexed_block.get(), 510);
    }

    #[tokio::test]
    async fn test_native_balance_in_whole_units() {
        let pool = pool(&[1, 4]);
        pool.connect_all().await;

        let balance = pool.handle(1).unwrap().native_balance("0x0").await.unwrap();
        assert_eq!(balance.to_string(), "1.5");
        assert_eq!(pool.native_balances("0x0").await.len(), 2);

        pool.disconnect_all();
        assert!(!pool.is_healthy());
        assert!(pool.native_balances("0x0").await.is_empty());
    }

    #[tokio::test]
    async fn test_slow_call_is_transient() {
        let chain = Arc::new(ChainConfig::from(&ChainSettings {
            chain_id: 9,
            name: "slow".to_string(),
            rpc_url: "http://127.0.0.1:8545".to_string(),
            explorer_url: String::new(),
            bridge_router: None,
            bridge_selector: None,
            native_currency: Default::default(),
            active: true,
        }));
        let handle = ConnectorHandle {
            chain,
            provider: Arc::new(FixedProvider {
                reported_id: 9,
                stall: true,
            }),
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(10).unwrap(),
            ))),
            timeout: Duration::from_millis(50),
            connected_at: Utc::now(),
        };

        let err = handle.current_block_height().await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, EngineError::TransientRpc { method: "eth_blockNumber", .. }));
    }
}
