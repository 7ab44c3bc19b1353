//! Composition root.
//!
//! [`SentinelEngine`] builds every component once, wires them together and
//! owns their background tasks. Surrounding code (an HTTP layer, a CLI, tests)
//! talks to the engine only through the methods here.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let engine = SentinelEngine::builder(Settings::new()?).build().await?;
//! engine.start().await?;
//! engine.register_contract("vault", "0x...", Arc::new(MyVault));
//! let health = engine.get_health();
//! engine.shutdown().await;
//! ```

use crate::automation::{AutomationExecutor, AutomationTrigger, ExecutionRecord, TriggerEngine};
use crate::broadcast_hub::{AlertRecord, BroadcastHub, HubEvent, SubscriberId};
use crate::cache::CacheLayer;
use crate::chain_provider::{ChainConnector, EthersConnector};
use crate::chain_registry::{ChainRegistry, ChainSummary};
use crate::contract_monitor::{
    ContractCapabilities, ContractMetrics, ContractMonitor, ContractSource, MonitorReport,
};
use crate::cross_chain::{BridgeTransport, CrossChainMessage, CrossChainTracker, SimulatedBridge};
use crate::errors::{EngineError, EngineResult};
use crate::indexer::{ChainIndexer, CycleOutcome, IndexerStats};
use crate::portfolio::{NativeBalancePortfolioSource, PortfolioSource};
use crate::price_feeds::{CoinGeckoPriceOracle, PriceOracle};
use crate::risk::RiskMetrics;
use crate::rpc_pool::ConnectorPool;
use crate::scheduler::TaskScheduler;
use crate::settings::Settings;
use anyhow::Context;
use log::{info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};

const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineHealth {
    pub healthy: bool,
    pub chains_connected: usize,
    pub chains_active: usize,
    pub tracked_contracts: usize,
    pub active_subscribers: usize,
    pub pending_messages: usize,
    pub cache_available: bool,
}

/// Injects capabilities; anything left unset gets the production default.
pub struct SentinelEngineBuilder {
    settings: Settings,
    connector: Option<Arc<dyn ChainConnector>>,
    cache: Option<Arc<CacheLayer>>,
    price_oracle: Option<Arc<dyn PriceOracle>>,
    portfolio_source: Option<Arc<dyn PortfolioSource>>,
    bridge: Option<Arc<dyn BridgeTransport>>,
    drain_timeout: Duration,
}

impl SentinelEngineBuilder {
    pub fn with_connector(mut self, connector: Arc<dyn ChainConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_cache(mut self, cache: Arc<CacheLayer>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_price_oracle(mut self, oracle: Arc<dyn PriceOracle>) -> Self {
        self.price_oracle = Some(oracle);
        self
    }

    pub fn with_portfolio_source(mut self, source: Arc<dyn PortfolioSource>) -> Self {
        self.portfolio_source = Some(source);
        self
    }

    pub fn with_bridge(mut self, bridge: Arc<dyn BridgeTransport>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// How long `shutdown` waits for background tasks before aborting them.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub async fn build(self) -> anyhow::Result<SentinelEngine> {
        let settings = self.settings;
        settings.validate().context("Invalid settings")?;

        let registry = Arc::new(ChainRegistry::from_settings(&settings.chains));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(EthersConnector));
        let pool = Arc::new(ConnectorPool::new(
            Arc::clone(&registry),
            connector,
            settings.rpc.clone(),
        ));

        let cache = match self.cache {
            Some(cache) => cache,
            None => Arc::new(CacheLayer::connect(settings.cache.clone()).await),
        };
        let hub = Arc::new(BroadcastHub::new(
            Arc::clone(&cache),
            settings.broadcast.clone(),
        ));

        let prices: Arc<dyn PriceOracle> = match self.price_oracle {
            Some(oracle) => oracle,
            None => Arc::new(
                CoinGeckoPriceOracle::new(&settings.price_feeds, Arc::clone(&cache))
                    .context("Failed to build price oracle")?,
            ),
        };
        let portfolio_source = self.portfolio_source.unwrap_or_else(|| {
            Arc::new(NativeBalancePortfolioSource::new(
                Arc::clone(&pool),
                Arc::clone(&prices),
            ))
        });

        let executor = Arc::new(AutomationExecutor::new(
            Arc::clone(&hub),
            settings.automation.history_limit,
        ));
        let triggers = Arc::new(TriggerEngine::new(executor));
        for rule in &settings.automation.triggers {
            triggers.install(rule.clone());
        }

        let monitor = Arc::new(ContractMonitor::new(
            settings.monitor.clone(),
            settings.rpc.request_timeout(),
            portfolio_source,
            Arc::clone(&triggers),
            Arc::clone(&hub),
            Arc::clone(&cache),
        ));

        let scheduler = Arc::new(TaskScheduler::new());
        let tracker = Arc::new(CrossChainTracker::new(
            Arc::clone(&registry),
            self.bridge.unwrap_or_else(|| Arc::new(SimulatedBridge)),
            Arc::clone(&scheduler),
            Duration::from_millis(settings.cross_chain.confirmation_delay_ms),
        ));

        let indexers = registry
            .active_chains()
            .into_iter()
            .map(|chain| {
                Arc::new(ChainIndexer::new(
                    chain,
                    Arc::clone(&pool),
                    Arc::clone(&hub),
                    Arc::clone(&cache),
                    settings.indexer.clone(),
                ))
            })
            .collect();

        let (shutdown, _) = watch::channel(false);
        info!(
            "🧩 Engine assembled: {} chains ({} active), cache {}",
            registry.len(),
            registry.active_count(),
            if cache.is_available() { "on" } else { "off" }
        );

        Ok(SentinelEngine {
            settings,
            registry,
            pool,
            cache,
            hub,
            prices,
            triggers,
            monitor,
            tracker,
            scheduler,
            indexers,
            shutdown,
            tasks: tokio::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            drain_timeout: self.drain_timeout,
        })
    }
}

pub struct SentinelEngine {
    settings: Settings,
    registry: Arc<ChainRegistry>,
    pool: Arc<ConnectorPool>,
    cache: Arc<CacheLayer>,
    hub: Arc<BroadcastHub>,
    prices: Arc<dyn PriceOracle>,
    triggers: Arc<TriggerEngine>,
    monitor: Arc<ContractMonitor>,
    tracker: Arc<CrossChainTracker>,
    scheduler: Arc<TaskScheduler>,
    indexers: Vec<Arc<ChainIndexer>>,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    drain_timeout: Duration,
}

impl SentinelEngine {
    pub fn builder(settings: Settings) -> SentinelEngineBuilder {
        SentinelEngineBuilder {
            settings,
            connector: None,
            cache: None,
            price_oracle: None,
            portfolio_source: None,
            bridge: None,
            drain_timeout: TASK_DRAIN_TIMEOUT,
        }
    }

    /// Connects every active chain, then starts one indexer task per chain and
    /// the monitor task. Fails only when no chain at all could be connected.
    pub async fn start(&self) -> EngineResult<usize> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(self.pool.connected_count());
        }
        let attempted = self.registry.active_count();
        let connected = self.pool.connect_all().await;
        if connected == 0 {
            self.started.store(false, Ordering::Release);
            return Err(EngineError::NoChainsConnected { attempted });
        }

        let mut tasks = self.tasks.lock().await;
        for indexer in &self.indexers {
            let rx = self.shutdown.subscribe();
            tasks.push(tokio::spawn(Arc::clone(indexer).run(rx)));
        }
        tasks.push(tokio::spawn(
            Arc::clone(&self.monitor).run(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(Arc::clone(&self.tracker).run_pruner(
            Duration::from_secs(self.settings.cross_chain.prune_interval_secs.max(1)),
            Duration::from_secs(self.settings.cross_chain.retention_secs),
            self.shutdown.subscribe(),
        )));

        info!(
            "🚀 Engine started: {}/{} chains connected, {} indexers",
            connected,
            attempted,
            self.indexers.len()
        );
        Ok(connected)
    }

    /// Stops producers (indexers, monitor, scheduled bridge work), waits for
    /// them, then closes subscribers and releases the connectors.
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down engine...");
        self.shutdown.send_replace(true);
        let cancelled = self.scheduler.shutdown();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        let count = tasks.len();
        let aborts: Vec<AbortHandle> = tasks.iter().map(|t| t.abort_handle()).collect();
        let mut joined = futures::future::join_all(tasks);
        if tokio::time::timeout(self.drain_timeout, &mut joined).await.is_err() {
            warn!(
                "⚠️ Background tasks did not stop within {:?}, aborting them",
                self.drain_timeout
            );
            for abort in &aborts {
                abort.abort();
            }
            // Nothing may touch the pool once it is released below
            joined.await;
        }

        self.hub.close();
        self.pool.disconnect_all();
        self.started.store(false, Ordering::Release);
        info!(
            "✅ Engine stopped ({} tasks joined, {} scheduled tasks cancelled)",
            count, cancelled
        );
    }

    // ==================== CONTRACTS & PORTFOLIOS ====================

    /// When no trigger rules are configured, the built-in rule set is installed
    /// for the contract.
    pub fn register_contract(
        &self,
        name: &str,
        address: &str,
        source: Arc<dyn ContractSource>,
    ) -> ContractCapabilities {
        let caps = self.monitor.register_contract(name, address, source);
        if self.settings.automation.triggers.is_empty() {
            self.triggers.install_defaults_for(address);
        }
        caps
    }

    pub fn unregister_contract(&self, name: &str) -> bool {
        self.monitor.unregister_contract(name)
    }

    pub fn track_portfolio(&self, address: &str) -> bool {
        self.monitor.track_portfolio(address)
    }

    pub fn untrack_portfolio(&self, address: &str) -> bool {
        self.monitor.untrack_portfolio(address)
    }

    pub fn list_contract_metrics(&self) -> Vec<ContractMetrics> {
        self.monitor.list_contract_metrics()
    }

    pub fn list_risk_metrics(&self) -> Vec<RiskMetrics> {
        self.monitor.list_risk_metrics()
    }

    /// Runs one monitoring cycle now, next to the periodic one.
    pub async fn run_monitor_cycle(&self) -> MonitorReport {
        self.monitor.run_cycle().await
    }

    // ==================== TRIGGERS ====================

    pub fn list_triggers(&self) -> Vec<AutomationTrigger> {
        self.triggers.list_triggers()
    }

    pub fn set_trigger_active(&self, trigger_id: &str, active: bool) -> bool {
        self.triggers.set_trigger_active(trigger_id, active)
    }

    pub fn execution_history(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.triggers.executor().execution_history(limit)
    }

    pub fn triggers(&self) -> &Arc<TriggerEngine> {
        &self.triggers
    }

    // ==================== CHAINS ====================

    pub fn chains(&self) -> Vec<ChainSummary> {
        self.registry.summaries()
    }

    pub fn indexer_stats(&self) -> Vec<IndexerStats> {
        self.indexers.iter().map(|i| i.stats()).collect()
    }

    pub async fn index_chain_once(&self, chain_id: u64) -> EngineResult<CycleOutcome> {
        let indexer = self
            .indexers
            .iter()
            .find(|i| i.chain_id() == chain_id)
            .ok_or(EngineError::UnknownChain(chain_id))?;
        indexer.index_once().await
    }

    // ==================== BROADCAST ====================

    pub fn subscribe(&self, sink: mpsc::Sender<HubEvent>) -> SubscriberId {
        self.hub.subscribe(sink)
    }

    pub fn subscribe_channel(&self) -> (SubscriberId, mpsc::Receiver<HubEvent>) {
        self.hub.subscribe_channel()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.hub.unsubscribe(id)
    }

    pub fn recent_alerts(&self) -> Vec<AlertRecord> {
        self.hub.recent_alerts()
    }

    // ==================== CROSS-CHAIN ====================

    pub fn send_cross_chain_message(
        &self,
        source_chain_id: u64,
        dest_chain_id: u64,
        payload: serde_json::Value,
    ) -> EngineResult<String> {
        self.tracker.send(source_chain_id, dest_chain_id, payload)
    }

    pub fn get_cross_chain_message_status(&self, id: &str) -> EngineResult<CrossChainMessage> {
        self.tracker.get_status(id)
    }

    pub fn list_cross_chain_messages(&self) -> Vec<CrossChainMessage> {
        self.tracker.list_messages()
    }

    pub fn cross_chain(&self) -> &Arc<CrossChainTracker> {
        &self.tracker
    }

    // ==================== HEALTH & ACCESSORS ====================

    pub fn get_health(&self) -> EngineHealth {
        EngineHealth {
            healthy: self.pool.is_healthy(),
            chains_connected: self.pool.connected_count(),
            chains_active: self.registry.active_count(),
            tracked_contracts: self.monitor.tracked_contracts(),
            active_subscribers: self.hub.subscriber_count(),
            pending_messages: self.tracker.pending_count(),
            cache_available: self.cache.is_available(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.pool.is_healthy()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ChainRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ConnectorPool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub fn prices(&self) -> &Arc<dyn PriceOracle> {
        &self.prices
    }
}
