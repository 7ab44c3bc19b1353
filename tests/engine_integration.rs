// End-to-end engine behavior against scripted chains and an in-memory cache.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::types::U256;
use mig_sentinel::automation::{TriggerConditions, TriggerRule, TriggerType};
use mig_sentinel::broadcast_hub::HubEvent;
use mig_sentinel::cache::CacheLayer;
use mig_sentinel::chain_provider::{ChainConnector, ChainProvider, IndexedBlock};
use mig_sentinel::chain_registry::{ChainConfig, NativeCurrency};
use mig_sentinel::contract_monitor::{ContractCapabilities, ContractSource};
use mig_sentinel::cross_chain::MessageStatus;
use mig_sentinel::price_feeds::StaticPriceOracle;
use mig_sentinel::settings::ChainSettings;
use mig_sentinel::{EngineError, SentinelEngine, Settings};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const VAULT: &str = "0xAbC0000000000000000000000000000000000001";

struct ScriptedProvider {
    chain_id: u64,
    head: Arc<AtomicU64>,
    block_delay_ms: Arc<AtomicU64>,
    block_calls: Arc<AtomicU64>,
}

#[async_trait]
impl ChainProvider for ScriptedProvider {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block(&self, number: u64) -> Result<Option<IndexedBlock>> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.block_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(Some(IndexedBlock {
            chain_id: self.chain_id,
            number,
            hash: format!("0x{:064x}", number),
            timestamp: 1_700_000_000 + number,
            transactions: vec![format!("0x{:064x}", number * 1000)],
        }))
    }

    async fn balance(&self, _address: &str) -> Result<U256> {
        Ok(U256::exp10(18))
    }
}

/// Chains listed in `down` refuse every connection; the rest share one head.
struct ScriptedConnector {
    down: HashSet<u64>,
    head: Arc<AtomicU64>,
    block_delay_ms: Arc<AtomicU64>,
    block_calls: Arc<AtomicU64>,
}

impl ScriptedConnector {
    fn new(down: &[u64], head: u64) -> Self {
        Self {
            down: down.iter().copied().collect(),
            head: Arc::new(AtomicU64::new(head)),
            block_delay_ms: Arc::new(AtomicU64::new(0)),
            block_calls: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl ChainConnector for ScriptedConnector {
    async fn open(&self, chain: &ChainConfig) -> Result<Arc<dyn ChainProvider>> {
        if self.down.contains(&chain.chain_id) {
            return Err(anyhow!("connection refused"));
        }
        Ok(Arc::new(ScriptedProvider {
            chain_id: chain.chain_id,
            head: Arc::clone(&self.head),
            block_delay_ms: Arc::clone(&self.block_delay_ms),
            block_calls: Arc::clone(&self.block_calls),
        }))
    }
}

struct Vault {
    tvl: &'static str,
    risk: f64,
}

#[async_trait]
impl ContractSource for Vault {
    fn capabilities(&self) -> ContractCapabilities {
        ContractCapabilities {
            total_value_locked: true,
            active_positions: true,
            risk_score: true,
            ..Default::default()
        }
    }

    async fn total_value_locked(&self) -> Result<String> {
        Ok(self.tvl.to_string())
    }

    async fn active_positions(&self) -> Result<u64> {
        Ok(3)
    }

    async fn risk_score(&self) -> Result<f64> {
        Ok(self.risk)
    }
}

/// Its TVL call never finishes within a test.
struct StalledVault {
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl ContractSource for StalledVault {
    fn capabilities(&self) -> ContractCapabilities {
        ContractCapabilities {
            total_value_locked: true,
            ..Default::default()
        }
    }

    async fn total_value_locked(&self) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(3)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok("1".to_string())
    }
}

fn local_chain(chain_id: u64) -> ChainSettings {
    ChainSettings {
        chain_id,
        name: format!("Local {}", chain_id),
        rpc_url: format!("http://127.0.0.1:{}", 8545 + chain_id % 100),
        explorer_url: String::new(),
        bridge_router: None,
        bridge_selector: None,
        native_currency: NativeCurrency::default(),
        active: true,
    }
}

fn test_settings(chain_ids: &[u64]) -> Settings {
    let mut settings = Settings::with_defaults();
    settings.chains = chain_ids.iter().copied().map(local_chain).collect();
    settings.rpc.connect_retries = 0;
    settings.rpc.connect_timeout_ms = 500;
    settings.rpc.request_timeout_ms = 500;
    settings.rpc.qps_per_chain = 1_000;
    settings.indexer.interval_seconds = 3_600;
    settings.monitor.interval_seconds = 3_600;
    settings.cross_chain.confirmation_delay_ms = 50;
    settings
}

async fn build_engine(settings: Settings, connector: ScriptedConnector) -> SentinelEngine {
    let cache = Arc::new(CacheLayer::in_memory(settings.cache.clone()));
    SentinelEngine::builder(settings)
        .with_connector(Arc::new(connector))
        .with_cache(cache)
        .with_price_oracle(Arc::new(StaticPriceOracle::new().with_quote("ETH", 2_000.0, 1.5)))
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_partial_chain_failure_keeps_engine_healthy() {
    let settings = test_settings(&[1001, 1002, 1003, 1004]);
    let engine = build_engine(settings, ScriptedConnector::new(&[1002, 1004], 100)).await;

    let connected = engine.start().await.unwrap();
    assert_eq!(connected, 2);
    assert!(engine.is_healthy());

    let health = engine.get_health();
    assert!(health.healthy);
    assert_eq!(health.chains_connected, 2);
    assert_eq!(health.chains_active, 4);
    assert!(health.cache_available);

    engine.shutdown().await;
    assert!(!engine.is_healthy());
}

#[tokio::test]
async fn test_start_fails_when_no_chain_connects() {
    let settings = test_settings(&[1001, 1002]);
    let engine = build_engine(settings, ScriptedConnector::new(&[1001, 1002], 100)).await;

    match engine.start().await {
        Err(EngineError::NoChainsConnected { attempted }) => assert_eq!(attempted, 2),
        other => panic!("expected NoChainsConnected, got {:?}", other),
    }
    assert!(!engine.is_healthy());
}

#[tokio::test]
async fn test_monitor_cycle_keeps_tvl_scale() {
    let engine = build_engine(test_settings(&[1001]), ScriptedConnector::new(&[], 100)).await;
    engine.register_contract(
        "vault",
        VAULT,
        Arc::new(Vault {
            tvl: "1000.50",
            risk: 10.0,
        }),
    );

    let report = engine.run_monitor_cycle().await;
    assert_eq!(report.contracts, 1);
    assert_eq!(report.metric_failures, 0);

    let metrics = engine.list_contract_metrics();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].name, "vault");
    assert_eq!(metrics[0].tvl, "1000.50");
    assert_eq!(metrics[0].active_positions, 3);
    assert_eq!(metrics[0].risk_score, 10.0);
    assert_eq!(engine.get_health().tracked_contracts, 1);
}

#[tokio::test]
async fn test_stop_loss_fires_once_per_cycle_and_alerts() {
    let mut settings = test_settings(&[1001]);
    settings.automation.triggers = vec![TriggerRule {
        id: "vault-stop-loss".to_string(),
        contract_address: VAULT.to_string(),
        trigger_type: TriggerType::StopLoss,
        conditions: TriggerConditions {
            risk_score_threshold: Some(80.0),
            ..Default::default()
        },
        portfolio: None,
        active: true,
    }];
    let engine = build_engine(settings, ScriptedConnector::new(&[], 100)).await;
    let (_id, mut events) = engine.subscribe_channel();

    engine.register_contract(
        "vault",
        VAULT,
        Arc::new(Vault {
            tvl: "1",
            risk: 85.0,
        }),
    );
    let report = engine.run_monitor_cycle().await;
    assert_eq!(report.triggers.fired, 1);

    // Configured rules replace the built-in set
    let triggers = engine.list_triggers();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].execution_count, 1);
    assert!(triggers[0].last_triggered.is_some());

    assert!(engine
        .recent_alerts()
        .iter()
        .any(|a| a.alert_type == "automation_triggered"));

    let mut saw_alert = false;
    while let Ok(event) = events.try_recv() {
        if let HubEvent::Alert(alert) = event {
            saw_alert |= alert.alert_type == "automation_triggered";
        }
    }
    assert!(saw_alert);

    let history = engine.execution_history(10);
    assert_eq!(history.len(), 1);
    assert!(history[0].success);
    assert_eq!(history[0].contract_address, VAULT.to_lowercase());
}

#[tokio::test]
async fn test_disabled_trigger_does_not_fire() {
    let engine = build_engine(test_settings(&[1001]), ScriptedConnector::new(&[], 100)).await;
    engine.register_contract(
        "vault",
        VAULT,
        Arc::new(Vault {
            tvl: "1",
            risk: 99.0,
        }),
    );
    // Built-in rules: STOP_LOSS, REBALANCE, VOLATILITY_HEDGE, EMERGENCY_EXIT
    assert_eq!(engine.list_triggers().len(), 4);
    for trigger in engine.list_triggers() {
        assert!(engine.set_trigger_active(&trigger.id, false));
    }

    let report = engine.run_monitor_cycle().await;
    assert_eq!(report.triggers.fired, 0);
    assert!(engine.execution_history(10).is_empty());
}

#[tokio::test]
async fn test_cross_chain_message_reaches_confirmed() {
    let engine = build_engine(test_settings(&[1001, 1002]), ScriptedConnector::new(&[], 100)).await;

    let id = engine
        .send_cross_chain_message(1001, 1002, serde_json::json!({ "action": "rebalance" }))
        .unwrap();
    assert_eq!(
        engine.get_cross_chain_message_status(&id).unwrap().status,
        MessageStatus::Pending
    );
    assert_eq!(engine.get_health().pending_messages, 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let message = engine.get_cross_chain_message_status(&id).unwrap();
    assert_eq!(message.status, MessageStatus::Confirmed);
    assert!(message.tx_hash.is_some());
    assert_eq!(engine.get_health().pending_messages, 0);

    // Terminal states never move again
    assert!(engine.cross_chain().fail(&id, "late failure").is_err());
    assert_eq!(
        engine.get_cross_chain_message_status(&id).unwrap().status,
        MessageStatus::Confirmed
    );
}

#[tokio::test]
async fn test_cross_chain_rejects_unknown_chain() {
    let engine = build_engine(test_settings(&[1001]), ScriptedConnector::new(&[], 100)).await;
    assert!(matches!(
        engine.send_cross_chain_message(1001, 9999, serde_json::Value::Null),
        Err(EngineError::UnknownChain(9999))
    ));
    assert!(engine.list_cross_chain_messages().is_empty());
    assert!(matches!(
        engine.get_cross_chain_message_status("missing"),
        Err(EngineError::MessageNotFound(_))
    ));
}

#[tokio::test]
async fn test_indexer_cursor_only_moves_forward() {
    let connector = ScriptedConnector::new(&[], 100);
    let head = Arc::clone(&connector.head);
    let engine = build_engine(test_settings(&[1001]), connector).await;
    engine.start().await.unwrap();

    let cursor = |engine: &SentinelEngine| {
        engine
            .chains()
            .into_iter()
            .find(|c| c.chain_id == 1001)
            .map(|c| c.last_indexed_block)
            .unwrap()
    };
    assert_eq!(cursor(&engine), 100);

    head.store(105, Ordering::SeqCst);
    let outcome = engine.index_chain_once(1001).await.unwrap();
    assert_eq!(outcome.head, 105);
    assert_eq!(cursor(&engine), 105);

    // A lagging node must not pull the cursor back
    head.store(103, Ordering::SeqCst);
    let outcome = engine.index_chain_once(1001).await.unwrap();
    assert_eq!(outcome.indexed, 0);
    assert_eq!(cursor(&engine), 105);

    assert!(matches!(
        engine.index_chain_once(4242).await,
        Err(EngineError::UnknownChain(4242))
    ));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_subscribers_receive_blocks_until_unsubscribed() {
    let connector = ScriptedConnector::new(&[], 100);
    let head = Arc::clone(&connector.head);
    let engine = build_engine(test_settings(&[1001]), connector).await;
    engine.start().await.unwrap();

    let (id, mut events) = engine.subscribe_channel();
    assert_eq!(engine.get_health().active_subscribers, 1);

    head.store(102, Ordering::SeqCst);
    engine.index_chain_once(1001).await.unwrap();

    let mut blocks = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let HubEvent::BlockIndexed { block_number, .. } = event {
            blocks.push(block_number);
        }
    }
    assert_eq!(blocks, vec![101, 102]);

    assert!(engine.unsubscribe(id));
    assert!(!engine.unsubscribe(id));
    assert_eq!(engine.get_health().active_subscribers, 0);

    head.store(104, Ordering::SeqCst);
    engine.index_chain_once(1001).await.unwrap();
    assert!(events.try_recv().is_err());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_subscriber_channels() {
    let engine = build_engine(test_settings(&[1001]), ScriptedConnector::new(&[], 100)).await;
    engine.start().await.unwrap();
    let (_id, mut events) = engine.subscribe_channel();

    engine.shutdown().await;
    let closed = tokio::time::timeout(Duration::from_secs(1), async {
        while events.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());
    assert_eq!(engine.get_health().active_subscribers, 0);
}

#[tokio::test]
async fn test_shutdown_stops_indexer_mid_batch() {
    let connector = ScriptedConnector::new(&[], 100);
    let head = Arc::clone(&connector.head);
    let calls = Arc::clone(&connector.block_calls);
    connector.block_delay_ms.store(3_000, Ordering::SeqCst);

    let mut settings = test_settings(&[1001]);
    settings.rpc.request_timeout_ms = 10_000;
    let engine = build_engine(settings, connector).await;
    engine.start().await.unwrap();
    head.store(110, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let started = Instant::now();
    engine.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let after_shutdown = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after_shutdown);
    assert_eq!(engine.indexer_stats()[0].last_indexed_block, 100);
}

#[tokio::test]
async fn test_shutdown_aborts_tasks_past_drain_timeout() {
    let mut settings = test_settings(&[1001]);
    settings.rpc.request_timeout_ms = 10_000;
    let cache = Arc::new(CacheLayer::in_memory(settings.cache.clone()));
    let engine = SentinelEngine::builder(settings)
        .with_connector(Arc::new(ScriptedConnector::new(&[], 100)))
        .with_cache(cache)
        .with_price_oracle(Arc::new(StaticPriceOracle::new()))
        .with_drain_timeout(Duration::from_millis(300))
        .build()
        .await
        .unwrap();

    let finished = Arc::new(AtomicBool::new(false));
    engine.register_contract(
        "stalled",
        VAULT,
        Arc::new(StalledVault {
            finished: Arc::clone(&finished),
        }),
    );
    engine.start().await.unwrap();
    // Let the first monitor cycle get stuck on the TVL call
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    engine.shutdown().await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(2));

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert!(!finished.load(Ordering::SeqCst));
    assert!(engine.list_contract_metrics().is_empty());
}
