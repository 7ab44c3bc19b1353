// Contract Monitor - periodic metrics, portfolio risk and trigger evaluation
// One cycle: collect contract metrics, score portfolios, evaluate triggers, broadcast.
// Snapshots are rebuilt per cycle and swapped whole, readers never see a half-written cycle.

use crate::automation::{EvaluationReport, TriggerEngine, TriggerSignals};
use crate::broadcast_hub::{BroadcastHub, HubEvent};
use crate::cache::CacheLayer;
use crate::metrics;
use crate::portfolio::PortfolioSource;
use crate::risk::RiskMetrics;
use crate::settings::MonitorSettings;
use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Score used for a metric whose call failed, and for a contract with nothing to score.
pub const FALLBACK_SCORE: f64 = 50.0;

/// Which optional metrics a contract exposes. Fixed at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCapabilities {
    pub total_value_locked: bool,
    pub active_positions: bool,
    pub hedge_stats: bool,
    pub gas_usage: bool,
    pub last_activity: bool,
    pub risk_score: bool,
}

impl ContractCapabilities {
    pub fn all() -> Self {
        Self {
            total_value_locked: true,
            active_positions: true,
            hedge_stats: true,
            gas_usage: true,
            last_activity: true,
            risk_score: true,
        }
    }

    pub fn count(&self) -> usize {
        [
            self.total_value_locked,
            self.active_positions,
            self.hedge_stats,
            self.gas_usage,
            self.last_activity,
            self.risk_score,
        ]
        .iter()
        .filter(|b| **b)
        .count()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HedgeStats {
    pub successful: u64,
    pub failed: u64,
}

fn unsupported(metric: &str) -> anyhow::Error {
    anyhow::anyhow!("{} not supported", metric)
}

/// Read-only surface of a monitored contract. Only the methods advertised in
/// [`ContractCapabilities`] are ever called.
#[async_trait]
pub trait ContractSource: Send + Sync {
    fn capabilities(&self) -> ContractCapabilities;

    /// Decimal string
    async fn total_value_locked(&self) -> Result<String> {
        Err(unsupported("total_value_locked"))
    }
    async fn active_positions(&self) -> Result<u64> {
        Err(unsupported("active_positions"))
    }
    async fn hedge_stats(&self) -> Result<HedgeStats> {
        Err(unsupported("hedge_stats"))
    }
    async fn average_gas_used(&self) -> Result<u64> {
        Err(unsupported("average_gas_used"))
    }
    async fn last_activity(&self) -> Result<DateTime<Utc>> {
        Err(unsupported("last_activity"))
    }
    /// 0..=100
    async fn risk_score(&self) -> Result<f64> {
        Err(unsupported("risk_score"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractMetrics {
    pub name: String,
    pub address: String,
    /// Decimal string
    pub tvl: String,
    pub active_positions: u64,
    pub successful_hedges: u64,
    pub failed_hedges: u64,
    pub avg_gas_used: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub risk_score: f64,
    pub performance_score: f64,
    pub updated_at: DateTime<Utc>,
}

struct RegisteredContract {
    seq: u64,
    name: String,
    address: String,
    capabilities: ContractCapabilities,
    source: Arc<dyn ContractSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorReport {
    pub contracts: usize,
    pub metric_failures: usize,
    pub portfolios: usize,
    pub portfolio_failures: usize,
    pub triggers: EvaluationReport,
    pub duration_ms: u64,
}

pub struct ContractMonitor {
    contracts: DashMap<String, Arc<RegisteredContract>>,
    portfolios: DashMap<String, DateTime<Utc>>,
    contract_metrics: ArcSwap<IndexMap<String, ContractMetrics>>,
    risk_metrics: ArcSwap<IndexMap<String, RiskMetrics>>,
    portfolio_source: Arc<dyn PortfolioSource>,
    triggers: Arc<TriggerEngine>,
    hub: Arc<BroadcastHub>,
    cache: Arc<CacheLayer>,
    settings: MonitorSettings,
    call_timeout: Duration,
    next_seq: AtomicU64,
    cycles: AtomicU64,
    cycle_lock: tokio::sync::Mutex<()>,
}

impl ContractMonitor {
    pub fn new(
        settings: MonitorSettings,
        call_timeout: Duration,
        portfolio_source: Arc<dyn PortfolioSource>,
        triggers: Arc<TriggerEngine>,
        hub: Arc<BroadcastHub>,
        cache: Arc<CacheLayer>,
    ) -> Self {
        let portfolios = DashMap::new();
        for address in &settings.portfolios {
            portfolios.insert(address.to_lowercase(), Utc::now());
        }
        Self {
            contracts: DashMap::new(),
            portfolios,
            contract_metrics: ArcSwap::from_pointee(IndexMap::new()),
            risk_metrics: ArcSwap::from_pointee(IndexMap::new()),
            portfolio_source,
            triggers,
            hub,
            cache,
            settings,
            call_timeout,
            next_seq: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Starts tracking `address` under `name`; a second registration under the
    /// same name replaces the first.
    pub fn register_contract(
        &self,
        name: &str,
        address: &str,
        source: Arc<dyn ContractSource>,
    ) -> ContractCapabilities {
        let capabilities = source.capabilities();
        let contract = RegisteredContract {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            address: address.to_lowercase(),
            capabilities,
            source,
        };
        self.contracts.insert(name.to_string(), Arc::new(contract));
        info!(
            "📋 Monitoring {} at {} ({}/6 metrics)",
            name,
            address,
            capabilities.count()
        );
        capabilities
    }

    pub fn unregister_contract(&self, name: &str) -> bool {
        let removed = self.contracts.remove(name).is_some();
        if removed {
            self.contract_metrics.rcu(|current| {
                let mut next = IndexMap::clone(current);
                next.shift_remove(name);
                next
            });
        }
        removed
    }

    pub fn track_portfolio(&self, address: &str) -> bool {
        self.portfolios
            .insert(address.to_lowercase(), Utc::now())
            .is_none()
    }

    pub fn untrack_portfolio(&self, address: &str) -> bool {
        let address = address.to_lowercase();
        let removed = self.portfolios.remove(&address).is_some();
        if removed {
            self.risk_metrics.rcu(|current| {
                let mut next = IndexMap::clone(current);
                next.shift_remove(&address);
                next
            });
        }
        removed
    }

    pub fn tracked_contracts(&self) -> usize {
        self.contracts.len()
    }

    pub fn tracked_portfolios(&self) -> Vec<String> {
        let mut v: Vec<String> = self.portfolios.iter().map(|e| e.key().clone()).collect();
        v.sort();
        v
    }

    /// Last completed cycle, never waits on the network.
    pub fn list_contract_metrics(&self) -> Vec<ContractMetrics> {
        self.contract_metrics.load().values().cloned().collect()
    }

    pub fn list_risk_metrics(&self) -> Vec<RiskMetrics> {
        self.risk_metrics.load().values().cloned().collect()
    }

    pub fn completed_cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(anyhow::anyhow!("timed out after {:?}", self.call_timeout)),
        }
    }

    /// Collects one contract's metrics. Returns the metrics and how many calls failed.
    async fn collect(&self, contract: &RegisteredContract) -> (ContractMetrics, usize) {
        let caps = contract.capabilities;
        let source = &contract.source;
        let mut failures = 0usize;
        let mut components: Vec<f64> = Vec::new();

        let note = |metric: &'static str, e: anyhow::Error| {
            debug!("{}.{} failed: {:#}", contract.name, metric, e);
            metrics::increment_metric_fallback(metric);
        };

        let mut tvl = "0".to_string();
        if caps.total_value_locked {
            match self.bounded(source.total_value_locked()).await {
                Ok(raw) => match Decimal::from_str(raw.trim()) {
                    Ok(d) => tvl = d.to_string(),
                    Err(e) => {
                        failures += 1;
                        note("total_value_locked", anyhow::anyhow!("not a decimal '{}': {}", raw, e));
                    }
                },
                Err(e) => {
                    failures += 1;
                    note("total_value_locked", e);
                }
            }
        }

        let mut active_positions = 0;
        if caps.active_positions {
            match self.bounded(source.active_positions()).await {
                Ok(n) => active_positions = n,
                Err(e) => {
                    failures += 1;
                    note("active_positions", e);
                }
            }
        }

        let mut hedges = HedgeStats::default();
        if caps.hedge_stats {
            match self.bounded(source.hedge_stats()).await {
                Ok(h) => {
                    hedges = h;
                    let total = h.successful + h.failed;
                    if total > 0 {
                        components.push(h.successful as f64 / total as f64 * 100.0);
                    }
                }
                Err(e) => {
                    failures += 1;
                    components.push(FALLBACK_SCORE);
                    note("hedge_stats", e);
                }
            }
        }

        let mut avg_gas_used = 0;
        if caps.gas_usage {
            match self.bounded(source.average_gas_used()).await {
                Ok(gas) => {
                    avg_gas_used = gas;
                    components.push(gas_efficiency(gas));
                }
                Err(e) => {
                    failures += 1;
                    components.push(FALLBACK_SCORE);
                    note("average_gas_used", e);
                }
            }
        }

        let mut last_activity = None;
        if caps.last_activity {
            match self.bounded(source.last_activity()).await {
                Ok(at) => {
                    last_activity = Some(at);
                    components.push(freshness(at, Utc::now()));
                }
                Err(e) => {
                    failures += 1;
                    components.push(FALLBACK_SCORE);
                    note("last_activity", e);
                }
            }
        }

        let performance_score = if components.is_empty() {
            FALLBACK_SCORE
        } else {
            round2(components.iter().sum::<f64>() / components.len() as f64)
        };

        let mut risk_score = round2(100.0 - performance_score);
        if caps.risk_score {
            match self.bounded(source.risk_score()).await {
                Ok(score) if score.is_finite() => risk_score = round2(score.clamp(0.0, 100.0)),
                Ok(score) => {
                    failures += 1;
                    note("risk_score", anyhow::anyhow!("non-finite score {}", score));
                }
                Err(e) => {
                    failures += 1;
                    note("risk_score", e);
                }
            }
        }

        let metrics = ContractMetrics {
            name: contract.name.clone(),
            address: contract.address.clone(),
            tvl,
            active_positions,
            successful_hedges: hedges.successful,
            failed_hedges: hedges.failed,
            avg_gas_used,
            last_activity,
            risk_score,
            performance_score,
            updated_at: Utc::now(),
        };
        (metrics, failures)
    }

    /// One full cycle. Concurrent callers queue behind each other.
    pub async fn run_cycle(&self) -> MonitorReport {
        let _cycle = self.cycle_lock.lock().await;
        let start = Instant::now();
        let mut report = MonitorReport::default();

        // Contracts
        let mut contracts: Vec<Arc<RegisteredContract>> =
            self.contracts.iter().map(|e| Arc::clone(e.value())).collect();
        contracts.sort_by_key(|c| c.seq);
        let collected =
            futures::future::join_all(contracts.iter().map(|c| self.collect(c))).await;

        let mut contract_map = IndexMap::with_capacity(collected.len());
        for (m, failures) in collected {
            report.metric_failures += failures;
            contract_map.insert(m.name.clone(), m);
        }
        report.contracts = contract_map.len();
        self.contract_metrics.store(Arc::new(contract_map));

        // Portfolios
        let portfolios = self.tracked_portfolios();
        let previous = self.risk_metrics.load_full();
        let snapshots = futures::future::join_all(
            portfolios
                .iter()
                .map(|address| self.bounded(self.portfolio_source.snapshot(address))),
        )
        .await;

        let mut risk_map = IndexMap::with_capacity(portfolios.len());
        for (address, snapshot) in portfolios.iter().zip(snapshots) {
            match snapshot {
                Ok(snapshot) => {
                    let risk = RiskMetrics::assess(address.clone(), snapshot.risk_inputs());
                    self.cache.set_portfolio_data(address, &snapshot).await;
                    self.cache.set_risk_data(address, &risk).await;
                    risk_map.insert(address.clone(), risk);
                }
                Err(e) => {
                    report.portfolio_failures += 1;
                    warn!("⚠️ Portfolio {} not refreshed: {:#}", address, e);
                    // Keep the last good assessment
                    if let Some(old) = previous.get(address) {
                        risk_map.insert(address.clone(), old.clone());
                    }
                }
            }
        }
        report.portfolios = risk_map.len();
        self.risk_metrics.store(Arc::new(risk_map));

        // Triggers
        let contract_snapshot = self.contract_metrics.load_full();
        let risk_snapshot = self.risk_metrics.load_full();
        let mut signals = TriggerSignals::default();
        for m in contract_snapshot.values() {
            signals = signals.with_contract_risk(&m.address, m.risk_score);
        }
        for r in risk_snapshot.values() {
            signals = signals.with_portfolio(r.clone());
        }
        report.triggers = self.triggers.evaluate_cycle(&signals).await;

        self.hub
            .publish(HubEvent::MetricsUpdate {
                contracts: contract_snapshot.values().cloned().collect(),
                risks: risk_snapshot.values().cloned().collect(),
                timestamp: Utc::now(),
            })
            .await;

        let duration = start.elapsed();
        metrics::record_monitor_cycle(duration);
        report.duration_ms = duration.as_millis() as u64;
        let n = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "📊 [Monitor #{}] {} contracts, {} portfolios, {} triggers fired in {:?}",
            n, report.contracts, report.portfolios, report.triggers.fired, duration
        );
        report
    }

    /// Runs a cycle every `monitor.interval_seconds` until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.settings.interval_seconds.max(1));
        info!("🚀 Starting contract monitor (interval {:?})", period);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("🛑 Contract monitor stopped");
    }
}

/// 0 gas scores 100, 500k gas or more scores 0.
fn gas_efficiency(gas: u64) -> f64 {
    (100.0 - gas as f64 / 5_000.0).clamp(0.0, 100.0)
}

/// 100 within the last hour, linear down to 0 at one week.
fn freshness(at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let hours = (now - at).num_seconds().max(0) as f64 / 3600.0;
    if hours <= 1.0 {
        100.0
    } else {
        (100.0 * (1.0 - hours / 168.0)).clamp(0.0, 100.0)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
