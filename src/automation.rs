//! Automation triggers and their execution.
//!
//! [`TriggerEngine`] owns the standing rules and evaluates them against the
//! latest risk signals; [`AutomationExecutor`] runs the handler for a fired
//! trigger, keeps a bounded execution history and reports every attempt to the
//! broadcast hub as an alert.
//!
//! Conditions combine with OR: a trigger fires as soon as any configured
//! condition is breached.

use crate::broadcast_hub::{AlertRecord, AlertSeverity, BroadcastHub, HubEvent};
use crate::errors::{EngineError, EngineResult};
use crate::metrics;
use crate::risk::RiskMetrics;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    StopLoss,
    Rebalance,
    VolatilityHedge,
    EmergencyExit,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::StopLoss => "STOP_LOSS",
            TriggerType::Rebalance => "REBALANCE",
            TriggerType::VolatilityHedge => "VOLATILITY_HEDGE",
            TriggerType::EmergencyExit => "EMERGENCY_EXIT",
        }
    }

    fn severity(&self, succeeded: bool) -> AlertSeverity {
        match (self, succeeded) {
            (TriggerType::EmergencyExit, _) => AlertSeverity::Critical,
            (_, false) => AlertSeverity::High,
            (TriggerType::StopLoss, true) => AlertSeverity::High,
            (TriggerType::Rebalance, true) | (TriggerType::VolatilityHedge, true) => {
                AlertSeverity::Warning
            }
        }
    }
}

/// Any subset of thresholds. Breach rules: risk and volatility at or above,
/// absolute 24h price change at or above, liquidity ratio strictly below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerConditions {
    #[serde(default)]
    pub risk_score_threshold: Option<f64>,
    #[serde(default)]
    pub price_change_pct_threshold: Option<f64>,
    #[serde(default)]
    pub volatility_threshold: Option<f64>,
    #[serde(default)]
    pub liquidity_ratio_threshold: Option<f64>,
}

impl TriggerConditions {
    pub fn is_empty(&self) -> bool {
        self.risk_score_threshold.is_none()
            && self.price_change_pct_threshold.is_none()
            && self.volatility_threshold.is_none()
            && self.liquidity_ratio_threshold.is_none()
    }

    /// Names of the breached conditions; non-empty means fire. A condition
    /// whose signal is unknown is never breached.
    pub fn breached(&self, input: &TriggerInput) -> Vec<&'static str> {
        let mut hits = Vec::new();
        if let Some(t) = self.risk_score_threshold {
            if input.risk_score >= t {
                hits.push("risk_score");
            }
        }
        if let (Some(t), Some(v)) = (self.price_change_pct_threshold, input.price_change_24h) {
            if v.abs() >= t {
                hits.push("price_change_pct");
            }
        }
        if let (Some(t), Some(v)) = (self.volatility_threshold, input.volatility_index) {
            if v >= t {
                hits.push("volatility");
            }
        }
        if let (Some(t), Some(v)) = (self.liquidity_ratio_threshold, input.liquidity_ratio) {
            if v < t {
                hits.push("liquidity_ratio");
            }
        }
        hits
    }
}

/// Configured rule, as found under `[[automation.triggers]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRule {
    pub id: String,
    pub contract_address: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub conditions: TriggerConditions,
    /// Portfolio whose volatility/liquidity/price signals feed the conditions
    #[serde(default)]
    pub portfolio: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Built-in rules applied to every registered contract when none are configured.
/// Ids are `<type>-<lowercased address>`, unique per contract and type.
pub fn default_triggers(contract_address: &str) -> Vec<TriggerRule> {
    let address = contract_address.to_lowercase();
    let rule = |kind: TriggerType, conditions: TriggerConditions| TriggerRule {
        id: format!("{}-{}", kind.as_str().to_lowercase(), address),
        contract_address: contract_address.to_string(),
        trigger_type: kind,
        conditions,
        portfolio: None,
        active: true,
    };
    vec![
        rule(
            TriggerType::StopLoss,
            TriggerConditions {
                risk_score_threshold: Some(80.0),
                price_change_pct_threshold: Some(15.0),
                ..Default::default()
            },
        ),
        rule(
            TriggerType::Rebalance,
            TriggerConditions {
                liquidity_ratio_threshold: Some(0.3),
                ..Default::default()
            },
        ),
        rule(
            TriggerType::VolatilityHedge,
            TriggerConditions {
                volatility_threshold: Some(25.0),
                ..Default::default()
            },
        ),
        rule(
            TriggerType::EmergencyExit,
            TriggerConditions {
                risk_score_threshold: Some(95.0),
                price_change_pct_threshold: Some(30.0),
                ..Default::default()
            },
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationTrigger {
    pub id: String,
    pub contract_address: String,
    pub trigger_type: TriggerType,
    pub conditions: TriggerConditions,
    pub portfolio: Option<String>,
    pub active: bool,
    pub last_triggered: Option<DateTime<Utc>>,
    pub execution_count: u64,
}

impl From<TriggerRule> for AutomationTrigger {
    fn from(rule: TriggerRule) -> Self {
        Self {
            id: rule.id,
            contract_address: rule.contract_address.to_lowercase(),
            trigger_type: rule.trigger_type,
            conditions: rule.conditions,
            portfolio: rule.portfolio.map(|p| p.to_lowercase()),
            active: rule.active,
            last_triggered: None,
            execution_count: 0,
        }
    }
}

/// Signals a trigger is evaluated against.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerInput {
    pub risk_score: f64,
    pub volatility_index: Option<f64>,
    pub liquidity_ratio: Option<f64>,
    pub price_change_24h: Option<f64>,
    pub portfolio_address: Option<String>,
}

/// Latest risk picture of one cycle, keyed by lowercase address.
#[derive(Debug, Clone, Default)]
pub struct TriggerSignals {
    pub contract_risk: HashMap<String, f64>,
    pub portfolios: HashMap<String, RiskMetrics>,
}

impl TriggerSignals {
    pub fn with_contract_risk(mut self, address: &str, risk_score: f64) -> Self {
        self.contract_risk.insert(address.to_lowercase(), risk_score);
        self
    }

    pub fn with_portfolio(mut self, risk: RiskMetrics) -> Self {
        self.portfolios
            .insert(risk.portfolio_address.to_lowercase(), risk);
        self
    }

    /// `None` when the trigger's target has no current risk score.
    ///
    /// The contract's own score wins; portfolio signals come from the rule's
    /// portfolio, or from a portfolio at the contract address itself.
    pub fn input_for(&self, trigger: &AutomationTrigger) -> Option<TriggerInput> {
        let portfolio = trigger
            .portfolio
            .as_deref()
            .and_then(|p| self.portfolios.get(p))
            .or_else(|| self.portfolios.get(&trigger.contract_address));

        let risk_score = self
            .contract_risk
            .get(&trigger.contract_address)
            .copied()
            .or_else(|| portfolio.map(|p| p.risk_score))?;

        Some(TriggerInput {
            risk_score,
            volatility_index: portfolio.map(|p| p.volatility_index),
            liquidity_ratio: portfolio.map(|p| p.liquidity_ratio),
            price_change_24h: portfolio.map(|p| p.price_change_24h),
            portfolio_address: portfolio.map(|p| p.portfolio_address.clone()),
        })
    }
}

// ============================================================================
// Execution
// ============================================================================

/// What a handler gets to act on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionContext {
    pub trigger_id: String,
    pub trigger_type: TriggerType,
    pub contract_address: String,
    pub portfolio_address: Option<String>,
    pub risk_score: f64,
    pub breached: Vec<&'static str>,
}

/// Side effect of one trigger type. The returned value describes the action taken.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> anyhow::Result<serde_json::Value>;
}

/// Closes the exposed positions.
pub struct StopLossHandler;

#[async_trait]
impl TriggerHandler for StopLossHandler {
    async fn execute(&self, ctx: &ExecutionContext) -> anyhow::Result<serde_json::Value> {
        info!(
            "🛑 STOP_LOSS on {} (risk {:.1}), closing positions",
            ctx.contract_address, ctx.risk_score
        );
        Ok(json!({ "action": "close_positions", "contract": ctx.contract_address }))
    }
}

/// Moves the portfolio back to its target weights.
pub struct RebalanceHandler;

#[async_trait]
impl TriggerHandler for RebalanceHandler {
    async fn execute(&self, ctx: &ExecutionContext) -> anyhow::Result<serde_json::Value> {
        info!(
            "⚖️ REBALANCE on {} for {:?}",
            ctx.contract_address, ctx.portfolio_address
        );
        Ok(json!({
            "action": "rebalance",
            "contract": ctx.contract_address,
            "portfolio": ctx.portfolio_address,
        }))
    }
}

/// Opens a hedge sized by the current risk score.
pub struct VolatilityHedgeHandler;

#[async_trait]
impl TriggerHandler for VolatilityHedgeHandler {
    async fn execute(&self, ctx: &ExecutionContext) -> anyhow::Result<serde_json::Value> {
        let hedge_ratio = (ctx.risk_score / 100.0).clamp(0.1, 1.0);
        info!(
            "🛡️ VOLATILITY_HEDGE on {}, hedging {:.0}%",
            ctx.contract_address,
            hedge_ratio * 100.0
        );
        Ok(json!({
            "action": "open_hedge",
            "contract": ctx.contract_address,
            "hedge_ratio": hedge_ratio,
        }))
    }
}

/// Withdraws everything.
pub struct EmergencyExitHandler;

#[async_trait]
impl TriggerHandler for EmergencyExitHandler {
    async fn execute(&self, ctx: &ExecutionContext) -> anyhow::Result<serde_json::Value> {
        warn!(
            "🚨 EMERGENCY_EXIT on {} (risk {:.1}, breached {:?})",
            ctx.contract_address, ctx.risk_score, ctx.breached
        );
        Ok(json!({ "action": "withdraw_all", "contract": ctx.contract_address }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub trigger_id: String,
    pub trigger_type: TriggerType,
    pub contract_address: String,
    pub portfolio_address: Option<String>,
    pub risk_score: f64,
    pub success: bool,
    pub detail: serde_json::Value,
    pub executed_at: DateTime<Utc>,
}

pub struct AutomationExecutor {
    handlers: DashMap<TriggerType, Arc<dyn TriggerHandler>>,
    history: Mutex<VecDeque<ExecutionRecord>>,
    history_limit: usize,
    hub: Arc<BroadcastHub>,
}

impl AutomationExecutor {
    pub fn new(hub: Arc<BroadcastHub>, history_limit: usize) -> Self {
        let handlers: DashMap<TriggerType, Arc<dyn TriggerHandler>> = DashMap::new();
        handlers.insert(TriggerType::StopLoss, Arc::new(StopLossHandler));
        handlers.insert(TriggerType::Rebalance, Arc::new(RebalanceHandler));
        handlers.insert(TriggerType::VolatilityHedge, Arc::new(VolatilityHedgeHandler));
        handlers.insert(TriggerType::EmergencyExit, Arc::new(EmergencyExitHandler));
        Self {
            handlers,
            history: Mutex::new(VecDeque::new()),
            history_limit,
            hub,
        }
    }

    pub fn set_handler(&self, trigger_type: TriggerType, handler: Arc<dyn TriggerHandler>) {
        self.handlers.insert(trigger_type, handler);
    }

    /// Runs the handler for `ctx`, records the attempt and emits an
    /// `automation_triggered` or `automation_failed` alert.
    pub async fn execute(&self, ctx: &ExecutionContext) -> EngineResult<serde_json::Value> {
        let handler = self
            .handlers
            .get(&ctx.trigger_type)
            .map(|h| Arc::clone(h.value()));
        let result = match handler {
            Some(handler) => handler.execute(ctx).await.map_err(|e| format!("{:#}", e)),
            None => Err(format!("no handler for {}", ctx.trigger_type.as_str())),
        };

        let success = result.is_ok();
        let detail = match &result {
            Ok(v) => v.clone(),
            Err(reason) => json!({ "error": reason }),
        };
        self.remember(ExecutionRecord {
            trigger_id: ctx.trigger_id.clone(),
            trigger_type: ctx.trigger_type,
            contract_address: ctx.contract_address.clone(),
            portfolio_address: ctx.portfolio_address.clone(),
            risk_score: ctx.risk_score,
            success,
            detail: detail.clone(),
            executed_at: Utc::now(),
        });

        let alert_type = if success {
            metrics::increment_trigger_fired(ctx.trigger_type.as_str());
            "automation_triggered"
        } else {
            metrics::increment_trigger_failure(ctx.trigger_type.as_str());
            "automation_failed"
        };
        let payload = json!({
            "trigger_id": ctx.trigger_id,
            "trigger_type": ctx.trigger_type,
            "contract_address": ctx.contract_address,
            "portfolio_address": ctx.portfolio_address,
            "risk_score": ctx.risk_score,
            "breached": ctx.breached,
            "result": detail,
        });
        let alert = AlertRecord::new(alert_type, ctx.trigger_type.severity(success), payload);
        self.hub.publish(HubEvent::Alert(alert)).await;

        result.map_err(|reason| EngineError::TriggerExecution {
            trigger_id: ctx.trigger_id.clone(),
            reason,
        })
    }

    fn remember(&self, record: ExecutionRecord) {
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        history.push_back(record);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    /// Most recent first.
    pub fn execution_history(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}

// ============================================================================
// Evaluation
// ============================================================================

struct TriggerSlot {
    seq: u64,
    // Held for the whole evaluate-execute-update sequence of one trigger
    eval_lock: tokio::sync::Mutex<()>,
    state: ArcSwap<AutomationTrigger>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationReport {
    pub evaluated: usize,
    pub fired: usize,
    pub failed: usize,
    /// Already being evaluated by another cycle
    pub busy: usize,
}

impl EvaluationReport {
    fn merge(&mut self, other: EvaluationReport) {
        self.evaluated += other.evaluated;
        self.fired += other.fired;
        self.failed += other.failed;
        self.busy += other.busy;
    }
}

pub struct TriggerEngine {
    slots: DashMap<String, Arc<TriggerSlot>>,
    next_seq: AtomicU64,
    executor: Arc<AutomationExecutor>,
}

impl TriggerEngine {
    pub fn new(executor: Arc<AutomationExecutor>) -> Self {
        Self {
            slots: DashMap::new(),
            next_seq: AtomicU64::new(0),
            executor,
        }
    }

    pub fn executor(&self) -> &Arc<AutomationExecutor> {
        &self.executor
    }

    /// Adds or replaces a rule. Replacing resets its counters.
    pub fn install(&self, rule: TriggerRule) {
        let trigger = AutomationTrigger::from(rule);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        debug!("Installing trigger {} ({})", trigger.id, trigger.trigger_type.as_str());
        self.slots.insert(
            trigger.id.clone(),
            Arc::new(TriggerSlot {
                seq,
                eval_lock: tokio::sync::Mutex::new(()),
                state: ArcSwap::from_pointee(trigger),
            }),
        );
    }

    /// Installs the built-in rules for `contract_address`, skipping any type the
    /// contract already has a trigger for.
    pub fn install_defaults_for(&self, contract_address: &str) -> usize {
        let address = contract_address.to_lowercase();
        let mut added = 0;
        for rule in default_triggers(contract_address) {
            let covered = self.slots.iter().any(|slot| {
                let t = slot.state.load();
                t.contract_address == address && t.trigger_type == rule.trigger_type
            });
            if !covered {
                self.install(rule);
                added += 1;
            }
        }
        added
    }

    pub fn remove(&self, trigger_id: &str) -> bool {
        self.slots.remove(trigger_id).is_some()
    }

    pub fn get(&self, trigger_id: &str) -> Option<AutomationTrigger> {
        self.slots
            .get(trigger_id)
            .map(|slot| (**slot.state.load()).clone())
    }

    /// Snapshot in installation order.
    pub fn list_triggers(&self) -> Vec<AutomationTrigger> {
        let mut slots: Vec<Arc<TriggerSlot>> =
            self.slots.iter().map(|e| Arc::clone(e.value())).collect();
        slots.sort_by_key(|s| s.seq);
        slots
            .iter()
            .map(|s| (**s.state.load()).clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn set_trigger_active(&self, trigger_id: &str, active: bool) -> bool {
        let Some(slot) = self.slots.get(trigger_id).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        slot.state.rcu(|current| {
            let mut next = AutomationTrigger::clone(current);
            next.active = active;
            next
        });
        info!(
            "🔧 Trigger {} {}",
            trigger_id,
            if active { "enabled" } else { "disabled" }
        );
        true
    }

    /// Evaluates every active trigger once. Contracts run concurrently, the
    /// triggers of one contract run in order.
    pub async fn evaluate_cycle(&self, signals: &TriggerSignals) -> EvaluationReport {
        let mut slots: Vec<Arc<TriggerSlot>> =
            self.slots.iter().map(|e| Arc::clone(e.value())).collect();
        slots.sort_by_key(|s| s.seq);

        let mut by_contract: indexmap::IndexMap<String, Vec<Arc<TriggerSlot>>> =
            indexmap::IndexMap::new();
        for slot in slots {
            let contract = slot.state.load().contract_address.clone();
            by_contract.entry(contract).or_default().push(slot);
        }

        let groups = by_contract.into_values().map(|group| async move {
            let mut report = EvaluationReport::default();
            for slot in group {
                report.merge(self.evaluate_slot(&slot, signals).await);
            }
            report
        });

        let mut total = EvaluationReport::default();
        for report in futures::future::join_all(groups).await {
            total.merge(report);
        }
        if total.fired > 0 || total.failed > 0 {
            info!(
                "⚡ Trigger cycle: {} evaluated, {} fired, {} failed",
                total.evaluated, total.fired, total.failed
            );
        }
        total
    }

    async fn evaluate_slot(&self, slot: &TriggerSlot, signals: &TriggerSignals) -> EvaluationReport {
        let mut report = EvaluationReport::default();
        let Ok(_guard) = slot.eval_lock.try_lock() else {
            report.busy = 1;
            return report;
        };

        let trigger = slot.state.load_full();
        if !trigger.active {
            return report;
        }
        let Some(input) = signals.input_for(&trigger) else {
            return report;
        };
        report.evaluated = 1;

        let breached = trigger.conditions.breached(&input);
        if breached.is_empty() {
            return report;
        }

        let ctx = ExecutionContext {
            trigger_id: trigger.id.clone(),
            trigger_type: trigger.trigger_type,
            contract_address: trigger.contract_address.clone(),
            portfolio_address: input.portfolio_address.clone(),
            risk_score: input.risk_score,
            breached,
        };
        match self.executor.execute(&ctx).await {
            Ok(_) => {
                let fired_at = Utc::now();
                slot.state.rcu(|current| {
                    let mut next = AutomationTrigger::clone(current);
                    next.last_triggered = Some(fired_at);
                    next.execution_count += 1;
                    next
                });
                report.fired = 1;
            }
            Err(e) => {
                error!("❌ {}", e);
                report.failed = 1;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLayer;
    use crate::settings::{BroadcastSettings, CacheSettings};
    use std::time::Duration;

    fn hub() -> Arc<BroadcastHub> {
        let cache = Arc::new(CacheLayer::in_memory(CacheSettings::default()));
        Arc::new(BroadcastHub::new(cache, BroadcastSettings::default()))
    }

    fn engine(hub: Arc<BroadcastHub>) -> TriggerEngine {
        TriggerEngine::new(Arc::new(AutomationExecutor::new(hub, 10)))
    }

    fn rule(id: &str, conditions: TriggerConditions) -> TriggerRule {
        TriggerRule {
            id: id.to_string(),
            contract_address: "0xVAULT".to_string(),
            trigger_type: TriggerType::StopLoss,
            conditions,
            portfolio: None,
            active: true,
        }
    }

    fn input(risk: f64, liquidity: Option<f64>) -> TriggerInput {
        TriggerInput {
            risk_score: risk,
            volatility_index: None,
            liquidity_ratio: liquidity,
            price_change_24h: None,
            portfolio_address: None,
        }
    }

    #[test]
    fn test_conditions_are_or_combined() {
        let conditions = TriggerConditions {
            risk_score_threshold: Some(80.0),
            liquidity_ratio_threshold: Some(0.3),
            ..Default::default()
        };
        assert_eq!(conditions.breached(&input(85.0, Some(0.9))), vec!["risk_score"]);
        assert_eq!(conditions.breached(&input(10.0, Some(0.1))), vec!["liquidity_ratio"]);
        // liquidity unknown, risk alone decides
        assert!(!conditions.breached(&input(85.0, None)).is_empty());
        assert!(conditions.breached(&input(79.9, Some(0.3))).is_empty());
        assert!(TriggerConditions::default().breached(&input(100.0, Some(0.0))).is_empty());
    }

    #[test]
    fn test_price_change_uses_magnitude() {
        let conditions = TriggerConditions {
            price_change_pct_threshold: Some(10.0),
            ..Default::default()
        };
        let mut i = input(0.0, None);
        i.price_change_24h = Some(-12.0);
        assert_eq!(conditions.breached(&i), vec!["price_change_pct"]);
    }

    #[tokio::test]
    async fn test_fire_updates_counter_and_alerts() {
        let hub = hub();
        let (_, mut rx) = hub.subscribe_channel();
        let engine = engine(Arc::clone(&hub));
        engine.install(rule("t1", TriggerConditions {
            risk_score_threshold: Some(80.0),
            ..Default::default()
        }));

        let calm = TriggerSignals::default().with_contract_risk("0xvault", 40.0);
        let report = engine.evaluate_cycle(&calm).await;
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.fired, 0);
        let t = engine.get("t1").unwrap();
        assert_eq!(t.execution_count, 0);
        assert!(t.last_triggered.is_none());

        let hot = TriggerSignals::default().with_contract_risk("0xVault", 85.0);
        assert_eq!(engine.evaluate_cycle(&hot).await.fired, 1);
        assert_eq!(engine.evaluate_cycle(&hot).await.fired, 1);
        let t = engine.get("t1").unwrap();
        assert_eq!(t.execution_count, 2);
        assert!(t.last_triggered.is_some());

        match rx.recv().await {
            Some(HubEvent::Alert(alert)) => {
                assert_eq!(alert.alert_type, "automation_triggered");
                assert_eq!(alert.payload["trigger_id"], "t1");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(engine.executor().execution_history(1).len(), 1);
    }

    struct FailingHandler;

    #[async_trait]
    impl TriggerHandler for FailingHandler {
        async fn execute(&self, _ctx: &ExecutionContext) -> anyhow::Result<serde_json::Value> {
            anyhow::bail!("router reverted")
        }
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let hub = hub();
        let engine = engine(Arc::clone(&hub));
        engine
            .executor()
            .set_handler(TriggerType::StopLoss, Arc::new(FailingHandler));
        let conditions = TriggerConditions {
            risk_score_threshold: Some(50.0),
            ..Default::default()
        };
        engine.install(rule("failing", conditions.clone()));
        engine.install(TriggerRule {
            trigger_type: TriggerType::Rebalance,
            ..rule("sibling", conditions)
        });

        let signals = TriggerSignals::default().with_contract_risk("0xvault", 90.0);
        let report = engine.evaluate_cycle(&signals).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.fired, 1);
        assert_eq!(engine.get("failing").unwrap().execution_count, 0);
        assert_eq!(engine.get("sibling").unwrap().execution_count, 1);

        let alerts = hub.recent_alerts();
        assert!(alerts.iter().any(|a| a.alert_type == "automation_failed"));
        let history = engine.executor().execution_history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|r| !r.success).count(), 1);
    }

    #[tokio::test]
    async fn test_disabled_trigger_is_not_evaluated() {
        let engine = engine(hub());
        engine.install(rule("t1", TriggerConditions {
            risk_score_threshold: Some(10.0),
            ..Default::default()
        }));
        assert!(engine.set_trigger_active("t1", false));
        assert!(!engine.set_trigger_active("missing", false));

        let signals = TriggerSignals::default().with_contract_risk("0xvault", 99.0);
        assert_eq!(engine.evaluate_cycle(&signals).await, EvaluationReport::default());
        assert!(!engine.get("t1").unwrap().active);
    }

    #[test]
    fn test_default_rule_set() {
        let rules = default_triggers("0xAbCdEf0123456789");
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0].id, "stop_loss-0xabcdef0123456789");
        assert!(rules.iter().all(|r| !r.conditions.is_empty()));

        let engine = engine(hub());
        assert_eq!(engine.install_defaults_for("0xAbCdEf0123456789"), 4);
        assert_eq!(engine.install_defaults_for("0xAbCdEf0123456789"), 0);
        assert_eq!(engine.list_triggers().len(), 4);
    }

    #[test]
    fn test_defaults_for_contracts_sharing_a_prefix() {
        let first = "0xAbC0000000000000000000000000000000000001";
        let second = "0xAbC0000000000000000000000000000000000002";
        let engine = engine(hub());
        assert_eq!(engine.install_defaults_for(first), 4);
        assert_eq!(engine.install_defaults_for(second), 4);

        let triggers = engine.list_triggers();
        assert_eq!(triggers.len(), 8);
        for address in [first, second] {
            let own = triggers
                .iter()
                .filter(|t| t.contract_address == address.to_lowercase())
                .count();
            assert_eq!(own, 4);
        }
    }

    #[test]
    fn test_defaults_skip_types_already_configured() {
        let engine = engine(hub());
        engine.install(rule("custom-stop", TriggerConditions {
            risk_score_threshold: Some(70.0),
            ..Default::default()
        }));
        // "0xVAULT" already has a STOP_LOSS rule
        assert_eq!(engine.install_defaults_for("0xVAULT"), 3);
        assert_eq!(engine.get("custom-stop").unwrap().conditions.risk_score_threshold, Some(70.0));
        assert!(engine.get("stop_loss-0xvault").is_none());
    }

    /// Holds every execution until released, and records how many overlap.
    #[derive(Default)]
    struct GatedHandler {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl TriggerHandler for GatedHandler {
        async fn execute(&self, _ctx: &ExecutionContext) -> anyhow::Result<serde_json::Value> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(json!({ "action": "gated" }))
        }
    }

    #[tokio::test]
    async fn test_trigger_busy_in_one_cycle_is_skipped_by_another() {
        let engine = engine(hub());
        let handler = Arc::new(GatedHandler::default());
        engine
            .executor()
            .set_handler(TriggerType::StopLoss, Arc::clone(&handler) as Arc<dyn TriggerHandler>);
        engine.install(rule("t1", TriggerConditions {
            risk_score_threshold: Some(50.0),
            ..Default::default()
        }));
        let signals = TriggerSignals::default().with_contract_risk("0xvault", 90.0);

        let (first, second) = tokio::join!(engine.evaluate_cycle(&signals), async {
            handler.entered.notified().await;
            let report = engine.evaluate_cycle(&signals).await;
            handler.release.notify_one();
            report
        });

        assert_eq!(first.fired, 1);
        assert_eq!(first.busy, 0);
        assert_eq!(second.busy, 1);
        assert_eq!(second.fired, 0);
        assert_eq!(engine.get("t1").unwrap().execution_count, 1);
        assert_eq!(engine.executor().execution_history(10).len(), 1);
    }

    /// Counts executions in flight at the same time.
    #[derive(Default)]
    struct OverlapHandler {
        in_flight: AtomicU64,
        max_in_flight: AtomicU64,
        per_contract: DashMap<String, u64>,
        max_per_contract: AtomicU64,
    }

    #[async_trait]
    impl TriggerHandler for OverlapHandler {
        async fn execute(&self, ctx: &ExecutionContext) -> anyhow::Result<serde_json::Value> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let mine = {
                let mut entry = self.per_contract.entry(ctx.contract_address.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            self.max_per_contract.fetch_max(mine, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(20)).await;

            if let Some(mut entry) = self.per_contract.get_mut(&ctx.contract_address) {
                *entry -= 1;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn test_one_contract_runs_its_triggers_in_order() {
        let engine = engine(hub());
        let handler = Arc::new(OverlapHandler::default());
        for kind in [TriggerType::StopLoss, TriggerType::Rebalance] {
            engine
                .executor()
                .set_handler(kind, Arc::clone(&handler) as Arc<dyn TriggerHandler>);
        }
        let conditions = TriggerConditions {
            risk_score_threshold: Some(50.0),
            ..Default::default()
        };
        for (id, contract, kind) in [
            ("a-stop", "0xa", TriggerType::StopLoss),
            ("a-rebalance", "0xa", TriggerType::Rebalance),
            ("b-stop", "0xb", TriggerType::StopLoss),
            ("b-rebalance", "0xb", TriggerType::Rebalance),
        ] {
            engine.install(TriggerRule {
                id: id.to_string(),
                contract_address: contract.to_string(),
                trigger_type: kind,
                conditions: conditions.clone(),
                portfolio: None,
                active: true,
            });
        }
        let signals = TriggerSignals::default()
            .with_contract_risk("0xa", 90.0)
            .with_contract_risk("0xb", 90.0);

        let report = engine.evaluate_cycle(&signals).await;
        assert_eq!(report.fired, 4);
        assert_eq!(handler.max_per_contract.load(Ordering::SeqCst), 1);
        // The two contracts did overlap
        assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rule_from_toml() {
        let toml = r#"
            id = "sl-1"
            contract_address = "0xABC"
            trigger_type = "STOP_LOSS"
            [conditions]
            risk_score_threshold = 80.0
        "#;
        let rule: TriggerRule = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert!(rule.active);
        assert_eq!(rule.trigger_type, TriggerType::StopLoss);
        assert_eq!(rule.conditions.risk_score_threshold, Some(80.0));
    }
}
