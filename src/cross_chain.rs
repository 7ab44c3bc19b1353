//! Outbound cross-chain messages.
//!
//! [`CrossChainTracker::send`] validates both chains, records the message as
//! `pending` and returns its id right away. The bridge attempt and the later
//! confirmation run on the [`TaskScheduler`], so shutting the scheduler down
//! stops both.
//!
//! Status only moves forward:
//!
//! ```text
//! pending ──> sent ──> confirmed
//!    │          │
//!    └──────────┴────> failed
//! ```
//!
//! (`pending -> confirmed` is also accepted for bridges that confirm directly.)

use crate::chain_registry::{ChainConfig, ChainRegistry};
use crate::errors::{EngineError, EngineResult};
use crate::metrics;
use crate::scheduler::{shutdown_signalled, TaskScheduler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Confirmed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Confirmed => "confirmed",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Confirmed | MessageStatus::Failed)
    }

    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Sent) | (Pending, Confirmed) | (Pending, Failed) | (Sent, Confirmed) | (Sent, Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossChainMessage {
    pub id: String,
    pub source_chain_id: u64,
    pub dest_chain_id: u64,
    pub payload: serde_json::Value,
    pub status: MessageStatus,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Performs the network side of a send and returns the source-chain tx hash.
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    async fn dispatch(
        &self,
        message: &CrossChainMessage,
        source: &ChainConfig,
        dest: &ChainConfig,
    ) -> anyhow::Result<String>;
}

/// Accepts everything and hands back a random tx hash.
#[derive(Debug, Default, Clone)]
pub struct SimulatedBridge;

#[async_trait]
impl BridgeTransport for SimulatedBridge {
    async fn dispatch(
        &self,
        message: &CrossChainMessage,
        source: &ChainConfig,
        dest: &ChainConfig,
    ) -> anyhow::Result<String> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let tx_hash = format!("0x{}", hex::encode(bytes));
        info!(
            "🌉 Simulated bridge {} -> {} (selector {:?}) for {}: {}",
            source.name, dest.name, dest.bridge_selector, message.id, tx_hash
        );
        Ok(tx_hash)
    }
}

pub struct CrossChainTracker {
    registry: Arc<ChainRegistry>,
    messages: DashMap<String, CrossChainMessage>,
    transport: Arc<dyn BridgeTransport>,
    scheduler: Arc<TaskScheduler>,
    confirmation_delay: Duration,
}

impl CrossChainTracker {
    pub fn new(
        registry: Arc<ChainRegistry>,
        transport: Arc<dyn BridgeTransport>,
        scheduler: Arc<TaskScheduler>,
        confirmation_delay: Duration,
    ) -> Self {
        Self {
            registry,
            messages: DashMap::new(),
            transport,
            scheduler,
            confirmation_delay,
        }
    }

    /// Records a `pending` message and returns its id without waiting on the bridge.
    /// Both chains must be known and active, otherwise nothing is recorded.
    pub fn send(
        self: &Arc<Self>,
        source_chain_id: u64,
        dest_chain_id: u64,
        payload: serde_json::Value,
    ) -> EngineResult<String> {
        let source = self.registry.resolve_active(source_chain_id)?;
        let dest = self.registry.resolve_active(dest_chain_id)?;

        let now = Utc::now();
        let message = CrossChainMessage {
            id: Uuid::new_v4().to_string(),
            source_chain_id,
            dest_chain_id,
            payload,
            status: MessageStatus::Pending,
            tx_hash: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let id = message.id.clone();
        self.messages.insert(id.clone(), message);
        metrics::increment_cross_chain_messages(MessageStatus::Pending.as_str());
        info!("📨 Cross-chain message {} queued: {} -> {}", id, source.name, dest.name);

        let tracker = Arc::downgrade(self);
        let task_id = id.clone();
        let scheduled = self.scheduler.schedule(Duration::ZERO, async move {
            dispatch(tracker, task_id, source, dest).await;
        });
        if scheduled.is_none() {
            let _ = self.fail(&id, "tracker is shutting down");
        }
        Ok(id)
    }

    pub fn get_status(&self, id: &str) -> EngineResult<CrossChainMessage> {
        self.messages
            .get(id)
            .map(|m| m.value().clone())
            .ok_or_else(|| EngineError::MessageNotFound(id.to_string()))
    }

    /// Oldest first.
    pub fn list_messages(&self) -> Vec<CrossChainMessage> {
        let mut all: Vec<CrossChainMessage> =
            self.messages.iter().map(|m| m.value().clone()).collect();
        all.sort_by_key(|m| m.created_at);
        all
    }

    pub fn pending_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| !m.status.is_terminal())
            .count()
    }

    fn transition<F>(&self, id: &str, next: MessageStatus, apply: F) -> EngineResult<CrossChainMessage>
    where
        F: FnOnce(&mut CrossChainMessage),
    {
        let mut entry = self
            .messages
            .get_mut(id)
            .ok_or_else(|| EngineError::MessageNotFound(id.to_string()))?;
        let current = entry.status;
        if !current.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                id: id.to_string(),
                from: current.as_str(),
                to: next.as_str(),
            });
        }
        entry.status = next;
        entry.updated_at = Utc::now();
        apply(entry.value_mut());
        metrics::increment_cross_chain_messages(next.as_str());
        Ok(entry.value().clone())
    }

    pub fn mark_sent(&self, id: &str, tx_hash: String) -> EngineResult<CrossChainMessage> {
        self.transition(id, MessageStatus::Sent, |m| m.tx_hash = Some(tx_hash))
    }

    pub fn confirm(&self, id: &str) -> EngineResult<CrossChainMessage> {
        let message = self.transition(id, MessageStatus::Confirmed, |_| {})?;
        info!("✅ Cross-chain message {} confirmed", id);
        Ok(message)
    }

    pub fn fail(&self, id: &str, reason: &str) -> EngineResult<CrossChainMessage> {
        let message = self.transition(id, MessageStatus::Failed, |m| {
            m.error = Some(reason.to_string())
        })?;
        warn!("⚠️ Cross-chain message {} failed: {}", id, reason);
        Ok(message)
    }

    /// Drops confirmed/failed messages last touched more than `older_than` ago.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(older_than) else {
            return 0;
        };
        let cutoff = Utc::now() - age;
        let before = self.messages.len();
        self.messages
            .retain(|_, m| !(m.status.is_terminal() && m.updated_at < cutoff));
        before - self.messages.len()
    }

    /// Prunes finished messages older than `retention` every `period` until shutdown.
    pub async fn run_pruner(
        self: Arc<Self>,
        period: Duration,
        retention: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pruned = self.prune_finished(retention);
                    if pruned > 0 {
                        debug!("🧹 Pruned {} finished cross-chain messages", pruned);
                    }
                }
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }
    }
}

async fn dispatch(
    tracker: Weak<CrossChainTracker>,
    id: String,
    source: Arc<ChainConfig>,
    dest: Arc<ChainConfig>,
) {
    let Some(this) = tracker.upgrade() else {
        return;
    };
    let Ok(message) = this.get_status(&id) else {
        return;
    };

    match this.transport.dispatch(&message, &source, &dest).await {
        Ok(tx_hash) => {
            if let Err(e) = this.mark_sent(&id, tx_hash) {
                warn!("⚠️ {}", e);
                return;
            }
            let weak = Arc::downgrade(&this);
            let confirm_id = id.clone();
            this.scheduler.schedule(this.confirmation_delay, async move {
                if let Some(tracker) = weak.upgrade() {
                    if let Err(e) = tracker.confirm(&confirm_id) {
                        warn!("⚠️ {}", e);
                    }
                }
            });
        }
        Err(e) => {
            let _ = this.fail(&id, &format!("{:#}", e));
        }
    }
}
