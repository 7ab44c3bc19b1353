// BroadcastHub - fan-out of block, metrics and alert events to live subscribers
// Subscribers hand in their own channel; delivery never waits on them.
// Events are mirrored to the cache pub/sub channels for other processes.

use crate::cache::CacheLayer;
use crate::contract_monitor::ContractMetrics;
use crate::metrics;
use crate::risk::RiskMetrics;
use crate::settings::BroadcastSettings;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

pub const BLOCKS_CHANNEL: &str = "sentinel:blocks";
pub const METRICS_CHANNEL: &str = "sentinel:metrics";
pub const ALERTS_CHANNEL: &str = "sentinel:alerts";
const RECENT_ALERTS_KEY: &str = "alerts:recent";
const RECENT_ALERTS_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AlertRecord {
    pub fn new(alert_type: impl Into<String>, severity: AlertSeverity, payload: serde_json::Value) -> Self {
        Self {
            alert_type: alert_type.into(),
            severity,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Everything the hub fans out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    BlockIndexed {
        chain_id: u64,
        block_number: u64,
        transactions: Vec<String>,
        timestamp: u64,
    },
    MetricsUpdate {
        contracts: Vec<ContractMetrics>,
        risks: Vec<RiskMetrics>,
        timestamp: DateTime<Utc>,
    },
    Alert(AlertRecord),
}

impl HubEvent {
    fn channel(&self) -> &'static str {
        match self {
            HubEvent::BlockIndexed { .. } => BLOCKS_CHANNEL,
            HubEvent::MetricsUpdate { .. } => METRICS_CHANNEL,
            HubEvent::Alert(_) => ALERTS_CHANNEL,
        }
    }
}

pub type SubscriberId = u64;

/// Best-effort, non-blocking fan-out.
///
/// A subscriber whose buffer is full misses the event; one whose receiver was
/// dropped is removed on the next delivery attempt.
pub struct BroadcastHub {
    subscribers: DashMap<SubscriberId, mpsc::Sender<HubEvent>>,
    next_id: AtomicU64,
    cache: Arc<CacheLayer>,
    recent_alerts: Mutex<VecDeque<AlertRecord>>,
    settings: BroadcastSettings,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl BroadcastHub {
    pub fn new(cache: Arc<CacheLayer>, settings: BroadcastSettings) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            cache,
            recent_alerts: Mutex::new(VecDeque::with_capacity(settings.recent_alerts)),
            settings,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Registers a caller-supplied channel.
    pub fn subscribe(&self, sink: mpsc::Sender<HubEvent>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self.closed.load(Ordering::Acquire) {
            // Dropping the sender tells the caller right away
            return id;
        }
        self.subscribers.insert(id, sink);
        metrics::set_broadcast_subscribers(self.subscribers.len());
        info!("📡 [BroadcastHub] Subscriber {} joined ({} live)", id, self.subscribers.len());
        id
    }

    /// Convenience: creates the channel with the configured buffer.
    pub fn subscribe_channel(&self) -> (SubscriberId, mpsc::Receiver<HubEvent>) {
        let (tx, rx) = mpsc::channel(self.settings.subscriber_buffer.max(1));
        (self.subscribe(tx), rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        metrics::set_broadcast_subscribers(self.subscribers.len());
        removed
    }

    /// Live subscribers, after dropping the ones that disconnected.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.retain(|_, tx| !tx.is_closed());
        let count = self.subscribers.len();
        metrics::set_broadcast_subscribers(count);
        count
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Delivers to every subscriber without waiting, then mirrors to the cache.
    /// Returns how many subscribers received the event.
    pub async fn publish(&self, event: HubEvent) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let delivered = self.fan_out(&event);

        if let HubEvent::Alert(alert) = &event {
            let snapshot = self.remember_alert(alert.clone());
            self.cache
                .set(RECENT_ALERTS_KEY, &snapshot, RECENT_ALERTS_TTL_SECS)
                .await;
        }
        self.cache.publish(event.channel(), &event).await;
        delivered
    }

    fn fan_out(&self, event: &HubEvent) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::increment_broadcast_dropped();
                }
                Err(TrySendError::Closed(_)) => dead.push(*entry.key()),
            }
        }
        // Removal happens after iteration, DashMap shards are still read-locked inside it
        for id in dead {
            self.subscribers.remove(&id);
            debug!("[BroadcastHub] Subscriber {} disconnected, removed", id);
        }
        if delivered == 0 {
            debug!("[BroadcastHub] {} event had no live subscribers", event.channel());
        }
        delivered
    }

    fn remember_alert(&self, alert: AlertRecord) -> Vec<AlertRecord> {
        let mut recent = self
            .recent_alerts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        recent.push_back(alert);
        while recent.len() > self.settings.recent_alerts {
            recent.pop_front();
        }
        recent.iter().cloned().collect()
    }

    /// Oldest first.
    pub fn recent_alerts(&self) -> Vec<AlertRecord> {
        self.recent_alerts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Stops delivery and drops every subscriber channel, so receivers observe the end of stream.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let count = self.subscribers.len();
        self.subscribers.clear();
        metrics::set_broadcast_subscribers(0);
        info!("📴 [BroadcastHub] Closed, {} subscribers released", count);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
