//! # Cache Layer
//!
//! TTL key/value cache with namespaced helpers and a publish/subscribe channel.
//!
//! The layer is optional end-to-end: when no store is configured, or the store
//! errors or times out, writes become no-ops and reads become misses. Callers
//! never see [`EngineError::CacheUnavailable`]; they only observe more misses.
//!
//! ## Stores
//!
//! - [`MemoryStore`]: in-process store, lazy expiry on read
//! - `RedisStore` (feature `redis`): see [`crate::redis_manager`]

use crate::errors::{EngineError, EngineResult};
use crate::metrics;
use crate::settings::CacheSettings;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const NS_GENERIC: &str = "generic";
const NS_MULTI_CHAIN: &str = "multichain";
const NS_PORTFOLIO: &str = "portfolio";
const NS_RISK: &str = "risk";
const NS_PRICE: &str = "price";

/// Backing store of the cache layer. Values are opaque serialized strings.
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn name(&self) -> &'static str;
    async fn get(&self, key: &str) -> EngineResult<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> EngineResult<()>;
    async fn del(&self, key: &str) -> EngineResult<bool>;
    async fn exists(&self, key: &str) -> EngineResult<bool>;
    /// Returns how many receivers got the message, when the store can tell.
    async fn publish(&self, channel: &str, payload: String) -> EngineResult<usize>;
    async fn subscribe(&self, channel: &str) -> EngineResult<mpsc::Receiver<String>>;
}

/// What the layer actually writes to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub ttl_secs: u64,
    /// Unix milliseconds
    pub written_at: i64,
}

impl CacheEntry {
    pub fn new(value: serde_json::Value, ttl_secs: u64) -> Self {
        Self {
            value,
            ttl_secs,
            written_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms - self.written_at > (self.ttl_secs as i64) * 1000
    }
}

struct StoredValue {
    value: String,
    expires_at: Instant,
}

/// In-process store. Expired keys are removed when read.
pub struct MemoryStore {
    values: DashMap<String, StoredValue>,
    channels: DashMap<String, broadcast::Sender<String>>,
    channel_capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            channels: DashMap::new(),
            channel_capacity: 1024,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drops every expired key. Reads already do this lazily per key.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.values.len();
        self.values.retain(|_, v| v.expires_at > now);
        before - self.values.len()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let now = Instant::now();
        let expired = match self.values.get(key) {
            Some(v) if v.expires_at > now => return Ok(Some(v.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.values.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> EngineResult<()> {
        self.values.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> EngineResult<bool> {
        Ok(self.values.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> EngineResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn publish(&self, channel: &str, payload: String) -> EngineResult<usize> {
        // No receivers is not an error for pub/sub
        Ok(self.sender(channel).send(payload).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> EngineResult<mpsc::Receiver<String>> {
        let mut rx = self.sender(channel).subscribe();
        let (tx, out) = mpsc::channel(self.channel_capacity);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("MemoryStore subscriber lagged by {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }
}

/// Handle of a pub/sub subscription. Dropping it keeps the subscription alive; call
/// [`cancel`](Self::cancel) to stop it.
pub struct CacheSubscription {
    task: Option<JoinHandle<()>>,
}

impl CacheSubscription {
    pub fn is_active(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    pub fn cancel(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub available: bool,
}

/// Cache facade shared by every component. Construct once and pass it around in an `Arc`.
pub struct CacheLayer {
    store: Option<Arc<dyn CacheStore>>,
    settings: CacheSettings,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn CacheStore>, settings: CacheSettings) -> Self {
        Self {
            store: Some(store),
            settings,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Every write is a no-op and every read a miss.
    pub fn disabled(settings: CacheSettings) -> Self {
        Self {
            store: None,
            settings,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn in_memory(settings: CacheSettings) -> Self {
        Self::new(Arc::new(MemoryStore::new()), settings)
    }

    /// Picks the store from settings: Redis when a url is configured (and the
    /// `redis` feature is on), memory otherwise. An unreachable Redis leaves the
    /// layer disabled instead of failing startup.
    pub async fn connect(settings: CacheSettings) -> Self {
        match settings.redis_url.clone() {
            Some(url) => {
                #[cfg(feature = "redis")]
                {
                    match crate::redis_manager::RedisStore::connect(&url).await {
                        Ok(store) => return Self::new(Arc::new(store), settings),
                        Err(e) => {
                            warn!("⚠️ Redis unavailable at {} ({}), cache disabled", url, e);
                            return Self::disabled(settings);
                        }
                    }
                }
                #[cfg(not(feature = "redis"))]
                {
                    warn!(
                        "⚠️ cache.redis_url={} set but the redis feature is off, using memory store",
                        url
                    );
                    Self::in_memory(settings)
                }
            }
            None => {
                info!("Cache layer using in-process memory store");
                Self::in_memory(settings)
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            available: self.is_available(),
        }
    }

    /// Runs one store operation under the configured timeout.
    async fn guarded<T, F, Fut>(&self, op: &'static str, f: F) -> Option<T>
    where
        F: FnOnce(Arc<dyn CacheStore>) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let store = self.store.as_ref()?.clone();
        let timeout = Duration::from_millis(self.settings.op_timeout_ms);
        let result = match tokio::time::timeout(timeout, f(store)).await {
            Ok(r) => r,
            Err(_) => Err(EngineError::CacheUnavailable(format!("{} timed out", op))),
        };
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                debug!("Cache {} swallowed: {}", op, e);
                None
            }
        }
    }

    fn record(&self, namespace: &str, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::increment_cache_hit(namespace);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::increment_cache_miss(namespace);
        }
    }

    async fn read_entry(&self, namespace: &str, key: &str) -> Option<CacheEntry> {
        let raw = self
            .guarded("get", |s| {
                let key = key.to_string();
                async move { s.get(&key).await }
            })
            .await
            .flatten();
        let entry = raw.and_then(|r| serde_json::from_str::<CacheEntry>(&r).ok());
        if entry.is_none() {
            self.record(namespace, false);
        }
        entry
    }

    async fn get_in<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<T> {
        let entry = self.read_entry(namespace, key).await?;
        self.decode(namespace, entry)
    }

    fn decode<T: DeserializeOwned>(&self, namespace: &str, entry: CacheEntry) -> Option<T> {
        match serde_json::from_value(entry.value) {
            Ok(v) => {
                self.record(namespace, true);
                Some(v)
            }
            Err(e) => {
                debug!("Cache value in {} has unexpected shape: {}", namespace, e);
                self.record(namespace, false);
                None
            }
        }
    }

    async fn set_in<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!("Refusing to cache {}: {}", key, e);
                return;
            }
        };
        let entry = CacheEntry::new(value, ttl_secs);
        let Ok(raw) = serde_json::to_string(&entry) else {
            return;
        };
        self.guarded("set", |s| {
            let key = key.to_string();
            async move { s.set(&key, raw, ttl_secs).await }
        })
        .await;
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_in(NS_GENERIC, key).await
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        self.set_in(key, value, ttl_secs).await
    }

    pub async fn del(&self, key: &str) -> bool {
        self.guarded("del", |s| {
            let key = key.to_string();
            async move { s.del(&key).await }
        })
        .await
        .unwrap_or(false)
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.guarded("exists", |s| {
            let key = key.to_string();
            async move { s.exists(&key).await }
        })
        .await
        .unwrap_or(false)
    }

    // ==================== NAMESPACES ====================

    pub async fn set_multi_chain_data<T: Serialize>(&self, chain_id: u64, value: &T) {
        let key = format!("{}:{}", NS_MULTI_CHAIN, chain_id);
        self.set_in(&key, value, self.settings.multi_chain_ttl_secs).await
    }

    /// Besides the store TTL, the entry's own write timestamp is checked so an
    /// entry the store failed to expire is still treated as a miss and removed.
    pub async fn get_multi_chain_data<T: DeserializeOwned>(&self, chain_id: u64) -> Option<T> {
        let key = format!("{}:{}", NS_MULTI_CHAIN, chain_id);
        let entry = self.read_entry(NS_MULTI_CHAIN, &key).await?;
        if entry.is_expired_at(chrono::Utc::now().timestamp_millis()) {
            debug!("Multi-chain entry {} outlived its TTL in the store, evicting", key);
            self.del(&key).await;
            self.record(NS_MULTI_CHAIN, false);
            return None;
        }
        self.decode(NS_MULTI_CHAIN, entry)
    }

    pub async fn set_portfolio_data<T: Serialize>(&self, address: &str, value: &T) {
        let key = format!("{}:{}", NS_PORTFOLIO, address.to_lowercase());
        self.set_in(&key, value, self.settings.portfolio_ttl_secs).await
    }

    pub async fn get_portfolio_data<T: DeserializeOwned>(&self, address: &str) -> Option<T> {
        let key = format!("{}:{}", NS_PORTFOLIO, address.to_lowercase());
        self.get_in(NS_PORTFOLIO, &key).await
    }

    pub async fn set_risk_data<T: Serialize>(&self, address: &str, value: &T) {
        let key = format!("{}:{}", NS_RISK, address.to_lowercase());
        self.set_in(&key, value, self.settings.risk_ttl_secs).await
    }

    pub async fn get_risk_data<T: DeserializeOwned>(&self, address: &str) -> Option<T> {
        let key = format!("{}:{}", NS_RISK, address.to_lowercase());
        self.get_in(NS_RISK, &key).await
    }

    pub async fn set_price_data<T: Serialize>(&self, symbol: &str, value: &T) {
        let key = format!("{}:{}", NS_PRICE, symbol.to_uppercase());
        self.set_in(&key, value, self.settings.price_ttl_secs).await
    }

    pub async fn get_price_data<T: DeserializeOwned>(&self, symbol: &str) -> Option<T> {
        let key = format!("{}:{}", NS_PRICE, symbol.to_uppercase());
        self.get_in(NS_PRICE, &key).await
    }

    // ==================== PUB/SUB ====================

    pub async fn publish<T: Serialize>(&self, channel: &str, data: &T) -> usize {
        let Ok(payload) = serde_json::to_string(data) else {
            return 0;
        };
        self.guarded("publish", |s| {
            let channel = channel.to_string();
            async move { s.publish(&channel, payload).await }
        })
        .await
        .unwrap_or(0)
    }

    /// Runs `handler` for every message on `channel` until cancelled. With no
    /// store the returned subscription is inert.
    pub async fn subscribe<F>(&self, channel: &str, handler: F) -> CacheSubscription
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let rx = self
            .guarded("subscribe", |s| {
                let channel = channel.to_string();
                async move { s.subscribe(&channel).await }
            })
            .await;
        let Some(mut rx) = rx else {
            return CacheSubscription { task: None };
        };
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                handler(msg);
            }
        });
        CacheSubscription { task: Some(task) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn get(&self, _key: &str) -> EngineResult<Option<String>> {
            Err(EngineError::CacheUnavailable("down".into()))
        }
        async fn set(&self, _key: &str, _value: String, _ttl: u64) -> EngineResult<()> {
            Err(EngineError::CacheUnavailable("down".into()))
        }
        async fn del(&self, _key: &str) -> EngineResult<bool> {
            Err(EngineError::CacheUnavailable("down".into()))
        }
        async fn exists(&self, _key: &str) -> EngineResult<bool> {
            Err(EngineError::CacheUnavailable("down".into()))
        }
        async fn publish(&self, _channel: &str, _payload: String) -> EngineResult<usize> {
            Err(EngineError::CacheUnavailable("down".into()))
        }
        async fn subscribe(&self, _channel: &str) -> EngineResult<mpsc::Receiver<String>> {
            Err(EngineError::CacheUnavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn test_get_after_set() {
        let cache = CacheLayer::in_memory(CacheSettings::default());
        cache.set("k", &"v".to_string(), 60).await;
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("v"));
        assert!(cache.exists("k").await);
        assert!(cache.del("k").await);
        assert!(cache.get::<String>("k").await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = CacheLayer::new(store.clone(), CacheSettings::default());
        cache.set("short", &42u32, 1).await;
        assert_eq!(cache.get::<u32>("short").await, Some(42));

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(cache.get::<u32>("short").await.is_none());
        // lazily removed on read
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_and_broken_are_misses() {
        let disabled = CacheLayer::disabled(CacheSettings::default());
        disabled.set("k", &1u8, 60).await;
        assert!(disabled.get::<u8>("k").await.is_none());
        assert!(!disabled.exists("k").await);
        assert_eq!(disabled.publish("chan", &1u8).await, 0);

        let broken = CacheLayer::new(Arc::new(BrokenStore), CacheSettings::default());
        broken.set_risk_data("0xabc", &1u8).await;
        assert!(broken.get_risk_data::<u8>("0xabc").await.is_none());
        assert_eq!(broken.stats().misses, 1);
        assert!(!broken.subscribe("chan", |_| {}).await.is_active());
    }

    #[tokio::test]
    async fn test_multi_chain_checks_write_timestamp() {
        let store = Arc::new(MemoryStore::new());
        let cache = CacheLayer::new(store.clone(), CacheSettings::default());

        // Store keeps it for an hour but the entry itself says 1s, written a minute ago
        let mut stale = CacheEntry::new(serde_json::json!({"head": 10}), 1);
        stale.written_at -= 60_000;
        store
            .set("multichain:1", serde_json::to_string(&stale).unwrap(), 3600)
            .await
            .unwrap();

        assert!(cache.get_multi_chain_data::<serde_json::Value>(1).await.is_none());
        assert!(!store.exists("multichain:1").await.unwrap());

        cache.set_multi_chain_data(2, &serde_json::json!({"head": 11})).await;
        let fresh: serde_json::Value = cache.get_multi_chain_data(2).await.unwrap();
        assert_eq!(fresh["head"], 11);
    }

    #[tokio::test]
    async fn test_pubsub_roundtrip() {
        let cache = CacheLayer::in_memory(CacheSettings::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = cache
            .subscribe("alerts", move |msg| {
                let _ = tx.send(msg);
            })
            .await;
        assert!(sub.is_active());

        cache.publish("alerts", &serde_json::json!({"severity": "high"})).await;
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(got.contains("high"));
        sub.cancel();
    }
}
