// Redis Manager - networked backing store for the cache layer
// Implements key/value with native TTL plus pub/sub fan-out
// Only compiled with the `redis` feature

use crate::cache::CacheStore;
use crate::errors::{EngineError, EngineResult};
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;

/// Redis-backed [`CacheStore`](crate::cache::CacheStore).
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    url: String,
}

fn unavailable(e: redis::RedisError) -> EngineError {
    EngineError::CacheUnavailable(e.to_string())
}

impl RedisStore {
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let client = Client::open(url).map_err(unavailable)?;
        let mut conn = ConnectionManager::new(client.clone())
            .await
            .map_err(unavailable)?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if pong != "PONG" {
            return Err(EngineError::CacheUnavailable(format!(
                "unexpected Redis response: {}",
                pong
            )));
        }

        info!("✅ Redis store connected to {}", url);
        Ok(Self {
            client,
            conn,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(unavailable)
    }

    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> EngineResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs.max(1))
            .await
            .map_err(unavailable)
    }

    async fn del(&self, key: &str) -> EngineResult<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await.map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> EngineResult<bool> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(unavailable)
    }

    async fn publish(&self, channel: &str, payload: String) -> EngineResult<usize> {
        let mut conn = self.conn.clone();
        let receivers: usize = conn.publish(channel, payload).await.map_err(unavailable)?;
        debug!("📡 Published to Redis channel {} ({} receivers)", channel, receivers);
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> EngineResult<mpsc::Receiver<String>> {
        // Pub/sub needs a dedicated connection, the manager can't be shared for it
        let mut pubsub = self
            .client
            .get_async_connection()
            .await
            .map_err(unavailable)?
            .into_pubsub();
        pubsub.subscribe(channel).await.map_err(unavailable)?;

        let (tx, rx) = mpsc::channel(1024);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping undecodable message on {}: {}", channel, e),
                }
            }
            debug!("Redis subscription to {} ended", channel);
        });
        Ok(rx)
    }
}
