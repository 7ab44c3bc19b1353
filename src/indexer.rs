// src/indexer.rs
//
// Per-chain block indexer. Each cycle reads the head, fetches at most
// `batch_size` blocks after the cursor in ascending order, then moves the cursor
// to the head. Blocks between the end of the batch and the head are skipped,
// not queued; they are counted in `skipped_blocks`.

use crate::broadcast_hub::{BroadcastHub, HubEvent};
use crate::cache::CacheLayer;
use crate::chain_provider::IndexedBlock;
use crate::chain_registry::ChainConfig;
use crate::errors::EngineResult;
use crate::metrics;
use crate::rpc_pool::{ConnectorHandle, ConnectorPool};
use crate::scheduler::shutdown_signalled;
use crate::settings::IndexerSettings;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    Disconnected,
    Connecting,
    Synced,
    /// Fetching blocks after this cursor
    Indexing(u64),
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexerStats {
    pub chain_id: u64,
    pub last_indexed_block: u64,
    pub cycles: u64,
    pub blocks_indexed: u64,
    pub skipped_blocks: u64,
    pub failed_cycles: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub head: u64,
    pub indexed: u64,
    pub skipped: u64,
}

/// What gets mirrored into the multi-chain cache namespace after each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainIndexSummary {
    pub chain_id: u64,
    pub name: String,
    pub head: u64,
    pub last_indexed_block: u64,
    pub latest_block_hash: Option<String>,
    pub latest_block_timestamp: Option<u64>,
    pub latest_block_tx_count: usize,
    pub indexed_at: DateTime<Utc>,
}

pub struct ChainIndexer {
    chain: Arc<ChainConfig>,
    pool: Arc<ConnectorPool>,
    hub: Arc<BroadcastHub>,
    cache: Arc<CacheLayer>,
    settings: IndexerSettings,
    state: watch::Sender<IndexerState>,
    cycles: AtomicU64,
    blocks_indexed: AtomicU64,
    skipped_blocks: AtomicU64,
    failed_cycles: AtomicU64,
    // Only one cycle per chain moves the cursor at a time
    cycle_lock: tokio::sync::Mutex<()>,
}

impl ChainIndexer {
    pub fn new(
        chain: Arc<ChainConfig>,
        pool: Arc<ConnectorPool>,
        hub: Arc<BroadcastHub>,
        cache: Arc<CacheLayer>,
        settings: IndexerSettings,
    ) -> Self {
        let initial = if pool.handle(chain.chain_id).is_some() {
            IndexerState::Synced
        } else {
            IndexerState::Disconnected
        };
        let (state, _) = watch::channel(initial);
        Self {
            chain,
            pool,
            hub,
            cache,
            settings,
            state,
            cycles: AtomicU64::new(0),
            blocks_indexed: AtomicU64::new(0),
            skipped_blocks: AtomicU64::new(0),
            failed_cycles: AtomicU64::new(0),
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain.chain_id
    }

    pub fn state(&self) -> IndexerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<IndexerState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> IndexerStats {
        IndexerStats {
            chain_id: self.chain.chain_id,
            last_indexed_block: self.chain.last_indexed_block.get(),
            cycles: self.cycles.load(Ordering::Relaxed),
            blocks_indexed: self.blocks_indexed.load(Ordering::Relaxed),
            skipped_blocks: self.skipped_blocks.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: IndexerState) {
        self.state.send_replace(state);
    }

    fn fail(&self, state: IndexerState) {
        self.failed_cycles.fetch_add(1, Ordering::Relaxed);
        metrics::increment_indexer_failures(self.chain.chain_id);
        self.set_state(state);
    }

    async fn connector(&self) -> EngineResult<Arc<ConnectorHandle>> {
        if let Some(handle) = self.pool.handle(self.chain.chain_id) {
            return Ok(handle);
        }
        self.set_state(IndexerState::Connecting);
        self.pool.reconnect(self.chain.chain_id).await
    }

    /// Runs one cycle. On any RPC failure the cursor stays where it was and the
    /// error is returned; the next cycle retries from the same point.
    pub async fn index_once(&self) -> EngineResult<CycleOutcome> {
        let _cycle = self.cycle_lock.lock().await;
        self.cycles.fetch_add(1, Ordering::Relaxed);
        let chain_id = self.chain.chain_id;

        let handle = match self.connector().await {
            Ok(h) => h,
            Err(e) => {
                self.fail(IndexerState::Disconnected);
                return Err(e);
            }
        };

        let head = match handle.current_block_height().await {
            Ok(h) => h,
            Err(e) => {
                self.fail(IndexerState::Synced);
                return Err(e);
            }
        };

        if !self.chain.last_indexed_block.is_initialized() {
            // Never initialized, start from the head rather than genesis
            self.chain.last_indexed_block.initialize(head);
            self.set_state(IndexerState::Synced);
            return Ok(CycleOutcome {
                head,
                ..Default::default()
            });
        }
        let cursor = self.chain.last_indexed_block.get();
        if head <= cursor {
            self.set_state(IndexerState::Synced);
            return Ok(CycleOutcome {
                head,
                ..Default::default()
            });
        }

        let missing = head - cursor;
        let batch = missing.min(self.settings.batch_size);
        self.set_state(IndexerState::Indexing(cursor));

        let mut latest: Option<IndexedBlock> = None;
        for number in (cursor + 1)..=(cursor + batch) {
            let block = match handle.get_block(number).await {
                Ok(b) => b,
                Err(e) => {
                    self.fail(IndexerState::Synced);
                    return Err(e);
                }
            };
            self.hub
                .publish(HubEvent::BlockIndexed {
                    chain_id,
                    block_number: block.number,
                    transactions: block.transactions.clone(),
                    timestamp: block.timestamp,
                })
                .await;
            latest = Some(block);
        }

        let skipped = missing - batch;
        self.chain.last_indexed_block.advance(head);
        self.blocks_indexed.fetch_add(batch, Ordering::Relaxed);
        self.skipped_blocks.fetch_add(skipped, Ordering::Relaxed);
        metrics::increment_blocks_indexed(chain_id, batch);
        if skipped > 0 {
            metrics::increment_blocks_skipped(chain_id, skipped);
            warn!(
                "⚠️ Chain {} is {} blocks behind, indexed {} and skipped {} up to {}",
                chain_id, missing, batch, skipped, head
            );
        }

        let summary = ChainIndexSummary {
            chain_id,
            name: self.chain.name.clone(),
            head,
            last_indexed_block: self.chain.last_indexed_block.get(),
            latest_block_hash: latest.as_ref().map(|b| b.hash.clone()),
            latest_block_timestamp: latest.as_ref().map(|b| b.timestamp),
            latest_block_tx_count: latest.as_ref().map(|b| b.transactions.len()).unwrap_or(0),
            indexed_at: Utc::now(),
        };
        self.cache.set_multi_chain_data(chain_id, &summary).await;

        self.set_state(IndexerState::Synced);
        debug!("📦 Chain {} indexed {} blocks, cursor at {}", chain_id, batch, head);
        Ok(CycleOutcome {
            head,
            indexed: batch,
            skipped,
        })
    }

    /// Polls every `indexer.interval_seconds` until `shutdown` flips to true.
    /// A cycle still fetching blocks at that point is dropped before the cursor moves.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.settings.interval_seconds.max(1));
        info!(
            "🚀 Indexer for {} ({}) started, interval {:?}, batch {}",
            self.chain.name, self.chain.chain_id, period, self.settings.batch_size
        );
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_signalled(&mut shutdown) => break,
            }
            tokio::select! {
                result = self.index_once() => {
                    if let Err(e) = result {
                        warn!("⚠️ Indexing cycle for chain {} skipped: {}", self.chain.chain_id, e);
                    }
                }
                _ = shutdown_signalled(&mut shutdown) => {
                    debug!("Chain {} cycle interrupted by shutdown", self.chain.chain_id);
                    break;
                }
            }
        }
        self.set_state(IndexerState::Stopped);
        info!("🛑 Indexer for chain {} stopped", self.chain.chain_id);
    }
}
