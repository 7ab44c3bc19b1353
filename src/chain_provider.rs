//! Read-only chain capability used by the connector pool.
//!
//! [`ChainProvider`] is the raw surface (no timeouts, no rate limiting); the pool
//! wraps it in a [`ConnectorHandle`](crate::rpc_pool::ConnectorHandle). The ethers
//! HTTP implementation is the production one, tests plug in their own.

use crate::chain_registry::ChainConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::prelude::{Address, Http, Middleware, Provider, U256};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Block as seen by the indexer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedBlock {
    pub chain_id: u64,
    pub number: u64,
    pub hash: String,
    /// Unix seconds
    pub timestamp: u64,
    /// Transaction hashes in block order
    pub transactions: Vec<String>,
}

#[async_trait]
pub trait ChainProvider: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;
    async fn block_number(&self) -> Result<u64>;
    /// `Ok(None)` when the node doesn't know the block
    async fn block(&self, number: u64) -> Result<Option<IndexedBlock>>;
    /// Balance in the chain's smallest unit
    async fn balance(&self, address: &str) -> Result<U256>;
}

/// Opens providers for configured chains.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    async fn open(&self, chain: &ChainConfig) -> Result<Arc<dyn ChainProvider>>;
}

pub struct EthersChainProvider {
    chain_id: u64,
    provider: Provider<Http>,
}

impl EthersChainProvider {
    pub fn new(chain_id: u64, rpc_url: &str) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .with_context(|| format!("Invalid RPC url for chain {}: {}", chain_id, rpc_url))?
            .interval(Duration::from_millis(500));
        Ok(Self { chain_id, provider })
    }
}

#[async_trait]
impl ChainProvider for EthersChainProvider {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.provider.get_chainid().await?.as_u64())
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn block(&self, number: u64) -> Result<Option<IndexedBlock>> {
        let block = self.provider.get_block(number).await?;
        Ok(block.map(|b| IndexedBlock {
            chain_id: self.chain_id,
            number: b.number.map(|n| n.as_u64()).unwrap_or(number),
            hash: b.hash.map(|h| format!("{:?}", h)).unwrap_or_default(),
            timestamp: b.timestamp.as_u64(),
            transactions: b.transactions.iter().map(|h| format!("{:?}", h)).collect(),
        }))
    }

    async fn balance(&self, address: &str) -> Result<U256> {
        let address = Address::from_str(address)
            .with_context(|| format!("Invalid address {}", address))?;
        Ok(self.provider.get_balance(address, None).await?)
    }
}

/// Connects over HTTP JSON-RPC using each chain's configured endpoint.
#[derive(Debug, Default, Clone)]
pub struct EthersConnector;

#[async_trait]
impl ChainConnector for EthersConnector {
    async fn open(&self, chain: &ChainConfig) -> Result<Arc<dyn ChainProvider>> {
        Ok(Arc::new(EthersChainProvider::new(chain.chain_id, &chain.rpc_url)?))
    }
}
