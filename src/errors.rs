//! # Engine Errors
//!
//! Failure taxonomy shared by every component of the engine.
//!
//! Failures scoped to one chain, one contract or one trigger are isolated by the
//! component that observes them. Only [`EngineError::NoChainsConnected`] is meant
//! to reach the owning process.

use thiserror::Error;

/// Errors produced by the indexing and automation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A connector for the chain could not be established. Retried next cycle.
    #[error("connection to chain {chain_id} failed: {reason}")]
    Connection { chain_id: u64, reason: String },

    /// Timeout or server-side failure on an otherwise healthy connector.
    #[error("transient RPC failure on chain {chain_id} ({method}): {reason}")]
    TransientRpc {
        chain_id: u64,
        method: &'static str,
        reason: String,
    },

    #[error("block {block_number} not found on chain {chain_id}")]
    BlockNotFound { chain_id: u64, block_number: u64 },

    /// Reference to a chain id that is not registered or not active.
    #[error("unknown or inactive chain {0}")]
    UnknownChain(u64),

    /// Never surfaced past the cache layer, converted to a miss or a no-op there.
    #[error("cache store unavailable: {0}")]
    CacheUnavailable(String),

    #[error("trigger {trigger_id} execution failed: {reason}")]
    TriggerExecution { trigger_id: String, reason: String },

    #[error("cross-chain message {0} not found")]
    MessageNotFound(String),

    #[error("invalid status transition for message {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    /// Startup-level failure: the engine cannot do anything useful.
    #[error("no chain connected out of {attempted} attempted")]
    NoChainsConnected { attempted: usize },

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Errors that resolve themselves on a later cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::TransientRpc { .. }
                | Self::CacheUnavailable(_)
                | Self::BlockNotFound { .. }
        )
    }

    /// Label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::TransientRpc { .. } => "transient_rpc",
            Self::BlockNotFound { .. } => "block_not_found",
            Self::UnknownChain(_) => "unknown_chain",
            Self::CacheUnavailable(_) => "cache_unavailable",
            Self::TriggerExecution { .. } => "trigger_execution",
            Self::MessageNotFound(_) => "message_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NoChainsConnected { .. } => "no_chains_connected",
            Self::Config(_) => "config",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
