//! # MIG Sentinel
//!
//! Multi-chain indexing and automation-trigger engine. Keeps live read-only
//! connections to several EVM networks, ingests new blocks, derives contract
//! and portfolio risk metrics, fires protective automation triggers when risk
//! thresholds are crossed, and fans the results out to subscribers through a
//! cache and pub/sub layer.
//!
//! ## Overview
//!
//! - **Connectivity**: per-chain connectors with timeouts, rate limits and
//!   partial-failure tolerance (healthy as long as one chain is up)
//! - **Indexing**: one polling task per chain with a monotone block cursor
//! - **Monitoring**: contract metrics and portfolio risk, rebuilt and swapped each cycle
//! - **Automation**: OR-combined trigger rules with per-trigger isolation
//! - **Distribution**: non-blocking broadcast hub mirrored to cache pub/sub
//!
//! ## Architecture
//!
//! ### Chain Layer
//! [`chain_registry`] holds the network table, [`rpc_pool`] the live connectors
//! built from a [`chain_provider::ChainConnector`].
//!
//! ### Ingestion Layer
//! [`indexer`] polls each chain; [`cross_chain`] tracks outbound bridge messages.
//!
//! ### Risk & Automation Layer
//! [`contract_monitor`] collects metrics, [`risk`] scores portfolios,
//! [`automation`] evaluates and executes triggers.
//!
//! ### Distribution Layer
//! [`broadcast_hub`] delivers events, [`cache`] stores recent results.
//!
//! [`engine::SentinelEngine`] wires everything together.

// Chain Layer
/// Supported networks and per-chain cursors
pub mod chain_registry;
/// Read-only chain capability and its ethers implementation
pub mod chain_provider;
/// Per-chain connectors with rate limiting and timeouts
pub mod rpc_pool;

// Ingestion Layer
/// Per-chain block indexer
pub mod indexer;
/// Cross-chain message lifecycle
pub mod cross_chain;
/// Delayed, cancellable tasks
pub mod scheduler;

// Risk & Automation Layer
/// Contract metrics collection and the monitoring cycle
pub mod contract_monitor;
/// Portfolio holdings and sources
pub mod portfolio;
/// Risk scoring
pub mod risk;
/// Trigger rules, evaluation and execution
pub mod automation;
/// External price lookup
pub mod price_feeds;

// Distribution Layer
/// Event fan-out to subscribers
pub mod broadcast_hub;
/// TTL cache with pub/sub
pub mod cache;
/// Redis cache store (optional, feature-gated)
#[cfg(feature = "redis")]
pub mod redis_manager;

// Infrastructure
/// Composition root
pub mod engine;
/// Error taxonomy
pub mod errors;
/// Metrics and observability
pub mod metrics;
/// Log sink installation
pub mod telemetry;

// Settings & Configuration
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use engine::{EngineHealth, SentinelEngine};
pub use errors::{EngineError, EngineResult};
pub use settings::Settings;
