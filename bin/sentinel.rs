// Sentinel - runs the indexing, monitoring and automation engine until Ctrl+C

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use mig_sentinel::{telemetry, SentinelEngine, Settings};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "sentinel", about = "Multi-chain indexing and automation-trigger engine")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "Config.toml")]
    config: PathBuf,

    /// Seconds between health reports
    #[arg(long, default_value_t = 60)]
    health_interval: u64,

    /// Prometheus listener, e.g. 0.0.0.0:9100
    #[cfg(feature = "observability")]
    #[arg(long)]
    metrics_addr: Option<std::net::SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::from_path(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    telemetry::init_logging(&settings.log);

    #[cfg(feature = "observability")]
    if let Some(addr) = cli.metrics_addr {
        mig_sentinel::metrics::install_prometheus_exporter(addr)?;
        info!("📈 Prometheus exporter listening on {}", addr);
    }

    info!("🚀 Starting Sentinel ({} chains configured)", settings.chains.len());

    let engine = SentinelEngine::builder(settings)
        .build()
        .await
        .context("Failed to assemble engine")?;
    let connected = engine.start().await.context("Engine failed to start")?;
    info!("✅ Engine running with {} connected chains", connected);

    let mut ticker = tokio::time::interval(Duration::from_secs(cli.health_interval.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let health = engine.get_health();
                if health.healthy {
                    info!(
                        "📡 Health: {}/{} chains, {} contracts, {} subscribers, {} pending messages, cache {}",
                        health.chains_connected,
                        health.chains_active,
                        health.tracked_contracts,
                        health.active_subscribers,
                        health.pending_messages,
                        if health.cache_available { "on" } else { "off" }
                    );
                } else {
                    warn!("⚠️ Engine unhealthy: no chain connected");
                }
                for stats in engine.indexer_stats() {
                    info!(
                        "🔗 Chain {}: block {} ({} indexed, {} skipped, {} failed cycles)",
                        stats.chain_id,
                        stats.last_indexed_block,
                        stats.blocks_indexed,
                        stats.skipped_blocks,
                        stats.failed_cycles
                    );
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("⚠️ Failed to listen for Ctrl+C: {}", e);
                }
                break;
            }
        }
    }

    engine.shutdown().await;
    info!("👋 Sentinel stopped");
    Ok(())
}
