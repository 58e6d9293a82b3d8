use std::sync::Arc;

use anyhow::{Context, Result};
use exchange_trait::{ExchangeTrader, MarketReader};
use market_data::HyperliquidReader;
use paper_exchange::PaperExchange;
use proposal_client::{LlmClient, LlmProposalSource, ProposalSource};
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;

mod config;
mod cycle;
mod cycle_log;
mod dispatcher;
mod metrics;
mod position_manager;
#[cfg(test)]
mod test_venue;
mod types;

use config::AgentConfig;
use cycle::TradingInstance;
use cycle_log::CycleLog;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting perpetual futures trading agent");

    // 2. Configuration
    let config = AgentConfig::from_env()?;
    config.validate()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Scan interval: {} min", config.scan_interval_minutes);
    tracing::info!("  Watchlist: {}", config.watchlist.join(", "));
    tracing::info!(
        "  Leverage ceilings: {}x BTC/ETH, {}x altcoins",
        config.btc_eth_max_leverage,
        config.altcoin_max_leverage
    );
    tracing::info!("  Min risk:reward: {:.1}:1", config.min_risk_reward);
    tracing::info!(
        "  Trailing stop: {} (arm at {:.1}%, distance {:.1}%)",
        config.trailing_stop_enabled,
        config.trailing_stop_activation_pct,
        config.trailing_stop_distance_pct
    );
    tracing::info!("  Partial take-profit: {}", config.partial_take_profit_enabled);
    tracing::info!(
        "  Circuit breaker: {} ({} min base, x{}, max {} min, reset after {}h)",
        config.circuit_breaker_enabled,
        config.circuit_breaker_base_minutes,
        config.circuit_breaker_multiplier,
        config.circuit_breaker_max_minutes,
        config.circuit_breaker_reset_hours
    );
    if config.daily_loss_limit_pct > 0.0 {
        tracing::info!(
            "  Daily loss limit: {:.1}% (pause {} min)",
            config.daily_loss_limit_pct,
            config.daily_loss_pause_minutes
        );
    }
    tracing::info!("  Model: {} ({})", config.llm_model, config.llm_api_url);

    // 3. Database for cycle records and persisted counters
    sqlx::any::install_default_drivers();
    let db_pool = sqlx::AnyPool::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    let cycle_log = CycleLog::new(db_pool.clone());
    cycle_log.init_tables().await?;

    sqlx::query("SELECT 1")
        .execute(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Database connectivity check failed: {}", e))?;
    tracing::info!("Startup check: database OK");

    // 4. Shared market data and proposal source
    let market: Arc<dyn MarketReader> = Arc::new(HyperliquidReader::new(config.market_data_url.clone())?);
    let client = LlmClient::new(config.llm_config())?;
    let source: Arc<dyn ProposalSource> =
        Arc::new(LlmProposalSource::new(client, config.retry_policy()));
    tracing::info!("Proposal source ready ({})", source.source_name());

    // 5. One isolated trader per instance
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut handles = Vec::with_capacity(config.instances.len());
    for spec in &config.instances {
        let trader: Arc<dyn ExchangeTrader> = Arc::new(
            PaperExchange::with_market(config.paper_starting_balance, market.clone())
                .with_name(format!("paper-{}", spec.id)),
        );
        let mut instance = TradingInstance::new(
            spec,
            &config,
            trader,
            market.clone(),
            source.clone(),
            cycle_log.clone(),
        );
        instance.restore().await?;
        tracing::info!(
            "Instance '{}' ({}) ready, {} metrics cycles on record",
            instance.id(),
            instance.mode(),
            instance.metrics().cycles_run
        );
        handles.push(tokio::spawn(instance.run(config.scan_interval(), stop_rx.clone())));
    }

    tracing::info!(
        "Agent is now running {} instance(s), cycling every {} min. Press Ctrl+C to stop.",
        handles.len(),
        config.scan_interval_minutes
    );

    // 6. Wait for SIGINT/SIGTERM, then let running cycles finish
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    shutdown.await;

    tracing::info!("Shutdown signal received, waiting for instances to finish their cycle...");
    stop_tx.send(true).ok();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Instance task ended abnormally: {}", e);
        }
    }

    db_pool.close().await;
    tracing::info!("Trading agent shut down.");
    Ok(())
}
