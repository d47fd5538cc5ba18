// =============================================================================
// Aurora Feed — Main Entry Point
// =============================================================================
//
// Loads the runtime config, selects the configured subscription and serves
// the chart API until Ctrl+C. The config file is only read.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aurora_feed::api;
use aurora_feed::coordinator::{Coordinator, CoordinatorSettings, FeedStatus};
use aurora_feed::indicators::IndicatorRequest;
use aurora_feed::market_data::{RestHistoryClient, WsConnector};
use aurora_feed::runtime_config::RuntimeConfig;
use aurora_feed::types::SubscriptionKey;

const CONFIG_PATH: &str = "feed_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Aurora Feed starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env()?;

    // Drop indicator configurations that would never validate.
    config.indicators.retain(|raw| {
        match IndicatorRequest::parse(raw).and_then(|r| r.validate()) {
            Ok(spec) => {
                info!(indicator = %spec, "indicator configured");
                true
            }
            Err(e) => {
                warn!(indicator = %raw, error = %e, "ignoring invalid indicator configuration");
                false
            }
        }
    });

    // ── 2. Collaborators & coordinator ───────────────────────────────────
    let history = Arc::new(RestHistoryClient::new(&config.history_url)?);
    let connector = Arc::new(WsConnector::new(&config.ws_url));
    let coordinator = Arc::new(Coordinator::new(
        history,
        connector,
        CoordinatorSettings::from(&config),
    ));

    // Status transitions are logged for operators.
    let mut status = coordinator.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            match current {
                FeedStatus::Failed { reason } => error!(reason = %reason, "feed failed"),
                other => info!(status = ?other, "feed status changed"),
            }
        }
    });

    // ── 3. Initial subscription ──────────────────────────────────────────
    let key = SubscriptionKey::new(&config.symbol, config.timeframe);
    match coordinator.select(key.clone()).await {
        Ok(outcome) => {
            info!(key = %key, ?outcome, "initial subscription ready");
            for raw in &config.indicators {
                if let Err(e) = coordinator.indicator_str(raw) {
                    warn!(indicator = %raw, error = %e, "indicator warm-up failed");
                }
            }
        }
        Err(e) => error!(key = %key, error = %e, "initial subscription failed; retry via API"),
    }

    // ── 4. API server ────────────────────────────────────────────────────
    let app = api::router(Arc::clone(&coordinator));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening. Press Ctrl+C to stop.");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl+C");
            }
            warn!("Shutdown signal received — stopping gracefully");
        })
        .await
        .context("API server failed")?;

    // ── 5. Shutdown ──────────────────────────────────────────────────────
    coordinator.shutdown().await;

    info!("Aurora Feed shut down complete.");
    Ok(())
}
