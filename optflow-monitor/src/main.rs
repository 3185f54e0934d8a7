//! Headless console consumer for the optflow engine.
//!
//! Builds a [`FlowEngine`] from `OPTFLOW_*` environment variables and
//! periodically logs the working-set summary through the engine's read-only
//! snapshot interface. Everything it knows about the feed comes through
//! that boundary.

use std::time::Duration;

use optflow_engine::{format_usd, FlowConfig, FlowEngine};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();

    let config = FlowConfig::from_env();
    info!(
        url = %config.feed_url,
        currency = %config.currency,
        min_premium = %format_usd(config.thresholds.min_premium_usd),
        oi_pct = config.thresholds.oi_percentage,
        "starting optflow monitor"
    );

    let engine = FlowEngine::spawn(config);

    let mut status = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = status.tick() => {
                let summary = engine.summary();
                let spot = engine.spot();
                info!(
                    state = ?engine.connection_state(),
                    trades = summary.count,
                    unusual = summary.unusual_count,
                    total_premium = %format_usd(summary.total_premium),
                    spot_price = spot.price,
                    spot_change_pct = spot.change_24h_pct,
                    spot_stale = spot.is_stale,
                    "flow snapshot"
                );

                for trade in engine.top_by_quantity(5) {
                    info!(
                        instrument = %trade.raw.instrument_name,
                        side = %trade.instrument.side,
                        quantity = trade.abs_quantity(),
                        premium = %format_usd(trade.premium),
                        unusual = trade.is_unusual,
                        "top flow"
                    );
                }

                if let Some(error) = engine.last_error() {
                    warn!(%error, "feed error");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    engine.shutdown().await;
}
