//! Engine configuration.

use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::trade::Thresholds;

/// Flow engine configuration
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// WebSocket feed URL
    pub feed_url: String,
    /// Initially selected currency
    pub currency: String,
    /// Unusual-flow detection thresholds
    pub thresholds: Thresholds,
    /// Trade-history refresh period
    pub trade_refresh: Duration,
    /// Spot-price refresh period
    pub spot_refresh: Duration,
    /// One-shot reconnect delay, re-armed after every close
    pub reconnect_delay: Duration,
    /// Trade-history lookback window
    pub history_window: Duration,
    /// Trade-history page size
    pub page_size: u32,
    /// Cap on per-instrument ticker calls issued for open-interest enrichment
    pub enrich_limit: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            feed_url: "wss://api.derive.xyz/ws".to_string(),
            currency: "ETH".to_string(),
            thresholds: Thresholds::default(),
            trade_refresh: Duration::from_secs(60),
            spot_refresh: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
            history_window: Duration::from_secs(24 * 60 * 60),
            page_size: 100,
            enrich_limit: 30,
        }
    }
}

impl FlowConfig {
    /// Create a new configuration with a custom feed URL
    pub fn new(feed_url: impl Into<String>) -> Self {
        Self {
            feed_url: feed_url.into(),
            ..Default::default()
        }
    }

    /// Set the initially selected currency
    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    /// Set unusual-flow thresholds
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Set the trade-history refresh period
    pub fn with_trade_refresh(mut self, period: Duration) -> Self {
        self.trade_refresh = period;
        self
    }

    /// Set the spot-price refresh period
    pub fn with_spot_refresh(mut self, period: Duration) -> Self {
        self.spot_refresh = period;
        self
    }

    /// Set the reconnect delay
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the trade-history lookback window
    pub fn with_history_window(mut self, window: Duration) -> Self {
        self.history_window = window;
        self
    }

    /// Build a configuration from `OPTFLOW_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(feed_url) = std::env::var("OPTFLOW_FEED_URL") {
            match Url::parse(&feed_url) {
                Ok(_) => config.feed_url = feed_url,
                Err(e) => warn!(%feed_url, error = %e, "ignoring invalid OPTFLOW_FEED_URL"),
            }
        }
        if let Ok(currency) = std::env::var("OPTFLOW_CURRENCY") {
            if !currency.is_empty() {
                config.currency = currency;
            }
        }
        if let Some(min_premium) = env_f64("OPTFLOW_MIN_PREMIUM_USD") {
            config.thresholds.min_premium_usd = min_premium;
        }
        if let Some(oi_percentage) = env_f64("OPTFLOW_OI_PERCENTAGE") {
            config.thresholds.oi_percentage = oi_percentage;
        }
        if let Some(secs) = env_u64("OPTFLOW_TRADE_REFRESH_SECS") {
            config.trade_refresh = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("OPTFLOW_SPOT_REFRESH_SECS") {
            config.spot_refresh = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("OPTFLOW_RECONNECT_DELAY_SECS") {
            config.reconnect_delay = Duration::from_secs(secs);
        }
        if let Some(hours) = env_u64("OPTFLOW_HISTORY_WINDOW_HOURS") {
            config.history_window = Duration::from_secs(hours * 60 * 60);
        }

        config
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
