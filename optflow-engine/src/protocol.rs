//! JSON-RPC 2.0 envelope and payload types for the feed wire protocol.
//!
//! Outbound: `{"method": ..., "params": ..., "id": ..., "jsonrpc": "2.0"}`.
//! Inbound success: `{"result": ..., "id": ...}`; inbound failure:
//! `{"error": {"message": ...}, "id": ...}`. Payloads are decoded into typed
//! structs only after routing has decided what the envelope is for.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::trade::RawTrade;

pub const METHOD_TRADE_HISTORY: &str = "public/get_trade_history";
pub const METHOD_TICKER: &str = "public/get_ticker";
pub const METHOD_SPOT_FEED_HISTORY: &str = "public/get_spot_feed_history";

/// Outbound call envelope.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Value,
    pub id: u64,
    pub jsonrpc: &'static str,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            method: method.into(),
            params,
            id,
            jsonrpc: "2.0",
        }
    }
}

/// Inbound envelope: a response to one of our calls or an unsolicited push.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcEnvelope {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

/// The `error` object carried by a failed envelope. Extra upstream fields
/// are tolerated and ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
}

impl RpcErrorBody {
    /// The upstream message, or a generic fallback when it is empty.
    pub fn message_or_default(&self) -> &str {
        if self.message.is_empty() {
            "API error"
        } else {
            &self.message
        }
    }
}

/// `public/get_trade_history` result payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TradeHistoryResult {
    #[serde(default)]
    pub trades: Vec<RawTrade>,
}

/// `stats` block of a ticker payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TickerStats {
    #[serde(default, deserialize_with = "crate::de::de_flexible_f64_opt")]
    pub price_change: Option<f64>,
}

/// `public/get_ticker` result payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TickerResult {
    #[serde(default, deserialize_with = "crate::de::de_flexible_f64_opt")]
    pub mark_price: Option<f64>,
    #[serde(default, deserialize_with = "crate::de::de_flexible_f64_opt")]
    pub index_price: Option<f64>,
    #[serde(default, deserialize_with = "crate::de::de_flexible_f64_opt")]
    pub best_bid_price: Option<f64>,
    #[serde(default, deserialize_with = "crate::de::de_flexible_f64_opt")]
    pub open_interest: Option<f64>,
    #[serde(default)]
    pub stats: Option<TickerStats>,
}

impl TickerResult {
    /// Reference price fallback order: mark, then index, then best bid,
    /// then zero.
    pub fn reference_price(&self) -> f64 {
        self.mark_price
            .or(self.index_price)
            .or(self.best_bid_price)
            .unwrap_or(0.0)
    }

    /// 24h percentage change from the stats block, zero when absent.
    pub fn change_24h_pct(&self) -> f64 {
        self.stats
            .as_ref()
            .and_then(|stats| stats.price_change)
            .unwrap_or(0.0)
    }
}

/// `public/get_spot_feed_history` result payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpotFeedResult {
    #[serde(default)]
    pub prices: Vec<SpotFeedPoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpotFeedPoint {
    #[serde(default, deserialize_with = "crate::de::de_flexible_f64_opt")]
    pub price: Option<f64>,
}

/// Shape probe for unsolicited pushes: a payload carrying a trades
/// collection routes to the trade-history handler.
pub fn looks_like_trade_history(result: &Value) -> bool {
    result.get("trades").is_some_and(Value::is_array)
}

/// Shape probe for unsolicited pushes: a payload carrying a mark or index
/// price routes to the spot ticker handler.
pub fn looks_like_ticker(result: &Value) -> bool {
    result.get("mark_price").is_some() || result.get("index_price").is_some()
}

/// Params for a trade-history call over the configured window.
pub fn trade_history_params(currency: &str, from_ms: i64, to_ms: i64, page_size: u32) -> Value {
    json!({
        "currency": currency,
        "instrument_type": "option",
        "from_timestamp": from_ms,
        "to_timestamp": to_ms,
        "page_size": page_size,
    })
}

/// Params for a ticker call.
pub fn ticker_params(instrument_name: &str) -> Value {
    json!({ "instrument_name": instrument_name })
}

/// Params for the spot-feed fallback call.
pub fn spot_feed_params(currency: &str) -> Value {
    json!({ "currency": currency, "page_size": 1 })
}

/// Perpetual instrument used as the spot price reference for a currency.
pub fn perp_instrument(currency: &str) -> String {
    format!("{}-PERP", currency)
}
