//! Trade records and unusual-flow classification.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::instrument::{parse_instrument, ParsedInstrument};

/// One trade report exactly as received from the feed.
///
/// Field names vary between feed revisions (`trade_price` vs the legacy
/// `price`, `trade_amount` vs `amount`), and numerics may arrive as decimal
/// strings. Missing or unparseable values resolve to zero through
/// [`RawTrade::price_or_zero`] / [`RawTrade::amount_or_zero`] rather than
/// failing the record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawTrade {
    #[serde(default)]
    pub instrument_name: String,

    #[serde(default, deserialize_with = "crate::de::de_flexible_f64_opt")]
    pub trade_price: Option<f64>,

    #[serde(default, deserialize_with = "crate::de::de_flexible_f64_opt")]
    pub price: Option<f64>,

    /// Signed traded size; the sign is exchange-internal and ignored here.
    #[serde(default, deserialize_with = "crate::de::de_flexible_f64_opt")]
    pub trade_amount: Option<f64>,

    #[serde(default, deserialize_with = "crate::de::de_flexible_f64_opt")]
    pub amount: Option<f64>,

    #[serde(
        default = "crate::de::unix_epoch",
        deserialize_with = "crate::de::de_epoch_ms"
    )]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub trade_id: String,
}

impl Default for RawTrade {
    fn default() -> Self {
        Self {
            instrument_name: String::new(),
            trade_price: None,
            price: None,
            trade_amount: None,
            amount: None,
            timestamp: DateTime::UNIX_EPOCH,
            trade_id: String::new(),
        }
    }
}

impl RawTrade {
    /// Execution price: `trade_price`, then the legacy `price`, then zero.
    pub fn price_or_zero(&self) -> f64 {
        self.trade_price.or(self.price).unwrap_or(0.0)
    }

    /// Signed traded size: `trade_amount`, then the legacy `amount`, then zero.
    pub fn amount_or_zero(&self) -> f64 {
        self.trade_amount.or(self.amount).unwrap_or(0.0)
    }
}

/// Unusual-flow detection thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Flag trades whose premium is at least this many dollars
    pub min_premium_usd: f64,
    /// Flag trades whose size is at least this percentage of open interest
    pub oi_percentage: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_premium_usd: 10_000.0,
            oi_percentage: 2.0,
        }
    }
}

/// Which heuristic fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    LargePremium,
    HighOiRatio,
}

/// One fired heuristic with its human-readable label.
#[derive(Debug, Clone, PartialEq)]
pub struct Flag {
    pub kind: FlagKind,
    pub label: String,
}

/// A trade after classification. A value, created once at ingestion and
/// never mutated; the canonical list is replaced wholesale, not merged.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedTrade {
    pub raw: RawTrade,
    /// price × |amount|, in quote currency
    pub premium: f64,
    pub flags: Vec<Flag>,
    pub is_unusual: bool,
    pub instrument: ParsedInstrument,
}

impl ClassifiedTrade {
    /// Unsigned traded size, the ranking key for top-by-quantity views.
    pub fn abs_quantity(&self) -> f64 {
        self.raw.amount_or_zero().abs()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.raw.timestamp
    }
}

/// Classify one raw trade against the configured thresholds.
///
/// Pure function of its three inputs: no clock, no global state. Open
/// interest is optional; absent or non-positive open interest silently skips
/// the ratio check.
pub fn classify(raw: &RawTrade, thresholds: &Thresholds, open_interest: Option<f64>) -> ClassifiedTrade {
    let price = raw.price_or_zero();
    let quantity = raw.amount_or_zero().abs();
    let premium = price * quantity;

    let mut flags = Vec::new();

    if premium >= thresholds.min_premium_usd {
        flags.push(Flag {
            kind: FlagKind::LargePremium,
            label: format!("{} Premium", format_usd(premium)),
        });
    }

    if let Some(oi) = open_interest {
        if oi > 0.0 {
            let oi_ratio = quantity / oi * 100.0;
            if oi_ratio >= thresholds.oi_percentage {
                flags.push(Flag {
                    kind: FlagKind::HighOiRatio,
                    label: format!("{:.1}% of OI", oi_ratio),
                });
            }
        }
    }

    ClassifiedTrade {
        premium,
        is_unusual: !flags.is_empty(),
        flags,
        instrument: parse_instrument(&raw.instrument_name),
        raw: raw.clone(),
    }
}

/// Compact USD formatter used for flag labels: `$1.25M`, `$12.50K`, `$999.99`.
pub fn format_usd(value: f64) -> String {
    if value >= 1_000_000.0 {
        format!("${:.2}M", value / 1_000_000.0)
    } else if value >= 1_000.0 {
        format!("${:.2}K", value / 1_000.0)
    } else {
        format!("${:.2}", value)
    }
}
