//! Working-set aggregation: the canonical classified trade list, the spot
//! price snapshot, and the derived views read by the presentation boundary.
//!
//! The model is snapshot-replace, not incremental-merge: each trade-history
//! response fully supersedes the canonical list, and each ticker response
//! fully supersedes the spot snapshot. Derived views are computed on demand
//! so they can never go stale against the canonical state.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::instrument::OptionSide;
use crate::trade::{classify, ClassifiedTrade, RawTrade, Thresholds};

/// Spot price reference for the selected currency. Replaced wholesale on
/// every ticker push, never merged field by field.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotPriceSnapshot {
    pub price: f64,
    pub change_24h_pct: f64,
    /// True while a refresh for the selected currency is in flight and no
    /// snapshot has been published for it yet.
    pub is_stale: bool,
}

impl Default for SpotPriceSnapshot {
    fn default() -> Self {
        Self {
            price: 0.0,
            change_24h_pct: 0.0,
            is_stale: true,
        }
    }
}

/// Side filter applied by the presentation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideFilter {
    #[default]
    All,
    Call,
    Put,
}

impl SideFilter {
    pub fn matches(&self, side: OptionSide) -> bool {
        match self {
            SideFilter::All => true,
            SideFilter::Call => side == OptionSide::Call,
            SideFilter::Put => side == OptionSide::Put,
        }
    }
}

/// Reduction over a set of classified trades.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FlowSummary {
    pub count: usize,
    pub unusual_count: usize,
    pub total_premium: f64,
}

/// The canonical working set: most-recently-replaced classified trades plus
/// the current spot snapshot.
#[derive(Debug, Default)]
pub struct WorkingSet {
    trades: Vec<ClassifiedTrade>,
    spot: SpotPriceSnapshot,
    last_replaced: Option<DateTime<Utc>>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify every raw trade and replace the canonical list.
    ///
    /// Sort order: unusual before not-unusual, then timestamp descending.
    /// The sort is stable, so trades sharing both keys keep feed order.
    pub fn replace_raw_trades(
        &mut self,
        raw_trades: &[RawTrade],
        thresholds: &Thresholds,
        open_interest: &HashMap<String, f64>,
    ) {
        let classified = raw_trades
            .iter()
            .map(|raw| {
                classify(
                    raw,
                    thresholds,
                    open_interest.get(&raw.instrument_name).copied(),
                )
            })
            .collect();
        self.replace_trades(classified);
    }

    /// Replace the canonical list with already-classified trades.
    pub fn replace_trades(&mut self, mut classified: Vec<ClassifiedTrade>) {
        classified.sort_by(|a, b| {
            b.is_unusual
                .cmp(&a.is_unusual)
                .then(b.timestamp().cmp(&a.timestamp()))
        });
        self.trades = classified;
        self.last_replaced = Some(Utc::now());
    }

    /// The canonical list, in classified order.
    pub fn trades(&self) -> &[ClassifiedTrade] {
        &self.trades
    }

    /// When the canonical list was last replaced.
    pub fn last_replaced(&self) -> Option<DateTime<Utc>> {
        self.last_replaced
    }

    /// Unconditional spot snapshot overwrite.
    pub fn replace_spot(&mut self, snapshot: SpotPriceSnapshot) {
        self.spot = snapshot;
    }

    /// Flag the current spot snapshot as stale (a refresh is in flight).
    pub fn mark_spot_stale(&mut self) {
        self.spot.is_stale = true;
    }

    pub fn spot(&self) -> SpotPriceSnapshot {
        self.spot.clone()
    }

    /// Trades matching the side filter with premium at or above the given
    /// floor, in canonical order.
    pub fn filtered(&self, side: SideFilter, min_premium: f64) -> Vec<ClassifiedTrade> {
        self.trades
            .iter()
            .filter(|trade| side.matches(trade.instrument.side) && trade.premium >= min_premium)
            .cloned()
            .collect()
    }

    /// The `n` largest trades by unsigned quantity. Stable sort, so ties
    /// keep canonical order.
    pub fn top_by_quantity(&self, n: usize) -> Vec<ClassifiedTrade> {
        let mut ranked = self.trades.clone();
        ranked.sort_by(|a, b| {
            b.abs_quantity()
                .partial_cmp(&a.abs_quantity())
                .unwrap_or(Ordering::Equal)
        });
        ranked.truncate(n);
        ranked
    }

    /// Reduce a subset of trades to count / unusual count / total premium.
    pub fn summarize(subset: &[ClassifiedTrade]) -> FlowSummary {
        subset.iter().fold(FlowSummary::default(), |mut acc, trade| {
            acc.count += 1;
            if trade.is_unusual {
                acc.unusual_count += 1;
            }
            acc.total_premium += trade.premium;
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(instrument: &str, price: f64, amount: f64, ts_ms: i64) -> RawTrade {
        RawTrade {
            instrument_name: instrument.to_string(),
            trade_price: Some(price),
            trade_amount: Some(amount),
            timestamp: Utc.timestamp_millis_opt(ts_ms).single().unwrap(),
            ..RawTrade::default()
        }
    }

    fn thresholds() -> Thresholds {
        Thresholds {
            min_premium_usd: 10_000.0,
            oi_percentage: 2.0,
        }
    }

    #[test]
    fn test_replace_sorts_unusual_first_then_timestamp_desc() {
        let mut working = WorkingSet::new();
        working.replace_raw_trades(
            &[
                raw("ETH-20240315-3000-C", 10.0, 1.0, 300), // quiet, newest
                raw("ETH-20240315-3000-C", 500.0, 30.0, 100), // unusual, oldest
                raw("ETH-20240315-3000-P", 10.0, 1.0, 200), // quiet
                raw("ETH-20240315-3500-C", 600.0, 30.0, 250), // unusual
            ],
            &thresholds(),
            &HashMap::new(),
        );

        let trades = working.trades();
        // pairwise order invariant: unusual >= next unusual, timestamps
        // descending within equal unusual-ness
        for pair in trades.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(a.is_unusual >= b.is_unusual);
            if a.is_unusual == b.is_unusual {
                assert!(a.timestamp() >= b.timestamp());
            }
        }
        assert!(trades[0].is_unusual && trades[1].is_unusual);
        assert_eq!(trades[0].timestamp().timestamp_millis(), 250);
        assert_eq!(trades[1].timestamp().timestamp_millis(), 100);
        assert_eq!(trades[2].timestamp().timestamp_millis(), 300);
        assert_eq!(trades[3].timestamp().timestamp_millis(), 200);
    }

    #[test]
    fn test_replace_is_stable_on_full_ties() {
        let mut working = WorkingSet::new();
        let mut first = raw("ETH-20240315-3000-C", 10.0, 1.0, 100);
        first.trade_id = "first".to_string();
        let mut second = raw("ETH-20240315-3000-P", 10.0, 1.0, 100);
        second.trade_id = "second".to_string();

        working.replace_raw_trades(&[first, second], &thresholds(), &HashMap::new());

        // identical keys: feed order preserved
        assert_eq!(working.trades()[0].raw.trade_id, "first");
        assert_eq!(working.trades()[1].raw.trade_id, "second");
    }

    #[test]
    fn test_filtered_all_zero_floor_equals_canonical() {
        let mut working = WorkingSet::new();
        working.replace_raw_trades(
            &[
                raw("ETH-20240315-3000-C", 500.0, 30.0, 100),
                raw("ETH-20240315-3000-P", 10.0, 1.0, 200),
                raw("ETH-PERP", 10.0, 1.0, 300), // Unknown side
            ],
            &thresholds(),
            &HashMap::new(),
        );

        let filtered = working.filtered(SideFilter::All, 0.0);
        assert_eq!(filtered.as_slice(), working.trades());
    }

    #[test]
    fn test_filtered_by_side_and_premium() {
        let mut working = WorkingSet::new();
        working.replace_raw_trades(
            &[
                raw("ETH-20240315-3000-C", 500.0, 30.0, 100), // call, 15_000
                raw("ETH-20240315-3000-C", 10.0, 1.0, 200),   // call, 10
                raw("ETH-20240315-3000-P", 400.0, 30.0, 300), // put, 12_000
            ],
            &thresholds(),
            &HashMap::new(),
        );

        let calls = working.filtered(SideFilter::Call, 0.0);
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|t| t.instrument.side == OptionSide::Call));

        let big_calls = working.filtered(SideFilter::Call, 1_000.0);
        assert_eq!(big_calls.len(), 1);
        assert_eq!(big_calls[0].premium, 15_000.0);

        let puts = working.filtered(SideFilter::Put, 0.0);
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].premium, 12_000.0);
    }

    #[test]
    fn test_top_by_quantity() {
        let mut working = WorkingSet::new();
        working.replace_raw_trades(
            &[
                raw("ETH-20240315-3000-C", 1.0, 5.0, 100),
                raw("ETH-20240315-3000-C", 1.0, -50.0, 200), // magnitude ranks
                raw("ETH-20240315-3000-P", 1.0, 20.0, 300),
                raw("ETH-20240315-3500-C", 1.0, 40.0, 400),
            ],
            &thresholds(),
            &HashMap::new(),
        );

        let top = working.top_by_quantity(3);
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].abs_quantity(), 50.0);
        assert_eq!(top[1].abs_quantity(), 40.0);
        assert_eq!(top[2].abs_quantity(), 20.0);
    }

    #[test]
    fn test_top_by_quantity_truncates_to_available() {
        let mut working = WorkingSet::new();
        working.replace_raw_trades(
            &[raw("ETH-20240315-3000-C", 1.0, 5.0, 100)],
            &thresholds(),
            &HashMap::new(),
        );
        assert_eq!(working.top_by_quantity(5).len(), 1);
    }

    #[test]
    fn test_summarize() {
        let mut working = WorkingSet::new();
        working.replace_raw_trades(
            &[
                raw("ETH-20240315-3000-C", 500.0, 30.0, 100), // 15_000, unusual
                raw("ETH-20240315-3000-P", 5.0, 100.0, 200),  // 500, quiet
            ],
            &thresholds(),
            &HashMap::new(),
        );

        let summary = WorkingSet::summarize(working.trades());
        assert_eq!(summary.count, 2);
        assert_eq!(summary.unusual_count, 1);
        assert_eq!(summary.total_premium, 15_500.0);
    }

    #[test]
    fn test_open_interest_map_applies_per_instrument() {
        let mut working = WorkingSet::new();
        let mut oi = HashMap::new();
        oi.insert("ETH-20240315-3000-C".to_string(), 1_000.0);

        working.replace_raw_trades(
            &[
                raw("ETH-20240315-3000-C", 1.0, 21.0, 100), // 2.1% of OI
                raw("ETH-20240315-3000-P", 1.0, 21.0, 200), // OI unknown
            ],
            &thresholds(),
            &oi,
        );

        let trades = working.trades();
        assert!(trades[0].is_unusual);
        assert!(!trades[1].is_unusual);
    }

    #[test]
    fn test_spot_replace_and_stale() {
        let mut working = WorkingSet::new();
        assert!(working.spot().is_stale);

        working.replace_spot(SpotPriceSnapshot {
            price: 2_000.5,
            change_24h_pct: 1.25,
            is_stale: false,
        });
        assert_eq!(working.spot().price, 2_000.5);
        assert!(!working.spot().is_stale);

        working.mark_spot_stale();
        assert!(working.spot().is_stale);
        // price retained until the replacing snapshot lands
        assert_eq!(working.spot().price, 2_000.5);
    }
}
