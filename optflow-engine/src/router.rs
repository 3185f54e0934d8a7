//! Inbound message correlation and routing.
//!
//! Each envelope is matched against the pending-call table first and
//! dispatched on the recorded call purpose; payload-shape routing is the
//! fallback for envelopes that match no pending call (genuinely unsolicited
//! pushes). Unrecognised payload shapes are ignored so additive upstream
//! fields never break ingestion.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::{debug, warn};

use crate::aggregator::SpotPriceSnapshot;
use crate::connection::{CallPurpose, PendingCall};
use crate::engine::Requester;
use crate::error::FlowError;
use crate::protocol::{
    self, RpcEnvelope, RpcErrorBody, SpotFeedResult, TickerResult, TradeHistoryResult,
};
use crate::trade::RawTrade;

/// Raw trades held back until their open-interest ticker calls resolve,
/// so the whole batch is classified once with a complete OI map.
struct EnrichmentBuffer {
    raw_trades: Vec<RawTrade>,
    awaiting: HashSet<u64>,
    open_interest: HashMap<String, f64>,
}

/// The request/response correlator. Runs on the single engine event task;
/// every message is handled to completion before the next is taken.
pub(crate) struct Router {
    requester: Requester,
    enrich: Option<EnrichmentBuffer>,
}

impl Router {
    pub(crate) fn new(requester: Requester) -> Self {
        Self {
            requester,
            enrich: None,
        }
    }

    /// Transport came up: re-issue the standing requests. The connection
    /// layer never replays pending calls itself.
    pub(crate) fn on_connected(&mut self) {
        let _ = self.requester.request_trade_history();
        let _ = self.requester.request_spot();
    }

    /// Transport went down. Its pending calls are discarded, so an
    /// enrichment batch still waiting on them finalises with whatever open
    /// interest it has gathered.
    pub(crate) fn on_disconnected(&mut self) {
        if let Some(buffer) = self.enrich.take() {
            debug!(
                trades = buffer.raw_trades.len(),
                "finalising enrichment after disconnect"
            );
            self.finalize(buffer);
        }
    }

    /// Handle one inbound transport message.
    pub(crate) fn on_message(&mut self, raw: &str) {
        let envelope: RpcEnvelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping undecodable feed message");
                return;
            }
        };

        let call = envelope.id.and_then(|id| self.requester.conn.take_call(id));

        if let Some(error) = envelope.error {
            self.on_upstream_error(call, &error);
            return;
        }

        let Some(result) = envelope.result else {
            debug!("ignoring envelope with neither result nor error");
            return;
        };

        match call {
            Some(call) => match call.purpose {
                CallPurpose::TradeHistory => self.on_trade_history(result),
                CallPurpose::SpotTicker => self.on_spot_ticker(result),
                CallPurpose::InstrumentTicker(instrument) => {
                    self.on_instrument_ticker(call.id, instrument, result)
                }
                CallPurpose::SpotFeed => self.on_spot_feed(result),
            },
            // No matching pending call: an unsolicited push. Route by
            // payload shape.
            None => {
                if protocol::looks_like_trade_history(&result) {
                    self.on_trade_history(result);
                } else if protocol::looks_like_ticker(&result) {
                    self.on_spot_ticker(result);
                } else {
                    debug!("ignoring unrecognised push payload");
                }
            }
        }
    }

    fn on_upstream_error(&mut self, call: Option<PendingCall>, error: &RpcErrorBody) {
        let Some(call) = call else {
            warn!(message = error.message_or_default(), "feed reported an error");
            self.requester
                .conn
                .set_error(FlowError::Upstream(error.message_or_default().to_string()));
            return;
        };

        match call.purpose {
            CallPurpose::TradeHistory => {
                warn!(message = error.message_or_default(), "trade history fetch failed");
                self.requester
                    .conn
                    .set_error(FlowError::Upstream(error.message_or_default().to_string()));
            }
            // The spot reference has a second source; fall back before
            // surfacing anything.
            CallPurpose::SpotTicker => {
                debug!(
                    message = error.message_or_default(),
                    "spot ticker failed, trying spot feed"
                );
                let _ = self.requester.request_spot_feed_fallback();
            }
            // The spot feed was already the fallback: publish the terminal
            // zero snapshot.
            CallPurpose::SpotFeed => {
                debug!(message = error.message_or_default(), "spot feed fallback failed");
                self.requester.working.lock().replace_spot(SpotPriceSnapshot {
                    price: 0.0,
                    change_24h_pct: 0.0,
                    is_stale: false,
                });
            }
            // Enrichment tickers degrade silently: the trade keeps an
            // unknown open interest.
            CallPurpose::InstrumentTicker(instrument) => {
                debug!(
                    instrument = %instrument,
                    message = error.message_or_default(),
                    "open-interest ticker failed"
                );
                self.resolve_enrichment_slot(call.id);
            }
        }
    }

    fn on_trade_history(&mut self, result: Value) {
        let history: TradeHistoryResult = match serde_json::from_value(result) {
            Ok(history) => history,
            Err(e) => {
                warn!(error = %e, "dropping undecodable trade-history payload");
                return;
            }
        };

        // Last response wins: a newer history supersedes any batch still
        // waiting on enrichment.
        if self.enrich.take().is_some() {
            debug!("newer trade history supersedes in-flight enrichment");
        }

        let limit = self.requester.intents.lock().enrich_limit;
        let mut instruments: Vec<String> = Vec::new();
        for trade in &history.trades {
            if instruments.len() >= limit {
                break;
            }
            let name = &trade.instrument_name;
            if !name.is_empty() && !instruments.contains(name) {
                instruments.push(name.clone());
            }
        }

        let mut awaiting = HashSet::new();
        for instrument in instruments {
            if let Some(id) = self.requester.conn.send(
                protocol::METHOD_TICKER,
                protocol::ticker_params(&instrument),
                CallPurpose::InstrumentTicker(instrument.clone()),
            ) {
                awaiting.insert(id);
            }
        }

        let buffer = EnrichmentBuffer {
            raw_trades: history.trades,
            awaiting,
            open_interest: HashMap::new(),
        };
        if buffer.awaiting.is_empty() {
            self.finalize(buffer);
        } else {
            debug!(tickers = buffer.awaiting.len(), "awaiting open-interest enrichment");
            self.enrich = Some(buffer);
        }
    }

    fn on_instrument_ticker(&mut self, id: u64, instrument: String, result: Value) {
        let Some(buffer) = self.enrich.as_mut() else {
            debug!(instrument = %instrument, "ticker response with no enrichment in flight");
            return;
        };
        if !buffer.awaiting.contains(&id) {
            debug!(instrument = %instrument, "ticker response from a superseded batch");
            return;
        }

        match serde_json::from_value::<TickerResult>(result) {
            Ok(ticker) => {
                if let Some(open_interest) = ticker.open_interest {
                    buffer.open_interest.insert(instrument, open_interest);
                }
            }
            Err(e) => warn!(error = %e, "dropping undecodable ticker payload"),
        }

        self.resolve_enrichment_slot(id);
    }

    /// Mark one enrichment ticker call as settled (answered or failed) and
    /// finalise the batch once none remain.
    fn resolve_enrichment_slot(&mut self, id: u64) {
        let complete = match self.enrich.as_mut() {
            Some(buffer) => {
                buffer.awaiting.remove(&id);
                buffer.awaiting.is_empty()
            }
            None => false,
        };
        if complete {
            if let Some(buffer) = self.enrich.take() {
                self.finalize(buffer);
            }
        }
    }

    /// Classify the buffered batch once and replace the canonical list.
    fn finalize(&mut self, buffer: EnrichmentBuffer) {
        let thresholds = self.requester.intents.lock().thresholds;
        self.requester.working.lock().replace_raw_trades(
            &buffer.raw_trades,
            &thresholds,
            &buffer.open_interest,
        );
        debug!(trades = buffer.raw_trades.len(), "replaced canonical trade list");
    }

    fn on_spot_ticker(&mut self, result: Value) {
        match serde_json::from_value::<TickerResult>(result) {
            Ok(ticker) => {
                self.requester.working.lock().replace_spot(SpotPriceSnapshot {
                    price: ticker.reference_price(),
                    change_24h_pct: ticker.change_24h_pct(),
                    is_stale: false,
                });
            }
            Err(e) => warn!(error = %e, "dropping undecodable ticker payload"),
        }
    }

    fn on_spot_feed(&mut self, result: Value) {
        match serde_json::from_value::<SpotFeedResult>(result) {
            Ok(feed) => {
                let price = feed.prices.first().and_then(|point| point.price).unwrap_or(0.0);
                self.requester.working.lock().replace_spot(SpotPriceSnapshot {
                    price,
                    change_24h_pct: 0.0,
                    is_stale: false,
                });
            }
            Err(e) => warn!(error = %e, "dropping undecodable spot feed payload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::WorkingSet;
    use crate::config::FlowConfig;
    use crate::connection::{Connection, ConnectionDriver, ConnectionState};
    use crate::engine::Intents;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Router, Requester, ConnectionDriver) {
        let (conn, driver) =
            Connection::new("ws://127.0.0.1:1".to_string(), Duration::from_millis(10));
        conn.force_state(ConnectionState::Connected);
        let requester = Requester {
            conn,
            intents: Arc::new(Mutex::new(Intents::from_config(&FlowConfig::default()))),
            working: Arc::new(Mutex::new(WorkingSet::new())),
        };
        (Router::new(requester.clone()), requester, driver)
    }

    fn next_frame(driver: &mut ConnectionDriver) -> Value {
        serde_json::from_str(&driver.outbound_rx.try_recv().expect("expected outbound frame"))
            .expect("outbound frame is JSON")
    }

    fn two_trades() -> Value {
        json!([
            {
                "instrument_name": "ETH-20240315-3000-C",
                "trade_price": 500.0,
                "trade_amount": 30.0,
                "timestamp": 1_000,
                "trade_id": "big"
            },
            {
                "instrument_name": "ETH-20240315-3000-P",
                "trade_price": 5.0,
                "trade_amount": 100.0,
                "timestamp": 2_000,
                "trade_id": "small"
            }
        ])
    }

    #[test]
    fn test_history_response_enriches_then_replaces() {
        let (mut router, requester, mut driver) = setup();

        let history_id = requester.request_trade_history().unwrap();
        let history_frame = next_frame(&mut driver);
        assert_eq!(history_frame["method"], "public/get_trade_history");
        assert_eq!(history_frame["params"]["instrument_type"], "option");

        router.on_message(
            &json!({"id": history_id, "result": {"trades": two_trades()}}).to_string(),
        );

        // Two unique instruments produce two enrichment ticker calls; the
        // canonical list is withheld until both settle.
        let ticker_a = next_frame(&mut driver);
        let ticker_b = next_frame(&mut driver);
        assert_eq!(ticker_a["method"], "public/get_ticker");
        assert_eq!(ticker_b["method"], "public/get_ticker");
        assert!(requester.working.lock().trades().is_empty());

        router.on_message(
            &json!({
                "id": ticker_a["id"].as_u64().unwrap(),
                "result": {"mark_price": 1.0, "open_interest": "100000"}
            })
            .to_string(),
        );
        assert!(requester.working.lock().trades().is_empty());
        router.on_message(
            &json!({
                "id": ticker_b["id"].as_u64().unwrap(),
                "result": {"mark_price": 1.0, "open_interest": "100000"}
            })
            .to_string(),
        );

        let working = requester.working.lock();
        let trades = working.trades();
        assert_eq!(trades.len(), 2);
        assert!(trades[0].is_unusual);
        assert_eq!(trades[0].premium, 15_000.0);
        assert_eq!(trades[0].raw.trade_id, "big");
        assert!(!trades[1].is_unusual);

        let summary = WorkingSet::summarize(trades);
        assert_eq!(summary.count, 2);
        assert_eq!(summary.unusual_count, 1);
        assert_eq!(summary.total_premium, 15_500.0);
    }

    #[test]
    fn test_enrichment_open_interest_feeds_the_ratio_check() {
        let (mut router, requester, mut driver) = setup();

        let history_id = requester.request_trade_history().unwrap();
        let _ = next_frame(&mut driver);
        router.on_message(
            &json!({"id": history_id, "result": {"trades": [{
                "instrument_name": "ETH-20240315-3000-C",
                "trade_price": 1.0,
                "trade_amount": 21.0,
                "timestamp": 1_000
            }]}})
            .to_string(),
        );

        let ticker = next_frame(&mut driver);
        assert_eq!(ticker["params"]["instrument_name"], "ETH-20240315-3000-C");
        router.on_message(
            &json!({
                "id": ticker["id"].as_u64().unwrap(),
                "result": {"mark_price": 1.0, "open_interest": 1_000.0}
            })
            .to_string(),
        );

        let working = requester.working.lock();
        let trade = &working.trades()[0];
        // 21 / 1000 = 2.1% >= 2%
        assert!(trade.is_unusual);
        assert_eq!(trade.flags[0].label, "2.1% of OI");
    }

    #[test]
    fn test_failed_enrichment_ticker_degrades_silently() {
        let (mut router, requester, mut driver) = setup();

        let history_id = requester.request_trade_history().unwrap();
        let _ = next_frame(&mut driver);
        router.on_message(
            &json!({"id": history_id, "result": {"trades": [{
                "instrument_name": "ETH-20240315-3000-C",
                "trade_price": 1.0,
                "trade_amount": 1_000_000.0,
                "timestamp": 1_000
            }]}})
            .to_string(),
        );

        let ticker = next_frame(&mut driver);
        router.on_message(
            &json!({
                "id": ticker["id"].as_u64().unwrap(),
                "error": {"message": "instrument not found"}
            })
            .to_string(),
        );

        // Batch finalised without open interest: no ratio flag, no error.
        let working = requester.working.lock();
        assert_eq!(working.trades().len(), 1);
        assert!(!working.trades()[0].is_unusual);
        drop(working);
        assert_eq!(requester.conn.last_error(), None);
    }

    #[test]
    fn test_last_history_response_wins() {
        let (mut router, requester, mut driver) = setup();

        // Two refreshes race before either resolves.
        let first_id = requester.request_trade_history().unwrap();
        let second_id = requester.request_trade_history().unwrap();
        let _ = next_frame(&mut driver);
        let _ = next_frame(&mut driver);

        router.on_message(
            &json!({"id": first_id, "result": {"trades": [{
                "instrument_name": "ETH-20240315-3000-C",
                "trade_price": 1.0,
                "trade_amount": 1.0,
                "timestamp": 1_000,
                "trade_id": "stale"
            }]}})
            .to_string(),
        );
        let stale_ticker = next_frame(&mut driver);

        router.on_message(
            &json!({"id": second_id, "result": {"trades": [{
                "instrument_name": "BTC-20240628-65000-P",
                "trade_price": 2.0,
                "trade_amount": 2.0,
                "timestamp": 2_000,
                "trade_id": "fresh"
            }]}})
            .to_string(),
        );
        let fresh_ticker = next_frame(&mut driver);

        // The superseded batch's ticker answer must not resurrect it.
        router.on_message(
            &json!({
                "id": stale_ticker["id"].as_u64().unwrap(),
                "result": {"mark_price": 1.0, "open_interest": 10.0}
            })
            .to_string(),
        );
        router.on_message(
            &json!({
                "id": fresh_ticker["id"].as_u64().unwrap(),
                "result": {"mark_price": 1.0, "open_interest": 10.0}
            })
            .to_string(),
        );

        let working = requester.working.lock();
        assert_eq!(working.trades().len(), 1);
        assert_eq!(working.trades()[0].raw.trade_id, "fresh");
    }

    #[test]
    fn test_disconnect_finalises_pending_enrichment() {
        let (mut router, requester, mut driver) = setup();

        let history_id = requester.request_trade_history().unwrap();
        let _ = next_frame(&mut driver);
        router.on_message(
            &json!({"id": history_id, "result": {"trades": two_trades()}}).to_string(),
        );
        assert!(requester.working.lock().trades().is_empty());

        // The enrichment tickers will never answer: classify with what we have.
        router.on_disconnected();
        assert_eq!(requester.working.lock().trades().len(), 2);
    }

    #[test]
    fn test_upstream_error_surfaces_for_history() {
        let (mut router, requester, mut driver) = setup();

        let history_id = requester.request_trade_history().unwrap();
        let _ = next_frame(&mut driver);
        router.on_message(
            &json!({"id": history_id, "error": {"message": "rate limited"}}).to_string(),
        );

        assert_eq!(
            requester.conn.last_error().map(|e| e.to_string()),
            Some("upstream error: rate limited".to_string())
        );
        // The call was consumed: no pending entries remain.
        assert_eq!(requester.conn.pending_calls(), 0);
    }

    #[test]
    fn test_spot_ticker_replaces_snapshot() {
        let (mut router, requester, mut driver) = setup();

        let spot_id = requester.request_spot().unwrap();
        assert!(requester.working.lock().spot().is_stale);
        let frame = next_frame(&mut driver);
        assert_eq!(frame["params"]["instrument_name"], "ETH-PERP");

        router.on_message(
            &json!({
                "id": spot_id,
                "result": {"mark_price": "2000.5", "stats": {"price_change": "1.25"}}
            })
            .to_string(),
        );

        let spot = requester.working.lock().spot();
        assert_eq!(spot.price, 2_000.5);
        assert_eq!(spot.change_24h_pct, 1.25);
        assert!(!spot.is_stale);
    }

    #[test]
    fn test_spot_ticker_error_falls_back_to_spot_feed() {
        let (mut router, requester, mut driver) = setup();

        let spot_id = requester.request_spot().unwrap();
        let _ = next_frame(&mut driver);
        router.on_message(&json!({"id": spot_id, "error": {"message": "no ticker"}}).to_string());

        let fallback = next_frame(&mut driver);
        assert_eq!(fallback["method"], "public/get_spot_feed_history");
        assert_eq!(fallback["params"]["page_size"], 1);

        router.on_message(
            &json!({
                "id": fallback["id"].as_u64().unwrap(),
                "result": {"prices": [{"price": "1987.5"}]}
            })
            .to_string(),
        );

        let spot = requester.working.lock().spot();
        assert_eq!(spot.price, 1_987.5);
        assert_eq!(spot.change_24h_pct, 0.0);
        assert!(!spot.is_stale);
        // Spot failures never surface as user-visible errors.
        assert_eq!(requester.conn.last_error(), None);
    }

    #[test]
    fn test_spot_feed_error_publishes_terminal_zero_snapshot() {
        let (mut router, requester, mut driver) = setup();

        let spot_id = requester.request_spot().unwrap();
        let _ = next_frame(&mut driver);
        router.on_message(&json!({"id": spot_id, "error": {"message": "no ticker"}}).to_string());
        let fallback = next_frame(&mut driver);
        router.on_message(
            &json!({
                "id": fallback["id"].as_u64().unwrap(),
                "error": {"message": "no feed"}
            })
            .to_string(),
        );

        let spot = requester.working.lock().spot();
        assert_eq!(spot.price, 0.0);
        assert!(!spot.is_stale);
    }

    #[test]
    fn test_unsolicited_pushes_route_by_shape() {
        let (mut router, requester, _driver) = setup();

        // Trades collection with no id: bulk replace.
        router.on_message(&json!({"result": {"trades": two_trades()}}).to_string());
        // No enrichment calls were pending for it, but instruments were
        // requested; awaiting is non-empty so the list is withheld. Drop the
        // connection to flush.
        router.on_disconnected();
        assert_eq!(requester.working.lock().trades().len(), 2);

        // Ticker-shaped push with no id: spot replace.
        router.on_message(&json!({"result": {"mark_price": 42.0}}).to_string());
        assert_eq!(requester.working.lock().spot().price, 42.0);

        // Unknown shapes and malformed messages are ignored without effect.
        router.on_message(&json!({"result": {"subscriptions": ["x"]}}).to_string());
        router.on_message("not json at all");
        assert_eq!(requester.working.lock().trades().len(), 2);
        assert_eq!(requester.conn.last_error(), None);
    }
}
