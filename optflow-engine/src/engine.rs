//! Engine lifecycle and the presentation boundary.
//!
//! One [`FlowEngine`] per mounted consumer: an explicit object constructed
//! on mount and torn down on unmount, never module-level singleton state.
//! Everything the presentation layer sees crosses this boundary as either a
//! read-only snapshot accessor or an intent setter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::aggregator::{FlowSummary, SideFilter, SpotPriceSnapshot, WorkingSet};
use crate::config::FlowConfig;
use crate::connection::{CallPurpose, Connection, ConnectionState, FeedEvent};
use crate::protocol;
use crate::router::Router;
use crate::trade::{ClassifiedTrade, Thresholds};

/// View intent supplied by the presentation boundary: selected currency,
/// filters, window, and the runtime-adjustable thresholds.
#[derive(Debug, Clone)]
pub(crate) struct Intents {
    pub(crate) currency: String,
    pub(crate) side_filter: SideFilter,
    pub(crate) min_premium: f64,
    pub(crate) history_window: Duration,
    pub(crate) thresholds: Thresholds,
    pub(crate) page_size: u32,
    pub(crate) enrich_limit: usize,
}

impl Intents {
    pub(crate) fn from_config(config: &FlowConfig) -> Self {
        Self {
            currency: config.currency.clone(),
            side_filter: SideFilter::All,
            min_premium: 0.0,
            history_window: config.history_window,
            thresholds: config.thresholds,
            page_size: config.page_size,
            enrich_limit: config.enrich_limit,
        }
    }
}

/// Issues the standing feed requests. Shared by the router (reconnect
/// refresh, spot fallback), the periodic timers, and the intent setters.
#[derive(Clone)]
pub(crate) struct Requester {
    pub(crate) conn: Connection,
    pub(crate) intents: Arc<Mutex<Intents>>,
    pub(crate) working: Arc<Mutex<WorkingSet>>,
}

impl Requester {
    /// Fetch the trade history for the selected currency over the
    /// configured window. Returns `None` (no action) while disconnected.
    pub(crate) fn request_trade_history(&self) -> Option<u64> {
        let (currency, window, page_size) = {
            let intents = self.intents.lock();
            (
                intents.currency.clone(),
                intents.history_window,
                intents.page_size,
            )
        };
        let to_ms = Utc::now().timestamp_millis();
        let from_ms = to_ms - window.as_millis() as i64;
        let id = self.conn.send(
            protocol::METHOD_TRADE_HISTORY,
            protocol::trade_history_params(&currency, from_ms, to_ms, page_size),
            CallPurpose::TradeHistory,
        )?;
        // A fresh fetch resets any previously surfaced error.
        self.conn.clear_error();
        Some(id)
    }

    /// Refresh the spot reference for the selected currency. The current
    /// snapshot is marked stale for the duration of the fetch.
    pub(crate) fn request_spot(&self) -> Option<u64> {
        let currency = self.intents.lock().currency.clone();
        self.working.lock().mark_spot_stale();
        self.conn.send(
            protocol::METHOD_TICKER,
            protocol::ticker_params(&protocol::perp_instrument(&currency)),
            CallPurpose::SpotTicker,
        )
    }

    /// Second-chance spot source, used when the perp ticker call fails.
    pub(crate) fn request_spot_feed_fallback(&self) -> Option<u64> {
        let currency = self.intents.lock().currency.clone();
        self.conn.send(
            protocol::METHOD_SPOT_FEED_HISTORY,
            protocol::spot_feed_params(&currency),
            CallPurpose::SpotFeed,
        )
    }
}

enum RefreshKind {
    TradeHistory,
    Spot,
}

/// The stream-ingestion-and-classification engine.
///
/// Owns the feed connection, the correlator, the working set, and the
/// periodic refresh timers. Dropping the engine without calling
/// [`FlowEngine::shutdown`] leaves tasks to wind down on their own; calling
/// it tears everything down deterministically.
pub struct FlowEngine {
    requester: Requester,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl FlowEngine {
    /// Construct the engine and spawn its tasks: the connection driver, the
    /// single event loop, and the trade/spot refresh timers.
    pub fn spawn(config: FlowConfig) -> Self {
        let (conn, driver) = Connection::new(config.feed_url.clone(), config.reconnect_delay);
        let requester = Requester {
            conn,
            intents: Arc::new(Mutex::new(Intents::from_config(&config))),
            working: Arc::new(Mutex::new(WorkingSet::new())),
        };

        let (events_tx, events_rx) = mpsc::channel(1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let router = Router::new(requester.clone());

        let tasks = vec![
            tokio::spawn(driver.run(events_tx, shutdown_rx.clone())),
            tokio::spawn(run_event_loop(events_rx, router)),
            tokio::spawn(run_refresh_timer(
                requester.clone(),
                config.trade_refresh,
                RefreshKind::TradeHistory,
                shutdown_rx.clone(),
            )),
            tokio::spawn(run_refresh_timer(
                requester.clone(),
                config.spot_refresh,
                RefreshKind::Spot,
                shutdown_rx,
            )),
        ];

        Self {
            requester,
            shutdown_tx,
            tasks,
        }
    }

    // ---- intent setters ----

    /// Select the currency whose options flow is watched. Marks the spot
    /// snapshot stale and triggers fresh history and spot fetches.
    pub fn select_currency(&self, currency: impl Into<String>) {
        let currency = currency.into();
        {
            let mut intents = self.requester.intents.lock();
            if intents.currency == currency {
                return;
            }
            intents.currency = currency;
        }
        let _ = self.requester.request_trade_history();
        let _ = self.requester.request_spot();
    }

    pub fn set_side_filter(&self, filter: SideFilter) {
        self.requester.intents.lock().side_filter = filter;
    }

    pub fn set_min_premium(&self, min_premium: f64) {
        self.requester.intents.lock().min_premium = min_premium;
    }

    /// Change the trade-history lookback window and refetch.
    pub fn set_history_window(&self, window: Duration) {
        self.requester.intents.lock().history_window = window;
        let _ = self.requester.request_trade_history();
    }

    /// Adjust the unusual-flow thresholds at runtime. They apply from the
    /// next classification pass, so a refetch is triggered.
    pub fn set_thresholds(&self, thresholds: Thresholds) {
        self.requester.intents.lock().thresholds = thresholds;
        let _ = self.requester.request_trade_history();
    }

    /// Manual refresh of both the trade history and the spot reference.
    pub fn refresh(&self) {
        let _ = self.requester.request_trade_history();
        let _ = self.requester.request_spot();
    }

    /// Suppress (false) or resume (true) automatic reconnection while the
    /// consumer is backgrounded.
    pub fn set_foreground(&self, foreground: bool) {
        self.requester.conn.set_foreground(foreground);
    }

    // ---- read-only snapshot accessors ----

    /// The canonical classified list, unusual trades first.
    pub fn trades(&self) -> Vec<ClassifiedTrade> {
        self.requester.working.lock().trades().to_vec()
    }

    /// The canonical list narrowed by the current side and premium filters.
    pub fn filtered_trades(&self) -> Vec<ClassifiedTrade> {
        let (side, min_premium) = {
            let intents = self.requester.intents.lock();
            (intents.side_filter, intents.min_premium)
        };
        self.requester.working.lock().filtered(side, min_premium)
    }

    /// The `n` largest trades by unsigned quantity.
    pub fn top_by_quantity(&self, n: usize) -> Vec<ClassifiedTrade> {
        self.requester.working.lock().top_by_quantity(n)
    }

    /// Summary over the canonical list.
    pub fn summary(&self) -> FlowSummary {
        WorkingSet::summarize(self.requester.working.lock().trades())
    }

    pub fn spot(&self) -> SpotPriceSnapshot {
        self.requester.working.lock().spot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.requester.conn.state()
    }

    /// Subscribe to connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.requester.conn.state_changes()
    }

    /// The current user-visible error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.requester.conn.last_error().map(|error| error.to_string())
    }

    /// When the canonical list was last replaced.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.requester.working.lock().last_replaced()
    }

    /// Tear the engine down: cancel the timers, close the transport, and
    /// wait for every task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// The single message-processing context: each event runs to completion
/// before the next is taken, so no two inbound messages are ever handled
/// concurrently.
async fn run_event_loop(mut events: mpsc::Receiver<FeedEvent>, mut router: Router) {
    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::Up => router.on_connected(),
            FeedEvent::Message(text) => router.on_message(&text),
            FeedEvent::Down { reason } => {
                if let Some(reason) = reason {
                    debug!(%reason, "feed connection lost");
                }
                router.on_disconnected();
            }
        }
    }
}

async fn run_refresh_timer(
    requester: Requester,
    period: Duration,
    kind: RefreshKind,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    // The first tick fires immediately; the initial fetch is owned by the
    // connection Up event, so skip it.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match kind {
                    RefreshKind::TradeHistory => {
                        let _ = requester.request_trade_history();
                    }
                    RefreshKind::Spot => {
                        let _ = requester.request_spot();
                    }
                }
            }
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
