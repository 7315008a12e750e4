//! Market data consumer
//!
//! Maintains a live, sequence-consistent order book per configured
//! symbol and emits market updates into the engine-bound queue. Each
//! symbol gets two WebSocket streams (diff depth and trades), each
//! driven by its own task with reconnect backoff; a snapshot refresher
//! task re-syncs any book flagged dirty; a single forwarder task owns
//! the SPSC producer so the single-producer contract holds.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::orderbook::{DiffOutcome, OrderBook};
use crate::parser::{DepthSnapshot, DepthUpdate, TradeEvent};
use crate::queue::Producer;
use crate::rest::RestClient;
use crate::types::{MarketUpdate, MarketUpdateKind, Price, Side, TickerId};
use crate::websocket::{Backoff, WsClient};
use crate::Shutdown;

/// Buffered pre-sync depth events per symbol; beyond this the oldest
/// are discarded (the re-sync snapshot covers them).
const MAX_BUFFERED_EVENTS: usize = 4096;

/// Bracket-restart attempts within one refresher pass.
const MAX_SYNC_ATTEMPTS: u32 = 3;

/// Last observed price per ticker, written by the consumer and read by
/// the gateway without consuming engine-bound queue entries.
#[derive(Clone, Default)]
pub struct PriceTap {
    inner: Arc<RwLock<std::collections::HashMap<TickerId, Price>>>,
}

impl PriceTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ticker_id: TickerId, price: Price) {
        self.inner.write().unwrap().insert(ticker_id, price);
    }

    pub fn get(&self, ticker_id: TickerId) -> Option<Price> {
        self.inner.read().unwrap().get(&ticker_id).copied()
    }
}

struct SymbolFeed {
    symbol: String,
    stream_symbol: String,
    ticker_id: TickerId,
    book: Mutex<OrderBook>,
    /// Depth events held while the book awaits a snapshot.
    buffer: Mutex<VecDeque<DepthUpdate>>,
}

pub struct MarketDataConsumer {
    feeds: Vec<Arc<SymbolFeed>>,
    rest: Arc<RestClient>,
    ws_base: String,
    depth_limit: u32,
    snapshot_interval: Duration,
    max_reconnect_attempts: u32,
    tap: PriceTap,
    shutdown: Shutdown,
}

impl MarketDataConsumer {
    pub fn new(
        config: &BridgeConfig,
        rest: Arc<RestClient>,
        tap: PriceTap,
        shutdown: Shutdown,
    ) -> Self {
        let feeds = config
            .tickers
            .iter()
            .map(|t| {
                Arc::new(SymbolFeed {
                    symbol: t.symbol.clone(),
                    stream_symbol: t.symbol.to_lowercase(),
                    ticker_id: t.ticker_id,
                    book: Mutex::new(OrderBook::new(&t.symbol, t.ticker_id)),
                    buffer: Mutex::new(VecDeque::new()),
                })
            })
            .collect();

        Self {
            feeds,
            rest,
            ws_base: config.ws_base().to_string(),
            depth_limit: config.depth_limit,
            snapshot_interval: Duration::from_secs(config.snapshot_interval_secs),
            max_reconnect_attempts: config.max_reconnect_attempts,
            tap,
            shutdown,
        }
    }

    /// Spawn all consumer tasks; returns their handles for joining at
    /// shutdown.
    pub fn spawn(self, updates: Producer<MarketUpdate>) -> Vec<JoinHandle<()>> {
        let (sink, rx) = mpsc::unbounded_channel();
        let refresh = Arc::new(Notify::new());
        let mut handles = Vec::new();

        handles.push(tokio::spawn(forward_updates(
            rx,
            updates,
            self.tap.clone(),
            self.shutdown.clone(),
        )));

        for feed in &self.feeds {
            handles.push(tokio::spawn(run_depth_stream(
                feed.clone(),
                self.ws_base.clone(),
                sink.clone(),
                refresh.clone(),
                self.max_reconnect_attempts,
                self.shutdown.clone(),
            )));
            handles.push(tokio::spawn(run_trade_stream(
                feed.clone(),
                self.ws_base.clone(),
                sink.clone(),
                self.max_reconnect_attempts,
                self.shutdown.clone(),
            )));
        }

        handles.push(tokio::spawn(run_snapshot_refresher(
            self.feeds.clone(),
            self.rest.clone(),
            self.depth_limit,
            self.snapshot_interval,
            sink,
            refresh,
            self.shutdown.clone(),
        )));

        handles
    }
}

/// Drain the internal channel into the SPSC queue and keep the price
/// tap current.
async fn forward_updates(
    mut rx: mpsc::UnboundedReceiver<MarketUpdate>,
    mut updates: Producer<MarketUpdate>,
    tap: PriceTap,
    shutdown: Shutdown,
) {
    while let Some(update) = rx.recv().await {
        if !shutdown.is_running() {
            break;
        }
        match update.kind {
            MarketUpdateKind::Trade => tap.set(update.ticker_id, update.price),
            // The first bid of a serialization is the best bid.
            MarketUpdateKind::Add if update.side == Side::Buy && update.priority == 1 => {
                tap.set(update.ticker_id, update.price)
            }
            _ => {}
        }
        if updates.push(update).is_err() {
            warn!("market update queue full, dropping update");
        }
    }
}

async fn run_depth_stream(
    feed: Arc<SymbolFeed>,
    ws_base: String,
    sink: mpsc::UnboundedSender<MarketUpdate>,
    refresh: Arc<Notify>,
    max_reconnect_attempts: u32,
    shutdown: Shutdown,
) {
    let url = format!("{}/ws/{}@depth", ws_base, feed.stream_symbol);
    let mut backoff = Backoff::new(max_reconnect_attempts);

    while shutdown.is_running() {
        match WsClient::connect(&url).await {
            Ok(mut ws) => {
                info!(symbol = %feed.symbol, "depth stream connected");
                backoff.reset();
                refresh.notify_one();
                while shutdown.is_running() {
                    let frame = tokio::select! {
                        frame = ws.recv() => frame,
                        _ = shutdown.cancelled() => break,
                    };
                    match frame {
                        Ok(Some(text)) => handle_depth_frame(&feed, &text, &sink, &refresh),
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(symbol = %feed.symbol, error = %e, "depth stream dropped");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(symbol = %feed.symbol, error = %e, "depth stream connect failed"),
        }

        if !shutdown.is_running() {
            break;
        }

        // The book cannot be trusted across a disconnect.
        feed.book.lock().unwrap().invalidate();
        refresh.notify_one();

        match backoff.next_delay() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => {
                error!(symbol = %feed.symbol, "depth stream reconnect attempts exhausted");
                break;
            }
        }
    }
}

fn handle_depth_frame(
    feed: &SymbolFeed,
    text: &str,
    sink: &mpsc::UnboundedSender<MarketUpdate>,
    refresh: &Notify,
) {
    let update: DepthUpdate = match serde_json::from_str(text) {
        Ok(u) => u,
        Err(e) => {
            warn!(symbol = %feed.symbol, error = %e, "bad depth frame");
            return;
        }
    };

    let outcome = {
        let mut book = feed.book.lock().unwrap();
        if !book.is_valid() || book.needs_refresh() {
            None
        } else {
            Some(book.apply_diff(
                update.first_update_id,
                update.final_update_id,
                &update.bids,
                &update.asks,
            ))
        }
    };

    match outcome {
        None => {
            // Awaiting a snapshot: buffer for the re-sync procedure.
            let mut buffer = feed.buffer.lock().unwrap();
            if buffer.len() >= MAX_BUFFERED_EVENTS {
                buffer.pop_front();
            }
            buffer.push_back(update);
            drop(buffer);
            refresh.notify_one();
        }
        Some(DiffOutcome::Applied) => {
            let mut out = Vec::new();
            feed.book.lock().unwrap().generate_updates(&mut out);
            for u in out {
                let _ = sink.send(u);
            }
        }
        Some(DiffOutcome::Gap) => {
            debug!(symbol = %feed.symbol, "depth gap, scheduling re-sync");
            refresh.notify_one();
        }
        Some(DiffOutcome::Stale) | Some(DiffOutcome::NotReady) => {}
    }
}

async fn run_trade_stream(
    feed: Arc<SymbolFeed>,
    ws_base: String,
    sink: mpsc::UnboundedSender<MarketUpdate>,
    max_reconnect_attempts: u32,
    shutdown: Shutdown,
) {
    let url = format!("{}/ws/{}@trade", ws_base, feed.stream_symbol);
    let mut backoff = Backoff::new(max_reconnect_attempts);

    while shutdown.is_running() {
        match WsClient::connect(&url).await {
            Ok(mut ws) => {
                info!(symbol = %feed.symbol, "trade stream connected");
                backoff.reset();
                while shutdown.is_running() {
                    let frame = tokio::select! {
                        frame = ws.recv() => frame,
                        _ = shutdown.cancelled() => break,
                    };
                    match frame {
                        Ok(Some(text)) => match serde_json::from_str::<TradeEvent>(&text) {
                            Ok(trade) => {
                                let _ = sink.send(trade_to_update(feed.ticker_id, &trade));
                            }
                            Err(e) => warn!(symbol = %feed.symbol, error = %e, "bad trade frame"),
                        },
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(symbol = %feed.symbol, error = %e, "trade stream dropped");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(symbol = %feed.symbol, error = %e, "trade stream connect failed"),
        }

        if !shutdown.is_running() {
            break;
        }
        match backoff.next_delay() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => {
                error!(symbol = %feed.symbol, "trade stream reconnect attempts exhausted");
                break;
            }
        }
    }
}

/// `m == true` means the buyer was the resting maker, so the aggressor
/// sold into the bid.
fn trade_to_update(ticker_id: TickerId, trade: &TradeEvent) -> MarketUpdate {
    let side = if trade.is_buyer_maker {
        Side::Sell
    } else {
        Side::Buy
    };
    MarketUpdate::trade(ticker_id, side, trade.price, trade.qty)
}

/// Scan all books on a fixed cadence (and on demand after disconnects
/// and gaps) and re-run the snapshot procedure for any flagged dirty.
async fn run_snapshot_refresher(
    feeds: Vec<Arc<SymbolFeed>>,
    rest: Arc<RestClient>,
    depth_limit: u32,
    interval: Duration,
    sink: mpsc::UnboundedSender<MarketUpdate>,
    refresh: Arc<Notify>,
    shutdown: Shutdown,
) {
    info!("snapshot refresher started");
    while shutdown.is_running() {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = refresh.notified() => {}
            _ = shutdown.cancelled() => break,
        }
        if !shutdown.is_running() {
            break;
        }

        for feed in &feeds {
            let dirty = {
                let book = feed.book.lock().unwrap();
                book.needs_refresh() || !book.is_valid()
            };
            if !dirty {
                continue;
            }
            if let Err(e) = resync_book(feed, &rest, depth_limit, &sink).await {
                warn!(symbol = %feed.symbol, error = %e, "book re-sync failed, will retry");
            }
        }
    }
    info!("snapshot refresher stopped");
}

/// The documented synchronization procedure: fetch a snapshot, drop
/// buffered events the snapshot already covers, verify the first
/// retained event brackets `lastUpdateId + 1`, then apply snapshot and
/// buffered events in order.
async fn resync_book(
    feed: &SymbolFeed,
    rest: &RestClient,
    depth_limit: u32,
    sink: &mpsc::UnboundedSender<MarketUpdate>,
) -> Result<()> {
    for _ in 0..MAX_SYNC_ATTEMPTS {
        let snapshot: DepthSnapshot = rest
            .get(
                "/api/v3/depth",
                &[
                    ("symbol", feed.symbol.clone()),
                    ("limit", depth_limit.to_string()),
                ],
            )
            .await?;
        let u0 = snapshot.last_update_id;

        let mut events: Vec<DepthUpdate> = feed.buffer.lock().unwrap().drain(..).collect();
        if !screen_buffered_events(&mut events, u0) {
            // Snapshot landed behind the buffered stream; put the
            // events back and fetch a fresh one.
            debug!(symbol = %feed.symbol, u0, "snapshot does not bracket buffer, restarting");
            let mut buffer = feed.buffer.lock().unwrap();
            for event in events.into_iter().rev() {
                buffer.push_front(event);
            }
            continue;
        }

        let mut out = Vec::new();
        {
            let mut book = feed.book.lock().unwrap();
            book.apply_snapshot(u0, &snapshot.bids, &snapshot.asks);
            for event in &events {
                book.apply_diff(
                    event.first_update_id,
                    event.final_update_id,
                    &event.bids,
                    &event.asks,
                );
            }
            book.generate_updates(&mut out);
        }
        info!(
            symbol = %feed.symbol,
            last_update_id = u0,
            replayed = events.len(),
            "order book re-synced"
        );
        for u in out {
            let _ = sink.send(u);
        }
        return Ok(());
    }

    Err(BridgeError::ReconcileExhausted(feed.symbol.clone()))
}

/// Drop events the snapshot already covers and check that the first
/// retained event satisfies `U <= lastUpdateId + 1 <= u`. Returns false
/// when the procedure must restart with a fresh snapshot.
fn screen_buffered_events(events: &mut Vec<DepthUpdate>, last_update_id: u64) -> bool {
    events.retain(|e| e.final_update_id >= last_update_id + 1);
    match events.first() {
        Some(first) => {
            first.first_update_id <= last_update_id + 1
                && last_update_id + 1 <= first.final_update_id
        }
        None => true,
    }
}
