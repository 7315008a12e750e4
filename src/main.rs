//! Bridge binary
//!
//! Wires the market data consumer, order gateway, and user-data stream
//! together and stands in for the trade engine on the far ends of the
//! queues, draining and logging responses and market updates.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use binance_bridge::types::MarketUpdateKind;
use binance_bridge::{
    spsc_channel, Authenticator, BridgeConfig, ClientRequest, ClientResponse, MarketDataConsumer,
    MarketUpdate, OrderGateway, PriceTap, RestClient, Shutdown, SymbolCatalog, UserDataStream,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("starting binance bridge");

    let (config, credentials) = BridgeConfig::from_env()?;
    info!(
        symbols = ?config.symbols(),
        testnet = config.use_testnet,
        "configuration loaded"
    );

    let shutdown = Shutdown::new();
    let auth = Arc::new(Authenticator::new(credentials));
    let rest = Arc::new(RestClient::new(config.rest_base()));
    rest.ping().await?;
    info!("exchange reachable");

    let catalog = Arc::new(SymbolCatalog::new(
        config.tickers.iter().map(|t| (t.ticker_id, t.symbol.clone())),
        Duration::from_secs(config.cache_settings.symbol_info_minutes * 60),
    ));
    let tap = PriceTap::new();

    // The engine seam: a real trade engine owns the far ends of these
    // queues. The binary drains them below.
    let (requests_tx, requests_rx) = spsc_channel::<ClientRequest>(config.queue_capacity);
    let (responses_tx, responses_rx) = spsc_channel::<ClientResponse>(config.queue_capacity);
    let (updates_tx, updates_rx) = spsc_channel::<MarketUpdate>(config.queue_capacity);

    let consumer = MarketDataConsumer::new(&config, rest.clone(), tap.clone(), shutdown.clone());
    let mut handles = consumer.spawn(updates_tx);

    let (user_tx, user_rx) = mpsc::unbounded_channel();
    let user_stream = UserDataStream::new(
        rest.clone(),
        auth.clone(),
        config.ws_base().to_string(),
        config.max_reconnect_attempts,
        user_tx,
        shutdown.clone(),
    );
    handles.push(tokio::spawn(user_stream.run()));

    let gateway = OrderGateway::new(
        &config,
        rest,
        auth,
        catalog,
        tap,
        requests_rx,
        responses_tx,
        user_rx,
        shutdown.clone(),
    )?;
    handles.push(tokio::spawn(gateway.run()));

    let drain_shutdown = shutdown.clone();
    handles.push(tokio::spawn(async move {
        let mut updates_rx = updates_rx;
        let mut responses_rx = responses_rx;
        let mut updates_seen: u64 = 0;
        let mut trades_seen: u64 = 0;
        let mut last_report = Instant::now();
        loop {
            let mut worked = false;
            while let Some(update) = updates_rx.pop() {
                updates_seen += 1;
                if update.kind == MarketUpdateKind::Trade {
                    trades_seen += 1;
                }
                worked = true;
            }
            while let Some(response) = responses_rx.pop() {
                info!(
                    kind = ?response.kind,
                    order_id = response.client_order_id,
                    exec_qty = response.exec_qty,
                    leaves_qty = response.leaves_qty,
                    "client response"
                );
                worked = true;
            }
            if !drain_shutdown.is_running() {
                break;
            }
            if !worked {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            if last_report.elapsed() >= Duration::from_secs(30) {
                info!(updates_seen, trades_seen, "market data status");
                last_report = Instant::now();
            }
        }
    }));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.stop();
    drop(requests_tx);

    for mut handle in handles {
        if tokio::time::timeout(Duration::from_secs(5), &mut handle)
            .await
            .is_err()
        {
            handle.abort();
        }
    }

    info!("binance bridge stopped");
    Ok(())
}
