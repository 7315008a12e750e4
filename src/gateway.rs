//! Order gateway
//!
//! A single processing loop drains the engine's request queue and the
//! user-data channel: NEW and CANCEL requests are validated against the
//! exchange trading rules, signed, and submitted over REST; execution
//! reports come back through the user-data stream and are translated
//! into client responses. Failures never escape the loop; they become
//! `CancelRejected` responses.

use reqwest::Method;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::catalog::{SymbolCatalog, SymbolInfo};
use crate::config::BridgeConfig;
use crate::consumer::PriceTap;
use crate::error::{BridgeError, Result};
use crate::parser::{AccountInfo, AccountPosition, NewOrderAck, TickerPrice, UserDataEvent};
use crate::queue::{Consumer, Producer};
use crate::rest::RestClient;
use crate::types::{
    decimal_from_f64, decimals_of, encode_client_order_id, decode_client_order_id, format_decimal,
    price_to_decimal, qty_from_decimal, ClientId, ClientRequest, ClientResponse, OrderId, Qty,
    RequestKind, ResponseKind, Side, TickerId,
};
use crate::user_stream::UserStreamEvent;
use crate::Shutdown;

/// Idle poll sleep; keeps request handoff latency in the low
/// milliseconds without spinning.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Fraction of the free balance considered usable, leaving headroom for
/// fees.
const USABLE_BALANCE: &str = "0.95";

/// Free-balance cache keyed by asset, refreshed from the signed account
/// endpoint and updated in place from account-position events.
struct BalanceCache {
    entries: HashMap<String, Decimal>,
    fetched_at: Option<Instant>,
    ttl: Duration,
}

impl BalanceCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            fetched_at: None,
            ttl,
        }
    }

    fn fresh(&self, asset: &str) -> Option<Decimal> {
        let live = self.fetched_at.map(|at| at.elapsed() < self.ttl)?;
        if live {
            self.entries.get(asset).copied()
        } else {
            None
        }
    }

    fn refresh(&mut self, account: &AccountInfo) {
        self.entries.clear();
        for balance in &account.balances {
            if let Ok(free) = Decimal::from_str(&balance.free) {
                self.entries.insert(balance.asset.clone(), free);
            }
        }
        self.fetched_at = Some(Instant::now());
    }

    fn apply_position(&mut self, position: &AccountPosition) {
        for balance in &position.balances {
            if let Ok(free) = Decimal::from_str(&balance.free) {
                self.entries.insert(balance.asset.clone(), free);
            }
        }
    }

    fn lookup(&self, asset: &str) -> Decimal {
        self.entries.get(asset).copied().unwrap_or(Decimal::ZERO)
    }
}

pub struct OrderGateway {
    client_id: ClientId,
    rest: Arc<RestClient>,
    auth: Arc<Authenticator>,
    catalog: Arc<SymbolCatalog>,
    requests: Consumer<ClientRequest>,
    responses: Producer<ClientResponse>,
    user_events: mpsc::UnboundedReceiver<UserStreamEvent>,
    tap: PriceTap,
    /// internal order id -> exchange order id
    order_map: Mutex<HashMap<OrderId, String>>,
    /// Orders that have reached a terminal state; nothing further is
    /// emitted for them.
    dead_orders: HashSet<OrderId>,
    balances: BalanceCache,
    /// Per-ticker safe order size applied in testnet mode.
    test_caps: HashMap<TickerId, Decimal>,
    use_testnet: bool,
    recv_window_ms: u64,
    response_seq: u64,
    shutdown: Shutdown,
}

impl OrderGateway {
    /// Build the gateway; refuses to start without valid credentials.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &BridgeConfig,
        rest: Arc<RestClient>,
        auth: Arc<Authenticator>,
        catalog: Arc<SymbolCatalog>,
        tap: PriceTap,
        requests: Consumer<ClientRequest>,
        responses: Producer<ClientResponse>,
        user_events: mpsc::UnboundedReceiver<UserStreamEvent>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        if !auth.has_valid_credentials() {
            return Err(BridgeError::CredentialsMissing(
                "order gateway requires api credentials".to_string(),
            ));
        }

        let test_caps = config
            .tickers
            .iter()
            .filter_map(|t| decimal_from_f64(t.test_qty).map(|q| (t.ticker_id, q)))
            .collect();

        Ok(Self {
            client_id: config.order_gateway.client_id,
            rest,
            auth,
            catalog,
            requests,
            responses,
            user_events,
            tap,
            order_map: Mutex::new(HashMap::new()),
            dead_orders: HashSet::new(),
            balances: BalanceCache::new(Duration::from_secs(
                config.cache_settings.account_info_minutes * 60,
            )),
            test_caps,
            use_testnet: config.use_testnet,
            recv_window_ms: config.order_gateway.recv_window_ms,
            response_seq: 0,
            shutdown,
        })
    }

    /// Append the configured `recvWindow` to a signed parameter list.
    fn with_recv_window(&self, mut params: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        if self.recv_window_ms > 0 {
            params.push(("recvWindow", self.recv_window_ms.to_string()));
        }
        params
    }

    /// The processing loop: drain requests, drain user-data events,
    /// yield briefly when idle.
    pub async fn run(mut self) {
        info!(client_id = self.client_id, "order gateway started");

        while self.shutdown.is_running() {
            let mut worked = false;

            while let Some(request) = self.requests.pop() {
                self.handle_request(request).await;
                worked = true;
            }

            while let Ok(event) = self.user_events.try_recv() {
                self.handle_user_event(event);
                worked = true;
            }

            if !worked {
                tokio::time::sleep(IDLE_POLL).await;
            }
        }

        info!(
            client_id = self.client_id,
            responses = self.response_seq,
            "order gateway stopped"
        );
    }

    async fn handle_request(&mut self, request: ClientRequest) {
        debug!(
            order_id = request.order_id,
            ticker_id = request.ticker_id,
            kind = ?request.kind,
            "processing request"
        );
        match request.kind {
            RequestKind::New => self.handle_new(request).await,
            RequestKind::Cancel => self.handle_cancel(request).await,
        }
    }

    async fn handle_new(&mut self, request: ClientRequest) {
        if self.dead_orders.contains(&request.order_id) {
            warn!(order_id = request.order_id, "new request reuses a terminal order id");
            return;
        }

        match self.submit_new(&request).await {
            Ok(submitted_qty) => {
                self.emit(ClientResponse {
                    kind: ResponseKind::Accepted,
                    client_id: self.client_id,
                    ticker_id: request.ticker_id,
                    client_order_id: request.order_id,
                    market_order_id: 0,
                    side: request.side,
                    price: request.price,
                    exec_qty: 0,
                    leaves_qty: submitted_qty,
                });
            }
            Err(e) => {
                warn!(order_id = request.order_id, error = %e, "new order failed");
                self.emit(ClientResponse {
                    kind: ResponseKind::CancelRejected,
                    client_id: self.client_id,
                    ticker_id: request.ticker_id,
                    client_order_id: request.order_id,
                    market_order_id: 0,
                    side: request.side,
                    price: request.price,
                    exec_qty: 0,
                    leaves_qty: 0,
                });
                // A rejected submission is terminal for this order id.
                self.dead_orders.insert(request.order_id);
            }
        }
    }

    /// Validate, size, sign, and submit a NEW order. Returns the
    /// internal quantity actually submitted.
    async fn submit_new(&mut self, request: &ClientRequest) -> Result<Qty> {
        let symbol = self.catalog.symbol_for(request.ticker_id)?.to_string();
        let info = self.catalog.get(&self.rest, &symbol).await?;

        let price = clamp_price(price_to_decimal(request.price), &info);

        let market = self.latest_market_price(request.ticker_id, &symbol).await?;
        if !validate_price(&info, request.side, price, market) {
            return Err(BridgeError::Rejected {
                code: -2010,
                msg: format!("price {price} outside percent-price band around {market}"),
            });
        }

        let qty = self.sized_quantity(request, &info, price).await?;
        if qty <= Decimal::ZERO {
            return Err(BridgeError::Rejected {
                code: -2010,
                msg: format!("no usable quantity for {symbol}"),
            });
        }

        let price_str = format_decimal(price, decimals_of(info.tick_size));
        let qty_str = format_decimal(qty, decimals_of(info.step_size));
        let client_order_id = encode_client_order_id(request.order_id);

        info!(
            symbol = %symbol,
            side = %request.side,
            price = %price_str,
            qty = %qty_str,
            client_order_id = %client_order_id,
            "submitting order"
        );

        let params = self.with_recv_window(vec![
            ("symbol", symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", qty_str),
            ("price", price_str),
            ("newClientOrderId", client_order_id),
        ]);

        let ack: NewOrderAck = self
            .rest
            .signed(Method::POST, "/api/v3/order", &params, &self.auth)
            .await?;

        self.order_map
            .lock()
            .unwrap()
            .insert(request.order_id, ack.order_id.to_string());

        info!(
            order_id = request.order_id,
            exchange_order_id = ack.order_id,
            "order accepted"
        );

        qty_from_decimal(qty)
            .ok_or_else(|| BridgeError::Protocol(format!("quantity {qty} out of range")))
    }

    async fn handle_cancel(&mut self, request: ClientRequest) {
        if self.dead_orders.contains(&request.order_id) {
            debug!(order_id = request.order_id, "cancel for terminal order ignored");
            return;
        }

        match self.submit_cancel(&request).await {
            Ok(()) => {
                self.emit(ClientResponse {
                    kind: ResponseKind::Canceled,
                    client_id: self.client_id,
                    ticker_id: request.ticker_id,
                    client_order_id: request.order_id,
                    market_order_id: 0,
                    side: request.side,
                    price: request.price,
                    exec_qty: 0,
                    leaves_qty: 0,
                });
            }
            Err(e) => {
                warn!(order_id = request.order_id, error = %e, "cancel failed");
                self.emit(ClientResponse {
                    kind: ResponseKind::CancelRejected,
                    client_id: self.client_id,
                    ticker_id: request.ticker_id,
                    client_order_id: request.order_id,
                    market_order_id: 0,
                    side: request.side,
                    price: request.price,
                    exec_qty: 0,
                    leaves_qty: 0,
                });
            }
        }
    }

    async fn submit_cancel(&mut self, request: &ClientRequest) -> Result<()> {
        let symbol = self.catalog.symbol_for(request.ticker_id)?.to_string();
        let exchange_order_id = self.exchange_order_id_for(request.order_id);

        let params =
            self.with_recv_window(vec![("symbol", symbol), ("orderId", exchange_order_id)]);
        let _: serde_json::Value = self
            .rest
            .signed(Method::DELETE, "/api/v3/order", &params, &self.auth)
            .await?;
        Ok(())
    }

    /// Mapped exchange id, falling back to the decimal internal id when
    /// no execution report has arrived yet.
    fn exchange_order_id_for(&self, order_id: OrderId) -> String {
        self.order_map
            .lock()
            .unwrap()
            .get(&order_id)
            .cloned()
            .unwrap_or_else(|| order_id.to_string())
    }

    fn handle_user_event(&mut self, event: UserStreamEvent) {
        match event {
            UserStreamEvent::Message(text) => match UserDataEvent::parse(&text) {
                Ok(UserDataEvent::ExecutionReport(report)) => {
                    self.process_execution_report(report)
                }
                Ok(UserDataEvent::AccountPosition(position)) => {
                    self.balances.apply_position(&position);
                    debug!(assets = position.balances.len(), "account position updated");
                }
                Ok(UserDataEvent::Unknown(raw)) => {
                    debug!(frame = %raw, "unhandled user data event");
                }
                Err(e) => warn!(error = %e, "malformed user data frame"),
            },
            UserStreamEvent::ConnectionFailure => {
                error!("user data stream gave up; execution reports unavailable");
            }
        }
    }

    fn process_execution_report(&mut self, report: crate::parser::ExecutionReport) {
        let Some(order_id) = decode_client_order_id(&report.client_order_id) else {
            debug!(client_order_id = %report.client_order_id, "execution report for external order");
            return;
        };

        self.order_map
            .lock()
            .unwrap()
            .insert(order_id, report.exchange_order_id.to_string());

        let Some(kind) = map_execution_status(&report.status) else {
            debug!(status = %report.status, "ignoring execution status");
            return;
        };

        let side = Side::from_str(&report.side).unwrap_or(Side::Buy);
        let ticker_id = self.catalog.ticker_for(&report.symbol).unwrap_or(0);

        self.emit(ClientResponse {
            kind,
            client_id: self.client_id,
            ticker_id,
            client_order_id: order_id,
            market_order_id: report.exchange_order_id as u64,
            side,
            price: report.price,
            exec_qty: report.cum_qty,
            leaves_qty: report.leaves_qty(),
        });
    }

    /// Push a response onto the queue unless the order already reached
    /// a terminal state.
    fn emit(&mut self, response: ClientResponse) {
        if self.dead_orders.contains(&response.client_order_id) {
            debug!(
                order_id = response.client_order_id,
                "suppressing response for terminal order"
            );
            return;
        }
        if response.is_terminal() {
            self.dead_orders.insert(response.client_order_id);
        }
        self.response_seq += 1;
        debug!(seq = self.response_seq, kind = ?response.kind, order_id = response.client_order_id, "response");
        if self.responses.push(response).is_err() {
            warn!("response queue full, dropping response");
        }
    }

    /// Latest market price: the in-process tap first, the REST ticker
    /// endpoint on a miss. Never consumes engine-bound queue entries.
    async fn latest_market_price(&self, ticker_id: TickerId, symbol: &str) -> Result<Decimal> {
        if let Some(price) = self.tap.get(ticker_id) {
            return Ok(price_to_decimal(price));
        }
        let ticker: TickerPrice = self
            .rest
            .get("/api/v3/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        Ok(price_to_decimal(ticker.price))
    }

    /// Size the order from the usable account balance and the symbol's
    /// lot and notional rules.
    async fn sized_quantity(
        &mut self,
        request: &ClientRequest,
        info: &SymbolInfo,
        price: Decimal,
    ) -> Result<Decimal> {
        let asset = match request.side {
            Side::Buy => &info.quote_asset,
            Side::Sell => &info.base_asset,
        };
        let free = self.free_balance(asset).await?;
        let cap = if self.use_testnet {
            self.test_caps.get(&request.ticker_id).copied()
        } else {
            None
        };
        Ok(fit_quantity(info, request.side, free, price, cap))
    }

    async fn free_balance(&mut self, asset: &str) -> Result<Decimal> {
        if let Some(free) = self.balances.fresh(asset) {
            return Ok(free);
        }
        let params = self.with_recv_window(Vec::new());
        let account: AccountInfo = self
            .rest
            .signed(Method::GET, "/api/v3/account", &params, &self.auth)
            .await?;
        self.balances.refresh(&account);
        Ok(self.balances.lookup(asset))
    }
}

/// Clamp a price into the symbol's `PRICE_FILTER` bounds.
fn clamp_price(price: Decimal, info: &SymbolInfo) -> Decimal {
    let mut p = price;
    if info.min_price > Decimal::ZERO && p < info.min_price {
        p = info.min_price;
    }
    if info.max_price > Decimal::ZERO && p > info.max_price {
        p = info.max_price;
    }
    p
}

/// Check an order price against the side-appropriate percent-price band
/// around the reference market price.
fn validate_price(info: &SymbolInfo, side: Side, order_price: Decimal, market: Decimal) -> bool {
    if market <= Decimal::ZERO {
        return false;
    }
    let (up, down) = info.percent_price.bounds(side);
    order_price <= market * up && order_price >= market * down
}

/// Fit a quantity to the usable balance and the `LOT_SIZE` and notional
/// filters: 95 % of the free balance, clamped into `[minQty, maxQty]`,
/// floored to the step, raised to `ceil(minNotional/price)` at two
/// decimals when under the notional floor, then capped to the testnet
/// safe size when one applies.
fn fit_quantity(
    info: &SymbolInfo,
    side: Side,
    free_balance: Decimal,
    price: Decimal,
    test_cap: Option<Decimal>,
) -> Decimal {
    let usable = free_balance * Decimal::from_str(USABLE_BALANCE).unwrap_or(Decimal::ONE);
    let mut qty = match side {
        Side::Buy => {
            if price > Decimal::ZERO {
                usable / price
            } else {
                Decimal::ZERO
            }
        }
        Side::Sell => usable,
    };

    if qty < info.min_qty {
        qty = info.min_qty;
    }
    if info.max_qty > Decimal::ZERO && qty > info.max_qty {
        qty = info.max_qty;
    }
    if info.step_size > Decimal::ZERO {
        qty = (qty / info.step_size).floor() * info.step_size;
    }

    if info.min_notional > Decimal::ZERO && price > Decimal::ZERO && qty * price < info.min_notional
    {
        let hundred = Decimal::ONE_HUNDRED;
        qty = (info.min_notional / price * hundred).ceil() / hundred;
    }

    if let Some(cap) = test_cap {
        if qty > cap {
            qty = cap;
        }
    }

    qty
}

/// Execution-report status to client response kind.
fn map_execution_status(status: &str) -> Option<ResponseKind> {
    match status {
        "NEW" | "PARTIALLY_FILLED" => Some(ResponseKind::Accepted),
        "FILLED" => Some(ResponseKind::Filled),
        "CANCELED" | "EXPIRED" | "REJECTED" => Some(ResponseKind::Canceled),
        _ => None,
    }
}
