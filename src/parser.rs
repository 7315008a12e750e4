//! Wire-message parsing for exchange WebSocket and REST payloads
//!
//! Decimal strings are converted to internal fixed-point scalars at
//! this boundary; everything past the parser deals in `Price`/`Qty`.

use serde::{Deserialize, Deserializer};

use crate::types::{parse_price, parse_qty, Price, Qty};

/// One price level in internal units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookLevel {
    pub price: Price,
    pub qty: Qty,
}

/// Diff-depth stream event (`<symbol>@depth`).
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdate {
    /// Event type, `"depthUpdate"`.
    #[serde(rename = "e")]
    pub event_type: String,

    /// Event time in milliseconds.
    #[serde(rename = "E")]
    pub event_time: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID in event.
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Final update ID in event.
    #[serde(rename = "u")]
    pub final_update_id: u64,

    #[serde(rename = "b", deserialize_with = "deserialize_levels")]
    pub bids: Vec<BookLevel>,

    #[serde(rename = "a", deserialize_with = "deserialize_levels")]
    pub asks: Vec<BookLevel>,
}

/// Trade stream event (`<symbol>@trade`).
#[derive(Debug, Clone, Deserialize)]
pub struct TradeEvent {
    #[serde(rename = "e")]
    pub event_type: String,

    #[serde(rename = "E")]
    pub event_time: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "t")]
    pub trade_id: u64,

    #[serde(rename = "p", deserialize_with = "deserialize_price")]
    pub price: Price,

    #[serde(rename = "q", deserialize_with = "deserialize_qty")]
    pub qty: Qty,

    #[serde(rename = "T")]
    pub trade_time: u64,

    /// True when the buyer was the resting maker order, meaning the
    /// trade was initiated by a seller.
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// Order book snapshot from `GET /api/v3/depth`.
#[derive(Debug, Clone, Deserialize)]
pub struct DepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    #[serde(deserialize_with = "deserialize_levels")]
    pub bids: Vec<BookLevel>,

    #[serde(deserialize_with = "deserialize_levels")]
    pub asks: Vec<BookLevel>,
}

/// Fallback last price from `GET /api/v3/ticker/price`.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    #[serde(deserialize_with = "deserialize_price")]
    pub price: Price,
}

/// Listen key issued by `POST /api/v3/userDataStream`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenKeyResponse {
    #[serde(rename = "listenKey")]
    pub listen_key: String,
}

/// `orderId` out of a `POST /api/v3/order` response.
#[derive(Debug, Clone, Deserialize)]
pub struct NewOrderAck {
    #[serde(rename = "orderId")]
    pub order_id: i64,
}

/// Signed account snapshot, `GET /api/v3/account`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountInfo {
    pub balances: Vec<AccountBalance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountBalance {
    pub asset: String,
    pub free: String,
    pub locked: String,
}

/// `executionReport` event on the user-data stream.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionReport {
    #[serde(rename = "s")]
    pub symbol: String,

    /// Client order id; ours carry the `x-` prefix.
    #[serde(rename = "c")]
    pub client_order_id: String,

    #[serde(rename = "S")]
    pub side: String,

    /// Current order status (NEW, PARTIALLY_FILLED, FILLED, ...).
    #[serde(rename = "X")]
    pub status: String,

    /// Exchange-assigned order id.
    #[serde(rename = "i")]
    pub exchange_order_id: i64,

    #[serde(rename = "p", deserialize_with = "deserialize_price")]
    pub price: Price,

    #[serde(rename = "q", deserialize_with = "deserialize_qty")]
    pub orig_qty: Qty,

    /// Cumulative filled quantity.
    #[serde(rename = "z", deserialize_with = "deserialize_qty")]
    pub cum_qty: Qty,
}

impl ExecutionReport {
    /// Quantity still working on the exchange.
    pub fn leaves_qty(&self) -> Qty {
        (self.orig_qty - self.cum_qty).max(0)
    }
}

/// `outboundAccountPosition` event on the user-data stream.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountPosition {
    #[serde(rename = "B")]
    pub balances: Vec<PositionBalance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionBalance {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "f")]
    pub free: String,
    #[serde(rename = "l")]
    pub locked: String,
}

/// Parsed user-data stream frame.
#[derive(Debug, Clone)]
pub enum UserDataEvent {
    ExecutionReport(ExecutionReport),
    AccountPosition(AccountPosition),
    Unknown(String),
}

impl UserDataEvent {
    /// Dispatch a raw user-data frame by its `e` tag.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let event_type = value
            .get("e")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_default();
        match event_type.as_str() {
            "executionReport" => {
                Ok(UserDataEvent::ExecutionReport(serde_json::from_value(value)?))
            }
            "outboundAccountPosition" => {
                Ok(UserDataEvent::AccountPosition(serde_json::from_value(value)?))
            }
            _ => Ok(UserDataEvent::Unknown(raw.to_string())),
        }
    }
}

fn deserialize_price<'de, D>(deserializer: D) -> Result<Price, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_price(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid price: {s}")))
}

fn deserialize_qty<'de, D>(deserializer: D) -> Result<Qty, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_qty(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid quantity: {s}")))
}

/// Price levels arrive as arrays of `["price", "qty"]` string pairs.
fn deserialize_levels<'de, D>(deserializer: D) -> Result<Vec<BookLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("invalid price level format"));
            }
            let price = parse_price(&pair[0])
                .ok_or_else(|| serde::de::Error::custom(format!("invalid price: {}", pair[0])))?;
            let qty = parse_qty(&pair[1])
                .ok_or_else(|| serde::de::Error::custom(format!("invalid qty: {}", pair[1])))?;
            Ok(BookLevel { price, qty })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_depth_update() {
        let raw = r#"{
            "e": "depthUpdate",
            "E": 1672531200000,
            "s": "BTCUSDT",
            "U": 100,
            "u": 105,
            "b": [["50000.00", "1.5"], ["49999.00", "2.0"]],
            "a": [["50001.00", "1.0"], ["50002.00", "0.5"]]
        }"#;

        let depth: DepthUpdate = serde_json::from_str(raw).unwrap();
        assert_eq!(depth.symbol, "BTCUSDT");
        assert_eq!(depth.first_update_id, 100);
        assert_eq!(depth.final_update_id, 105);
        assert_eq!(depth.bids.len(), 2);
        assert_eq!(depth.bids[0].price, 500_000_000);
        assert_eq!(depth.bids[0].qty, 15_000);
        assert_eq!(depth.asks[1].qty, 5_000);
    }

    #[test]
    fn test_parse_trade() {
        let raw = r#"{
            "e": "trade",
            "E": 1672531200000,
            "s": "BTCUSDT",
            "t": 12345,
            "p": "50000.50",
            "q": "0.5",
            "T": 1672531200000,
            "m": true
        }"#;

        let trade: TradeEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.price, 500_005_000);
        assert_eq!(trade.qty, 5_000);
        assert!(trade.is_buyer_maker);
    }

    #[test]
    fn test_parse_snapshot() {
        let raw = r#"{
            "lastUpdateId": 100,
            "bids": [["50000.00", "1"]],
            "asks": [["50010.00", "2"]]
        }"#;

        let snapshot: DepthSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snapshot.last_update_id, 100);
        assert_eq!(snapshot.bids[0].price, 500_000_000);
        assert_eq!(snapshot.asks[0].qty, 20_000);
    }

    #[test]
    fn test_parse_execution_report() {
        let raw = r#"{
            "e": "executionReport",
            "E": 1672531200000,
            "s": "BTCUSDT",
            "c": "x-42",
            "S": "BUY",
            "o": "LIMIT",
            "X": "FILLED",
            "i": 987654,
            "p": "30000.00",
            "q": "0.001",
            "z": "0.001"
        }"#;

        match UserDataEvent::parse(raw).unwrap() {
            UserDataEvent::ExecutionReport(report) => {
                assert_eq!(report.client_order_id, "x-42");
                assert_eq!(report.exchange_order_id, 987654);
                assert_eq!(report.status, "FILLED");
                assert_eq!(report.orig_qty, 10);
                assert_eq!(report.cum_qty, 10);
                assert_eq!(report.leaves_qty(), 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_account_position() {
        let raw = r#"{
            "e": "outboundAccountPosition",
            "E": 1672531200000,
            "u": 1672531200000,
            "B": [{"a": "USDT", "f": "1000.00", "l": "0.00"}]
        }"#;

        match UserDataEvent::parse(raw).unwrap() {
            UserDataEvent::AccountPosition(pos) => {
                assert_eq!(pos.balances.len(), 1);
                assert_eq!(pos.balances[0].asset, "USDT");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_passes_through() {
        let raw = r#"{"e": "balanceUpdate", "a": "BTC"}"#;
        assert!(matches!(
            UserDataEvent::parse(raw).unwrap(),
            UserDataEvent::Unknown(_)
        ));
    }
}
