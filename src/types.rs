//! Internal scalar types and the trade-engine queue message contracts
//!
//! Prices and quantities travel through the bridge as signed 64-bit
//! fixed-point integers; all conversion to and from exchange decimal
//! strings happens here.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

/// Internal ticker identifier, mapped to an exchange symbol via config.
pub type TickerId = u32;

/// Internal order identifier, unique per client for the process lifetime.
pub type OrderId = u64;

/// Trade-engine client identifier.
pub type ClientId = u32;

/// Fixed-point price: decimal price multiplied by [`PRICE_MULTIPLIER`].
pub type Price = i64;

/// Fixed-point quantity: decimal quantity multiplied by [`QTY_MULTIPLIER`].
pub type Qty = i64;

pub const PRICE_MULTIPLIER: i64 = 10_000;
pub const QTY_MULTIPLIER: i64 = 10_000;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Exchange wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl FromStr for Side {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Convert an exchange decimal to an internal price, rounding to the
/// nearest internal tick.
pub fn price_from_decimal(value: Decimal) -> Option<Price> {
    (value * Decimal::from(PRICE_MULTIPLIER)).round().to_i64()
}

/// Convert an internal price back to a decimal.
pub fn price_to_decimal(price: Price) -> Decimal {
    Decimal::from(price) / Decimal::from(PRICE_MULTIPLIER)
}

/// Convert an exchange decimal to an internal quantity.
pub fn qty_from_decimal(value: Decimal) -> Option<Qty> {
    (value * Decimal::from(QTY_MULTIPLIER)).round().to_i64()
}

/// Convert an internal quantity back to a decimal.
pub fn qty_to_decimal(qty: Qty) -> Decimal {
    Decimal::from(qty) / Decimal::from(QTY_MULTIPLIER)
}

/// Parse an exchange price string into internal representation.
pub fn parse_price(s: &str) -> Option<Price> {
    Decimal::from_str(s).ok().and_then(price_from_decimal)
}

/// Parse an exchange quantity string into internal representation.
pub fn parse_qty(s: &str) -> Option<Qty> {
    Decimal::from_str(s).ok().and_then(qty_from_decimal)
}

/// Number of significant decimal places in a tick or step size.
///
/// `"0.00010000"` has three trailing zeros after normalization, so the
/// answer is 4; `"1.00000000"` normalizes to scale 0.
pub fn decimals_of(step: Decimal) -> u32 {
    step.normalize().scale()
}

/// Format a decimal truncated and zero-padded to a fixed number of
/// decimal places, as required by the exchange order endpoints.
pub fn format_decimal(value: Decimal, decimals: u32) -> String {
    let mut v = value.round_dp_with_strategy(decimals, rust_decimal::RoundingStrategy::ToZero);
    v.rescale(decimals);
    v.to_string()
}

/// Encode an internal order id as an exchange client order id.
pub fn encode_client_order_id(order_id: OrderId) -> String {
    format!("x-{order_id}")
}

/// Decode an exchange client order id back to the internal order id.
///
/// Returns `None` for ids the bridge did not generate.
pub fn decode_client_order_id(client_order_id: &str) -> Option<OrderId> {
    client_order_id.strip_prefix("x-")?.parse().ok()
}

/// Request from the trade engine to the order gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    New,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRequest {
    pub kind: RequestKind,
    pub client_id: ClientId,
    pub ticker_id: TickerId,
    pub order_id: OrderId,
    pub side: Side,
    pub price: Price,
    pub qty: Qty,
}

/// Response from the order gateway to the trade engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Accepted,
    Filled,
    Canceled,
    CancelRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientResponse {
    pub kind: ResponseKind,
    pub client_id: ClientId,
    pub ticker_id: TickerId,
    pub client_order_id: OrderId,
    /// Exchange-assigned order id, zero when unknown.
    pub market_order_id: u64,
    pub side: Side,
    pub price: Price,
    pub exec_qty: Qty,
    pub leaves_qty: Qty,
}

impl ClientResponse {
    /// A terminal response is the last one emitted for its order.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, ResponseKind::Filled | ResponseKind::Canceled)
    }
}

/// Market update from the data consumer to the trade engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketUpdateKind {
    /// Downstream books must discard all state for the ticker.
    Clear,
    Add,
    Modify,
    Trade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketUpdate {
    pub kind: MarketUpdateKind,
    pub ticker_id: TickerId,
    pub side: Side,
    pub price: Price,
    pub qty: Qty,
    /// Monotone within one book serialization; used by downstream
    /// reconstructors to keep level ordering.
    pub priority: u32,
    /// Synthetic identity derived from the price level; the aggregated
    /// depth feed exposes no per-order ids.
    pub order_id: u64,
}

impl MarketUpdate {
    pub fn clear(ticker_id: TickerId) -> Self {
        Self {
            kind: MarketUpdateKind::Clear,
            ticker_id,
            side: Side::Buy,
            price: 0,
            qty: 0,
            priority: 0,
            order_id: 0,
        }
    }

    pub fn trade(ticker_id: TickerId, side: Side, price: Price, qty: Qty) -> Self {
        Self {
            kind: MarketUpdateKind::Trade,
            ticker_id,
            side,
            price,
            qty,
            priority: 0,
            order_id: 0,
        }
    }
}

/// Convert an `f64` config value (test prices and quantities) into a
/// decimal without going through a lossy string round trip.
pub fn decimal_from_f64(value: f64) -> Option<Decimal> {
    Decimal::from_f64(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_round_trip() {
        let original = dec!(50000.25);
        let internal = price_from_decimal(original).unwrap();
        assert_eq!(internal, 500_002_500);
        assert_eq!(price_to_decimal(internal), original);
    }

    #[test]
    fn test_round_trip_within_one_tick() {
        // Sub-tick precision is lost, bounded by one internal tick.
        let original = dec!(0.00012345);
        let internal = qty_from_decimal(original).unwrap();
        let back = qty_to_decimal(internal);
        assert!((back - original).abs() <= dec!(0.0001));
    }

    #[test]
    fn test_parse_price() {
        assert_eq!(parse_price("30000.00"), Some(300_000_000));
        assert_eq!(parse_price("0.0001"), Some(1));
        assert_eq!(parse_price("not a price"), None);
    }

    #[test]
    fn test_decimals_of() {
        assert_eq!(decimals_of(dec!(0.01000000)), 2);
        assert_eq!(decimals_of(dec!(0.00001)), 5);
        assert_eq!(decimals_of(dec!(1.00000000)), 0);
    }

    #[test]
    fn test_format_decimal_truncates_toward_zero() {
        assert_eq!(format_decimal(dec!(30000.129), 2), "30000.12");
        assert_eq!(format_decimal(dec!(0.5), 3), "0.500");
    }

    #[test]
    fn test_client_order_id_codec() {
        assert_eq!(encode_client_order_id(42), "x-42");
        assert_eq!(decode_client_order_id("x-42"), Some(42));
        assert_eq!(decode_client_order_id("web_1234"), None);
        assert_eq!(decode_client_order_id("x-"), None);
    }

    #[test]
    fn test_terminal_responses() {
        let mut resp = ClientResponse {
            kind: ResponseKind::Accepted,
            client_id: 1,
            ticker_id: 1,
            client_order_id: 7,
            market_order_id: 0,
            side: Side::Buy,
            price: 100,
            exec_qty: 0,
            leaves_qty: 10,
        };
        assert!(!resp.is_terminal());
        resp.kind = ResponseKind::Filled;
        assert!(resp.is_terminal());
        resp.kind = ResponseKind::Canceled;
        assert!(resp.is_terminal());
        resp.kind = ResponseKind::CancelRejected;
        assert!(!resp.is_terminal());
    }
}
