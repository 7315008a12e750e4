//! Symbol catalog: ticker mapping and exchange trading rules
//!
//! Holds the bidirectional `ticker_id ⇄ symbol` mapping from config and
//! an in-memory cache of per-symbol trading filters refreshed from
//! `GET /api/v3/exchangeInfo`. A refresh failure never evicts existing
//! entries.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{BridgeError, Result};
use crate::rest::RestClient;
use crate::types::{Side, TickerId};

/// Percent-price band; the by-side variant carries separate bid and ask
/// multipliers.
#[derive(Debug, Clone, PartialEq)]
pub enum PercentPrice {
    Symmetric { up: Decimal, down: Decimal },
    BySide {
        bid_up: Decimal,
        bid_down: Decimal,
        ask_up: Decimal,
        ask_down: Decimal,
    },
}

impl PercentPrice {
    /// Multiplier bounds applicable to an order on the given side.
    pub fn bounds(&self, side: Side) -> (Decimal, Decimal) {
        match self {
            PercentPrice::Symmetric { up, down } => (*up, *down),
            PercentPrice::BySide {
                bid_up,
                bid_down,
                ask_up,
                ask_down,
            } => match side {
                Side::Buy => (*bid_up, *bid_down),
                Side::Sell => (*ask_up, *ask_down),
            },
        }
    }
}

impl Default for PercentPrice {
    fn default() -> Self {
        // Exchange default band when no filter is published.
        PercentPrice::Symmetric {
            up: Decimal::from(5),
            down: Decimal::new(2, 1),
        }
    }
}

/// The subset of `exchangeInfo.symbols[*]` the bridge retains.
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub tick_size: Decimal,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub step_size: Decimal,
    pub min_notional: Decimal,
    pub percent_price: PercentPrice,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<RawSymbol>,
}

#[derive(Debug, Deserialize)]
struct RawSymbol {
    symbol: String,
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    #[serde(default)]
    filters: Vec<RawFilter>,
}

/// Filters arrive as a heterogeneous array tagged by `filterType`; all
/// numeric fields are decimal strings.
#[derive(Debug, Deserialize)]
struct RawFilter {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(rename = "tickSize")]
    tick_size: Option<String>,
    #[serde(rename = "minPrice")]
    min_price: Option<String>,
    #[serde(rename = "maxPrice")]
    max_price: Option<String>,
    #[serde(rename = "minQty")]
    min_qty: Option<String>,
    #[serde(rename = "maxQty")]
    max_qty: Option<String>,
    #[serde(rename = "stepSize")]
    step_size: Option<String>,
    #[serde(rename = "minNotional")]
    min_notional: Option<String>,
    #[serde(rename = "multiplierUp")]
    multiplier_up: Option<String>,
    #[serde(rename = "multiplierDown")]
    multiplier_down: Option<String>,
    #[serde(rename = "bidMultiplierUp")]
    bid_multiplier_up: Option<String>,
    #[serde(rename = "bidMultiplierDown")]
    bid_multiplier_down: Option<String>,
    #[serde(rename = "askMultiplierUp")]
    ask_multiplier_up: Option<String>,
    #[serde(rename = "askMultiplierDown")]
    ask_multiplier_down: Option<String>,
}

fn dec(field: &Option<String>, fallback: Decimal) -> Decimal {
    field
        .as_deref()
        .and_then(|s| Decimal::from_str(s).ok())
        .unwrap_or(fallback)
}

impl SymbolInfo {
    fn from_raw(raw: RawSymbol) -> Self {
        let mut info = SymbolInfo {
            symbol: raw.symbol,
            base_asset: raw.base_asset,
            quote_asset: raw.quote_asset,
            tick_size: Decimal::new(1, 2),
            min_price: Decimal::ZERO,
            max_price: Decimal::ZERO,
            min_qty: Decimal::ZERO,
            max_qty: Decimal::ZERO,
            step_size: Decimal::new(1, 5),
            min_notional: Decimal::ZERO,
            percent_price: PercentPrice::default(),
        };

        for filter in raw.filters {
            match filter.filter_type.as_str() {
                "PRICE_FILTER" => {
                    info.tick_size = dec(&filter.tick_size, info.tick_size);
                    info.min_price = dec(&filter.min_price, Decimal::ZERO);
                    info.max_price = dec(&filter.max_price, Decimal::ZERO);
                }
                "LOT_SIZE" => {
                    info.min_qty = dec(&filter.min_qty, Decimal::ZERO);
                    info.max_qty = dec(&filter.max_qty, Decimal::ZERO);
                    info.step_size = dec(&filter.step_size, info.step_size);
                }
                // Spot uses NOTIONAL on newer listings, MIN_NOTIONAL on older ones.
                "NOTIONAL" | "MIN_NOTIONAL" => {
                    info.min_notional = dec(&filter.min_notional, Decimal::ZERO);
                }
                "PERCENT_PRICE" => {
                    info.percent_price = PercentPrice::Symmetric {
                        up: dec(&filter.multiplier_up, Decimal::from(5)),
                        down: dec(&filter.multiplier_down, Decimal::new(2, 1)),
                    };
                }
                "PERCENT_PRICE_BY_SIDE" => {
                    info.percent_price = PercentPrice::BySide {
                        bid_up: dec(&filter.bid_multiplier_up, Decimal::from(5)),
                        bid_down: dec(&filter.bid_multiplier_down, Decimal::new(2, 1)),
                        ask_up: dec(&filter.ask_multiplier_up, Decimal::from(5)),
                        ask_down: dec(&filter.ask_multiplier_down, Decimal::new(2, 1)),
                    };
                }
                _ => {}
            }
        }

        info
    }
}

struct Cache {
    entries: HashMap<String, SymbolInfo>,
    refreshed_at: Option<Instant>,
}

pub struct SymbolCatalog {
    ticker_to_symbol: HashMap<TickerId, String>,
    symbol_to_ticker: HashMap<String, TickerId>,
    cache: Mutex<Cache>,
    cache_ttl: Duration,
}

impl SymbolCatalog {
    pub fn new(tickers: impl IntoIterator<Item = (TickerId, String)>, cache_ttl: Duration) -> Self {
        let ticker_to_symbol: HashMap<TickerId, String> = tickers.into_iter().collect();
        let symbol_to_ticker = ticker_to_symbol
            .iter()
            .map(|(id, sym)| (sym.clone(), *id))
            .collect();
        Self {
            ticker_to_symbol,
            symbol_to_ticker,
            cache: Mutex::new(Cache {
                entries: HashMap::new(),
                refreshed_at: None,
            }),
            cache_ttl,
        }
    }

    pub fn symbol_for(&self, ticker_id: TickerId) -> Result<&str> {
        self.ticker_to_symbol
            .get(&ticker_id)
            .map(String::as_str)
            .ok_or_else(|| BridgeError::Protocol(format!("unknown ticker id {ticker_id}")))
    }

    pub fn ticker_for(&self, symbol: &str) -> Option<TickerId> {
        self.symbol_to_ticker.get(symbol).copied()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbol_to_ticker.keys().map(String::as_str)
    }

    /// Fetch the trading rules for a symbol, refreshing the whole cache
    /// from the exchange when it is stale or the symbol is missing.
    pub async fn get(&self, rest: &RestClient, symbol: &str) -> Result<SymbolInfo> {
        if let Some(info) = self.cached(symbol) {
            return Ok(info);
        }

        match rest.get::<ExchangeInfo>("/api/v3/exchangeInfo", &[]).await {
            Ok(exchange_info) => {
                self.store(exchange_info);
            }
            Err(e) => {
                // Keep serving stale entries rather than evicting.
                warn!(error = %e, "exchangeInfo refresh failed, keeping cached entries");
            }
        }

        let cache = self.cache.lock().expect("symbol cache poisoned");
        cache
            .entries
            .get(symbol)
            .cloned()
            .ok_or_else(|| BridgeError::Protocol(format!("symbol {symbol} not in exchangeInfo")))
    }

    fn cached(&self, symbol: &str) -> Option<SymbolInfo> {
        let cache = self.cache.lock().expect("symbol cache poisoned");
        let fresh = cache
            .refreshed_at
            .map(|at| at.elapsed() < self.cache_ttl)
            .unwrap_or(false);
        if fresh {
            cache.entries.get(symbol).cloned()
        } else {
            None
        }
    }

    fn store(&self, exchange_info: ExchangeInfo) {
        let mut cache = self.cache.lock().expect("symbol cache poisoned");
        for raw in exchange_info.symbols {
            let info = SymbolInfo::from_raw(raw);
            cache.entries.insert(info.symbol.clone(), info);
        }
        cache.refreshed_at = Some(Instant::now());
        info!(symbols = cache.entries.len(), "symbol info cache refreshed");
    }

    #[cfg(test)]
    fn store_json(&self, raw: &str) {
        self.store(serde_json::from_str(raw).unwrap());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE_EXCHANGE_INFO: &str = r#"{
        "timezone": "UTC",
        "symbols": [
            {
                "symbol": "BTCUSDT",
                "status": "TRADING",
                "baseAsset": "BTC",
                "quoteAsset": "USDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "minPrice": "0.01", "maxPrice": "1000000.00", "tickSize": "0.01"},
                    {"filterType": "LOT_SIZE", "minQty": "0.00001", "maxQty": "9000.0", "stepSize": "0.00001"},
                    {"filterType": "NOTIONAL", "minNotional": "5.00"},
                    {"filterType": "PERCENT_PRICE_BY_SIDE",
                     "bidMultiplierUp": "1.2", "bidMultiplierDown": "0.8",
                     "askMultiplierUp": "1.1", "askMultiplierDown": "0.9"}
                ]
            },
            {
                "symbol": "ETHUSDT",
                "status": "TRADING",
                "baseAsset": "ETH",
                "quoteAsset": "USDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "minPrice": "0.01", "maxPrice": "100000.00", "tickSize": "0.01"},
                    {"filterType": "PERCENT_PRICE", "multiplierUp": "5", "multiplierDown": "0.2"}
                ]
            }
        ]
    }"#;

    fn test_catalog() -> SymbolCatalog {
        SymbolCatalog::new(
            [(1, "BTCUSDT".to_string()), (2, "ETHUSDT".to_string())],
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_ticker_symbol_mapping() {
        let catalog = test_catalog();
        assert_eq!(catalog.symbol_for(1).unwrap(), "BTCUSDT");
        assert_eq!(catalog.ticker_for("ETHUSDT"), Some(2));
        assert!(catalog.symbol_for(99).is_err());
        assert_eq!(catalog.ticker_for("XRPUSDT"), None);
    }

    #[test]
    fn test_parse_exchange_info_filters() {
        let catalog = test_catalog();
        catalog.store_json(SAMPLE_EXCHANGE_INFO);

        let info = catalog.cached("BTCUSDT").unwrap();
        assert_eq!(info.base_asset, "BTC");
        assert_eq!(info.tick_size, dec!(0.01));
        assert_eq!(info.min_price, dec!(0.01));
        assert_eq!(info.max_price, dec!(1000000.00));
        assert_eq!(info.min_qty, dec!(0.00001));
        assert_eq!(info.step_size, dec!(0.00001));
        assert_eq!(info.min_notional, dec!(5.00));
    }

    #[test]
    fn test_percent_price_by_side_selection() {
        let catalog = test_catalog();
        catalog.store_json(SAMPLE_EXCHANGE_INFO);

        let btc = catalog.cached("BTCUSDT").unwrap();
        assert_eq!(btc.percent_price.bounds(Side::Buy), (dec!(1.2), dec!(0.8)));
        assert_eq!(btc.percent_price.bounds(Side::Sell), (dec!(1.1), dec!(0.9)));

        let eth = catalog.cached("ETHUSDT").unwrap();
        assert_eq!(eth.percent_price.bounds(Side::Buy), (dec!(5), dec!(0.2)));
        assert_eq!(eth.percent_price.bounds(Side::Sell), (dec!(5), dec!(0.2)));
    }

    #[test]
    fn test_stale_cache_misses() {
        let catalog = SymbolCatalog::new(
            [(1, "BTCUSDT".to_string())],
            Duration::from_secs(0),
        );
        catalog.store_json(SAMPLE_EXCHANGE_INFO);
        // TTL of zero: the entry exists but is never served as fresh.
        assert!(catalog.cached("BTCUSDT").is_none());
    }
}
