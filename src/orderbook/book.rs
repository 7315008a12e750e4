//! Core order book implementation
//!
//! Uses BTreeMap for sorted price level management, in internal
//! fixed-point units. A book becomes valid when a REST snapshot is
//! applied and stays valid until a sequence gap forces a re-sync.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use tracing::debug;

use crate::parser::BookLevel;
use crate::types::{MarketUpdate, MarketUpdateKind, Price, Qty, Side, TickerId};

/// Result of applying a diff-depth event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Levels applied, `last_update_id` advanced.
    Applied,
    /// Book has no snapshot yet; refresh flagged.
    NotReady,
    /// Event entirely before our snapshot; silently dropped.
    Stale,
    /// Sequence gap; refresh flagged.
    Gap,
}

impl DiffOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, DiffOutcome::Applied)
    }
}

/// Order book for a single symbol
#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    ticker_id: TickerId,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Price>, Qty>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Price, Qty>,
    /// Last processed update ID
    last_update_id: u64,
    /// Whether the book has been initialized with a snapshot
    is_valid: bool,
    /// Whether a new snapshot must be fetched before further diffs
    needs_refresh: bool,
}

impl OrderBook {
    /// Create a new empty order book; it needs a snapshot before any
    /// diff can apply.
    pub fn new(symbol: &str, ticker_id: TickerId) -> Self {
        Self {
            symbol: symbol.to_string(),
            ticker_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            is_valid: false,
            needs_refresh: true,
        }
    }

    /// Replace both sides from a REST snapshot.
    ///
    /// Zero-quantity levels are ignored. Applying the same snapshot
    /// twice leaves the book identical.
    pub fn apply_snapshot(&mut self, last_update_id: u64, bids: &[BookLevel], asks: &[BookLevel]) {
        self.bids.clear();
        self.asks.clear();

        for level in bids {
            if level.qty > 0 {
                self.bids.insert(Reverse(level.price), level.qty);
            }
        }
        for level in asks {
            if level.qty > 0 {
                self.asks.insert(level.price, level.qty);
            }
        }

        self.last_update_id = last_update_id;
        self.is_valid = true;
        self.needs_refresh = false;

        debug!(
            symbol = %self.symbol,
            last_update_id,
            bids = self.bids.len(),
            asks = self.asks.len(),
            "snapshot applied"
        );
    }

    /// Apply a diff-depth event under the exchange's sequencing rules.
    ///
    /// Gating, in order: a book without a snapshot rejects and flags a
    /// refresh; an event whose final id precedes our state is silently
    /// dropped; an event starting past `last_update_id + 1` is a gap
    /// and flags a refresh. Anything else applies.
    pub fn apply_diff(
        &mut self,
        first_update_id: u64,
        final_update_id: u64,
        bids: &[BookLevel],
        asks: &[BookLevel],
    ) -> DiffOutcome {
        if !self.is_valid {
            self.needs_refresh = true;
            return DiffOutcome::NotReady;
        }

        if final_update_id < self.last_update_id + 1 {
            return DiffOutcome::Stale;
        }

        if first_update_id > self.last_update_id + 1 {
            debug!(
                symbol = %self.symbol,
                first_update_id,
                expected = self.last_update_id + 1,
                "sequence gap, flagging refresh"
            );
            self.needs_refresh = true;
            return DiffOutcome::Gap;
        }

        for level in bids {
            if level.qty > 0 {
                self.bids.insert(Reverse(level.price), level.qty);
            } else {
                self.bids.remove(&Reverse(level.price));
            }
        }
        for level in asks {
            if level.qty > 0 {
                self.asks.insert(level.price, level.qty);
            } else {
                self.asks.remove(&level.price);
            }
        }

        self.last_update_id = final_update_id;
        DiffOutcome::Applied
    }

    /// Invalidate the book so the re-sync procedure starts from scratch.
    pub fn invalidate(&mut self) {
        self.is_valid = false;
        self.needs_refresh = true;
    }

    /// Serialize the full book as engine-bound market updates: one
    /// clear, then every bid and every ask as adds with ascending
    /// priority from 1 on each side. The price doubles as a synthetic
    /// order id since the aggregated feed has no per-order identity.
    pub fn generate_updates(&self, out: &mut Vec<MarketUpdate>) {
        if !self.is_valid {
            return;
        }

        out.push(MarketUpdate::clear(self.ticker_id));

        let mut priority = 1;
        for (Reverse(price), qty) in &self.bids {
            out.push(MarketUpdate {
                kind: MarketUpdateKind::Add,
                ticker_id: self.ticker_id,
                side: Side::Buy,
                price: *price,
                qty: *qty,
                priority,
                order_id: *price as u64,
            });
            priority += 1;
        }

        let mut priority = 1;
        for (price, qty) in &self.asks {
            out.push(MarketUpdate {
                kind: MarketUpdateKind::Add,
                ticker_id: self.ticker_id,
                side: Side::Sell,
                price: *price,
                qty: *qty,
                priority,
                order_id: *price as u64,
            });
            priority += 1;
        }
    }

    pub fn best_bid(&self) -> Option<Price> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    pub fn qty_at(&self, side: Side, price: Price) -> Qty {
        match side {
            Side::Buy => self.bids.get(&Reverse(price)).copied().unwrap_or(0),
            Side::Sell => self.asks.get(&price).copied().unwrap_or(0),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn ticker_id(&self) -> TickerId {
        self.ticker_id
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: Price, qty: Qty) -> BookLevel {
        BookLevel { price, qty }
    }

    fn synced_book() -> OrderBook {
        let mut book = OrderBook::new("BTCUSDT", 1);
        book.apply_snapshot(
            100,
            &[level(500_000_000, 10_000)],
            &[level(500_100_000, 20_000)],
        );
        book
    }

    #[test]
    fn test_snapshot_then_valid_diff() {
        let mut book = synced_book();
        assert!(book.is_valid());
        assert_eq!(book.best_bid(), Some(500_000_000));
        assert_eq!(book.best_ask(), Some(500_100_000));

        // Remove the bid, grow the ask.
        let outcome = book.apply_diff(
            101,
            101,
            &[level(500_000_000, 0)],
            &[level(500_100_000, 30_000)],
        );
        assert_eq!(outcome, DiffOutcome::Applied);
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.qty_at(Side::Sell, 500_100_000), 30_000);
        assert_eq!(book.last_update_id(), 101);
    }

    #[test]
    fn test_sequence_gap_flags_refresh() {
        let mut book = synced_book();
        let outcome = book.apply_diff(105, 106, &[], &[]);
        assert_eq!(outcome, DiffOutcome::Gap);
        assert!(book.needs_refresh());
        assert_eq!(book.last_update_id(), 100);
    }

    #[test]
    fn test_stale_diff_dropped_silently() {
        let mut book = OrderBook::new("BTCUSDT", 1);
        book.apply_snapshot(200, &[level(1, 1)], &[level(2, 1)]);
        let outcome = book.apply_diff(150, 180, &[level(1, 0)], &[]);
        assert_eq!(outcome, DiffOutcome::Stale);
        assert!(!book.needs_refresh());
        assert_eq!(book.qty_at(Side::Buy, 1), 1);
    }

    #[test]
    fn test_diff_before_snapshot_rejected() {
        let mut book = OrderBook::new("BTCUSDT", 1);
        let outcome = book.apply_diff(1, 2, &[level(1, 1)], &[]);
        assert_eq!(outcome, DiffOutcome::NotReady);
        assert!(book.needs_refresh());
    }

    #[test]
    fn test_stale_boundary() {
        let mut book = synced_book();
        // u == last_update_id is stale.
        assert_eq!(book.apply_diff(100, 100, &[], &[]), DiffOutcome::Stale);
        // u == last_update_id + 1 with U <= last_update_id + 1 applies.
        assert_eq!(
            book.apply_diff(99, 101, &[level(499_990_000, 5_000)], &[]),
            DiffOutcome::Applied
        );
        assert_eq!(book.last_update_id(), 101);
    }

    #[test]
    fn test_last_update_id_strictly_increases() {
        let mut book = synced_book();
        let mut prev = book.last_update_id();
        for id in 101..110 {
            assert!(book.apply_diff(id, id, &[], &[]).is_applied());
            assert!(book.last_update_id() > prev);
            prev = book.last_update_id();
        }
    }

    #[test]
    fn test_snapshot_idempotent() {
        let bids = [level(500_000_000, 10_000), level(499_990_000, 5_000)];
        let asks = [level(500_100_000, 20_000)];

        let mut book = OrderBook::new("BTCUSDT", 1);
        book.apply_snapshot(100, &bids, &asks);
        let mut first = Vec::new();
        book.generate_updates(&mut first);

        book.apply_snapshot(100, &bids, &asks);
        let mut second = Vec::new();
        book.generate_updates(&mut second);

        assert_eq!(first, second);
        assert_eq!(book.last_update_id(), 100);
    }

    #[test]
    fn test_snapshot_ignores_zero_quantity_levels() {
        let mut book = OrderBook::new("BTCUSDT", 1);
        book.apply_snapshot(100, &[level(1, 0), level(2, 5)], &[level(3, 0)]);
        assert_eq!(book.depth(), (1, 0));
        assert_eq!(book.best_bid(), Some(2));
    }

    #[test]
    fn test_best_bid_below_best_ask() {
        let book = synced_book();
        let (bid, ask) = (book.best_bid().unwrap(), book.best_ask().unwrap());
        assert!(bid < ask);
    }

    #[test]
    fn test_generate_updates_order_and_priority() {
        let mut book = OrderBook::new("BTCUSDT", 7);
        book.apply_snapshot(
            100,
            &[level(100, 1), level(300, 3), level(200, 2)],
            &[level(400, 4), level(500, 5)],
        );

        let mut updates = Vec::new();
        book.generate_updates(&mut updates);

        assert_eq!(updates.len(), 6);
        assert_eq!(updates[0].kind, MarketUpdateKind::Clear);
        assert_eq!(updates[0].ticker_id, 7);

        // Bids descend in price with ascending priority.
        let bid_prices: Vec<Price> = updates[1..4].iter().map(|u| u.price).collect();
        assert_eq!(bid_prices, vec![300, 200, 100]);
        let bid_priorities: Vec<u32> = updates[1..4].iter().map(|u| u.priority).collect();
        assert_eq!(bid_priorities, vec![1, 2, 3]);
        assert!(updates[1..4].iter().all(|u| u.side == Side::Buy));

        // Asks ascend in price, priority restarting at 1.
        let ask_prices: Vec<Price> = updates[4..].iter().map(|u| u.price).collect();
        assert_eq!(ask_prices, vec![400, 500]);
        assert_eq!(updates[4].priority, 1);
        assert!(updates[4..].iter().all(|u| u.side == Side::Sell));

        // Synthetic order identity is the price level.
        assert_eq!(updates[1].order_id, 300);
    }

    #[test]
    fn test_invalidate_forces_resync() {
        let mut book = synced_book();
        book.invalidate();
        assert!(!book.is_valid());
        assert!(book.needs_refresh());
        assert_eq!(book.apply_diff(101, 101, &[], &[]), DiffOutcome::NotReady);

        let mut updates = Vec::new();
        book.generate_updates(&mut updates);
        assert!(updates.is_empty());
    }
}
