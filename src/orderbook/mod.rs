//! Order book module
//!
//! Maintains locally reconstructed books from exchange depth snapshots
//! and diff updates, with strict update-id sequence gating.

mod book;

pub use book::{DiffOutcome, OrderBook};
