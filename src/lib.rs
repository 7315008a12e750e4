//! Binance spot connectivity bridge
//!
//! This crate connects a local trade engine to the Binance spot
//! exchange. It maintains sequence-consistent order books per symbol by
//! fusing REST depth snapshots with the diff-depth WebSocket stream,
//! and mediates order placement and cancellation through the REST order
//! endpoints while consuming the authenticated user-data stream for
//! execution reports. The engine talks to the bridge exclusively
//! through three lock-free SPSC queues: client requests in, client
//! responses out, market updates out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub mod auth;
pub mod catalog;
pub mod config;
pub mod consumer;
pub mod error;
pub mod gateway;
pub mod orderbook;
pub mod parser;
pub mod queue;
pub mod rest;
pub mod types;
pub mod user_stream;
pub mod websocket;

pub use auth::Authenticator;
pub use catalog::{SymbolCatalog, SymbolInfo};
pub use config::{BridgeConfig, Credentials};
pub use consumer::{MarketDataConsumer, PriceTap};
pub use error::{BridgeError, Result};
pub use gateway::OrderGateway;
pub use orderbook::OrderBook;
pub use queue::{spsc_channel, Consumer, Producer};
pub use rest::RestClient;
pub use types::{ClientRequest, ClientResponse, MarketUpdate};
pub use user_stream::{UserDataStream, UserStreamEvent};

/// Process-wide cancellation handle threaded through every component.
///
/// Loops check it after each step; blocked waits are woken through the
/// embedded notifier.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    running: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                running: AtomicBool::new(true),
                notify: Notify::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Request shutdown and wake every waiter.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_flag() {
        let shutdown = Shutdown::new();
        assert!(shutdown.is_running());
        let clone = shutdown.clone();
        clone.stop();
        assert!(!shutdown.is_running());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_stop() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        shutdown.stop();
        handle.await.unwrap();
    }
}
