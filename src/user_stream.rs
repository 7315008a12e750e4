//! Authenticated user-data stream
//!
//! Owns the listen key and the order-event WebSocket. Frames are
//! forwarded verbatim to the order gateway over a channel; the stream
//! holds no reference back to the gateway. The listen key is extended
//! every 30 minutes and closed at shutdown.

use reqwest::Method;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::auth::Authenticator;
use crate::parser::ListenKeyResponse;
use crate::rest::RestClient;
use crate::websocket::{Backoff, WsClient};
use crate::Shutdown;

const LISTEN_KEY_PATH: &str = "/api/v3/userDataStream";
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Message from the user-data stream to the gateway.
#[derive(Debug, Clone)]
pub enum UserStreamEvent {
    /// Raw frame, passed through verbatim.
    Message(String),
    /// Reconnect attempts exhausted; the stream has stopped.
    ConnectionFailure,
}

pub struct UserDataStream {
    rest: Arc<RestClient>,
    auth: Arc<Authenticator>,
    ws_base: String,
    listen_key: Arc<Mutex<String>>,
    max_reconnect_attempts: u32,
    events: mpsc::UnboundedSender<UserStreamEvent>,
    shutdown: Shutdown,
}

impl UserDataStream {
    pub fn new(
        rest: Arc<RestClient>,
        auth: Arc<Authenticator>,
        ws_base: String,
        max_reconnect_attempts: u32,
        events: mpsc::UnboundedSender<UserStreamEvent>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            rest,
            auth,
            ws_base,
            listen_key: Arc::new(Mutex::new(String::new())),
            max_reconnect_attempts,
            events,
            shutdown,
        }
    }

    /// Drive the stream until shutdown or reconnect exhaustion.
    pub async fn run(self) {
        let mut backoff = Backoff::new(self.max_reconnect_attempts);

        while self.shutdown.is_running() {
            let key = match self.create_listen_key().await {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "listen key creation failed");
                    if !self.delay_or_give_up(&mut backoff).await {
                        return;
                    }
                    continue;
                }
            };
            *self.listen_key.lock().unwrap() = key.clone();
            info!("user data stream listen key acquired");

            let url = format!("{}/ws/{}", self.ws_base, key);
            match WsClient::connect(&url).await {
                Ok(ws) => {
                    backoff.reset();
                    self.read_loop(ws).await;
                }
                Err(e) => warn!(error = %e, "user data stream connect failed"),
            }

            if !self.shutdown.is_running() {
                break;
            }
            if !self.delay_or_give_up(&mut backoff).await {
                return;
            }
        }

        self.close_listen_key().await;
        info!("user data stream stopped");
    }

    /// Read frames and run the keep-alive timer until the connection
    /// drops or a forced reconnect is needed.
    async fn read_loop(&self, mut ws: WsClient) {
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keep_alive.tick().await; // first tick completes immediately

        info!("user data stream connected");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    ws.close().await;
                    return;
                }
                frame = ws.recv() => match frame {
                    Ok(Some(text)) => {
                        let _ = self.events.send(UserStreamEvent::Message(text));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "user data stream dropped");
                        return;
                    }
                },
                _ = keep_alive.tick() => {
                    if let Err(e) = self.keep_alive_listen_key().await {
                        // A failed keep-alive invalidates the session:
                        // force a reconnect with a fresh key.
                        warn!(error = %e, "listen key keep-alive failed, forcing reconnect");
                        ws.close().await;
                        return;
                    }
                    info!("listen key extended");
                }
            }
        }
    }

    async fn delay_or_give_up(&self, backoff: &mut Backoff) -> bool {
        match backoff.next_delay() {
            Some(delay) => {
                warn!(
                    attempt = backoff.attempts(),
                    delay_secs = delay.as_secs(),
                    "user data stream reconnecting"
                );
                tokio::time::sleep(delay).await;
                true
            }
            None => {
                error!("user data stream reconnect attempts exhausted");
                let _ = self.events.send(UserStreamEvent::ConnectionFailure);
                self.close_listen_key().await;
                false
            }
        }
    }

    /// `POST /api/v3/userDataStream` — API key header, no signature.
    async fn create_listen_key(&self) -> crate::error::Result<String> {
        let response: ListenKeyResponse = self
            .rest
            .keyed(Method::POST, LISTEN_KEY_PATH, &[], &self.auth)
            .await?;
        Ok(response.listen_key)
    }

    async fn keep_alive_listen_key(&self) -> crate::error::Result<()> {
        let key = self.listen_key.lock().unwrap().clone();
        let _: serde_json::Value = self
            .rest
            .keyed(
                Method::PUT,
                LISTEN_KEY_PATH,
                &[("listenKey", key)],
                &self.auth,
            )
            .await?;
        Ok(())
    }

    async fn close_listen_key(&self) {
        let key = {
            let mut guard = self.listen_key.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        if key.is_empty() {
            return;
        }
        let result: crate::error::Result<serde_json::Value> = self
            .rest
            .keyed(
                Method::DELETE,
                LISTEN_KEY_PATH,
                &[("listenKey", key)],
                &self.auth,
            )
            .await;
        match result {
            Ok(_) => info!("listen key closed"),
            Err(e) => warn!(error = %e, "failed to close listen key"),
        }
    }
}
