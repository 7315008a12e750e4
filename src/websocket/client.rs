//! WebSocket client for exchange streams
//!
//! Handles connection, message reception, and protocol pings. One
//! client per stream; reconnection policy lives with the caller.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsClient {
    stream: WsStream,
    url: String,
}

impl WsClient {
    /// Connect to a stream URL (TLS with SNI and peer verification).
    pub async fn connect(url: &str) -> Result<Self> {
        debug!(url = %url, "connecting websocket");
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| BridgeError::Transport(format!("connect {url}: {e}")))?;
        debug!(url = %url, status = ?response.status(), "websocket connected");
        Ok(Self {
            stream,
            url: url.to_string(),
        })
    }

    /// Receive the next text frame.
    ///
    /// `Ok(None)` means a control frame was handled (pings are answered
    /// with pongs); closure and transport errors surface as `Err`.
    pub async fn recv(&mut self) -> Result<Option<String>> {
        match self.stream.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(text)),
            Some(Ok(Message::Binary(data))) => {
                Ok(Some(String::from_utf8_lossy(&data).to_string()))
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = self.stream.send(Message::Pong(data)).await;
                Ok(None)
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Ok(Message::Close(frame))) => {
                warn!(url = %self.url, frame = ?frame, "websocket closed by peer");
                Err(BridgeError::Transport("connection closed".to_string()))
            }
            Some(Err(e)) => Err(BridgeError::Transport(format!("{}: {e}", self.url))),
            None => Err(BridgeError::Transport("stream ended".to_string())),
        }
    }

    /// Send a keepalive ping.
    pub async fn ping(&mut self) -> Result<()> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    /// Close the connection gracefully.
    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
