//! WebSocket transport to the streaming server.
//!
//! Wraps a tokio-tungstenite stream and reduces it to the frames the engine
//! cares about: text, binary and the end of the connection.

use audiopirate_common::ClientMessage;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::EngineError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// The peer closed the connection; the reason may be empty
    Closed(String),
}

/// An open WebSocket connection.
pub struct WsTransport {
    // ---
    stream: WsStream,
}

impl WsTransport {
    // ---
    /// Opens a connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns error if the handshake fails or does not finish within
    /// `connect_timeout`.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, EngineError> {
        // ---
        let (stream, response) = timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| EngineError::Timeout(connect_timeout))??;

        info!("WebSocket open to {} (HTTP {})", url, response.status());

        Ok(Self { stream })
    }

    /// Serializes and sends a control message.
    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), EngineError> {
        // ---
        let text = message.to_json()?;
        debug!("-> {}", text);
        self.send_text(text).await
    }

    /// Sends an arbitrary text frame.
    pub async fn send_text(&mut self, text: String) -> Result<(), EngineError> {
        // ---
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Waits for the next text or binary frame.
    ///
    /// Control frames are handled by tungstenite and skipped here. A stream
    /// that ends without a close frame is reported as `Closed`.
    ///
    /// # Errors
    ///
    /// Returns error on a transport failure.
    pub async fn next_frame(&mut self) -> Result<Frame, EngineError> {
        // ---
        loop {
            let message = match self.stream.next().await {
                Some(message) => message?,
                None => return Ok(Frame::Closed(String::new())),
            };

            match message {
                Message::Text(text) => return Ok(Frame::Text(text.as_str().to_owned())),
                Message::Binary(data) => return Ok(Frame::Binary(data.to_vec())),
                Message::Close(frame) => {
                    let reason = frame.map(|f| f.reason.as_str().to_owned()).unwrap_or_default();
                    return Ok(Frame::Closed(reason));
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    /// Sends a close frame and waits briefly for the peer to acknowledge.
    pub async fn close(mut self) {
        // ---
        if let Err(e) = self.stream.close(None).await {
            debug!("Close handshake failed: {}", e);
            return;
        }

        // Drain until the peer's close arrives or the stream ends
        let drain = async { while let Some(Ok(_)) = self.stream.next().await {} };
        if timeout(Duration::from_millis(500), drain).await.is_err() {
            debug!("Peer did not acknowledge close");
        }
    }
}
