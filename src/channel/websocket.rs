//! WebSocket carriage for cast messages.
//!
//! Each text frame holds one JSON envelope `{"namespace": ..., "data": ...}`
//! where `data` is the message body as a string.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};

use crate::mirroring::messages::CastMessage;

/// Transport under a client connection made by [`CastSocket::connect`].
pub type ClientStream = tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>;

pub struct CastSocket<S = ClientStream> {
    stream: WebSocketStream<S>,
}

impl CastSocket {
    /// Connect to a message relay, e.g. `ws://127.0.0.1:8009/cast`.
    pub async fn connect(url: &str) -> Result<Self> {
        tracing::info!("Connecting cast channel to {}", url);

        let (stream, response) = connect_async(url)
            .await
            .context("WebSocket connection failed")?;

        tracing::info!("Cast channel connected (status={})", response.status());

        Ok(Self { stream })
    }
}

impl<S> CastSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already upgraded stream, such as one from `accept_async`.
    #[cfg(test)]
    pub fn from_stream(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }

    pub async fn send_message(&mut self, message: &CastMessage) -> Result<()> {
        let text = encode_envelope(message)?;
        tracing::debug!("WS send: {}", text);
        self.stream
            .send(Message::Text(text))
            .await
            .context("Failed to send WebSocket message")
    }

    /// Receive the next cast message, skipping control frames and
    /// envelopes that do not parse.
    pub async fn recv_message(&mut self) -> Result<Option<CastMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    match decode_envelope(&text) {
                        Ok(message) => return Ok(Some(message)),
                        Err(e) => tracing::warn!("Dropping malformed envelope: {:#}", e),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket receive error");
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("WebSocket close failed: {}", e);
        }
    }
}

pub fn encode_envelope(message: &CastMessage) -> Result<String> {
    serde_json::to_string(message).context("Failed to encode cast message")
}

pub fn decode_envelope(text: &str) -> Result<CastMessage> {
    serde_json::from_str(text).context("Invalid cast message envelope")
}
