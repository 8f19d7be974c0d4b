//! Signal channels
//!
//! The overlay supplies a bidirectional typed message channel. Protocol
//! state machines only need `send` and `receive`; bounded and cancellable
//! waits are layered on top by [`receive_within`] and [`send_within`].

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::protocol::{PeerId, Signal};

use super::error::NatError;

/// Bidirectional signal channel supplied by the overlay
#[async_trait]
pub trait SignalChannel: Send {
    async fn send(&mut self, signal: Signal) -> Result<(), NatError>;

    async fn receive(&mut self) -> Result<Signal, NatError>;
}

/// Receive one signal, bounded by `timeout` and `cancel`
pub async fn receive_within<C>(
    channel: &mut C,
    timeout: Duration,
    cancel: &CancellationToken,
    what: &'static str,
) -> Result<Signal, NatError>
where
    C: SignalChannel + ?Sized,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(NatError::Cancelled),
        res = tokio::time::timeout(timeout, channel.receive()) => {
            res.map_err(|_| NatError::Timeout(what))?
        }
    }
}

/// Send one signal, bounded by `timeout` and `cancel`
pub async fn send_within<C>(
    channel: &mut C,
    signal: Signal,
    timeout: Duration,
    cancel: &CancellationToken,
    what: &'static str,
) -> Result<(), NatError>
where
    C: SignalChannel + ?Sized,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(NatError::Cancelled),
        res = tokio::time::timeout(timeout, channel.send(signal)) => {
            res.map_err(|_| NatError::Timeout(what))?
        }
    }
}

/// Exchange `Hello` signals and return the peer's identity.
///
/// Stands in for the caller identity an overlay query would carry.
pub async fn exchange_hello<C>(
    channel: &mut C,
    local: PeerId,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<PeerId, NatError>
where
    C: SignalChannel + ?Sized,
{
    send_within(
        channel,
        Signal::Hello { identity: local },
        timeout,
        cancel,
        "hello send",
    )
    .await?;

    match receive_within(channel, timeout, cancel, "hello").await? {
        Signal::Hello { identity } if identity == local => Err(NatError::Signaling(
            "peer announced our own identity".to_string(),
        )),
        Signal::Hello { identity } => {
            debug!("Peer identified as {}", identity);
            Ok(identity)
        }
        Signal::Error { message } => Err(NatError::Remote(message)),
        other => Err(NatError::unexpected("hello", other.name())),
    }
}

/// In-process channel, one half of a connected pair
#[derive(Debug)]
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<Signal>,
    rx: mpsc::UnboundedReceiver<Signal>,
}

impl MemoryChannel {
    /// Create two connected channel ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self { tx: a_tx, rx: b_rx },
            Self { tx: b_tx, rx: a_rx },
        )
    }
}

#[async_trait]
impl SignalChannel for MemoryChannel {
    async fn send(&mut self, signal: Signal) -> Result<(), NatError> {
        trace!("Signal out: {}", signal.name());
        self.tx.send(signal).map_err(|_| NatError::ChannelClosed)
    }

    async fn receive(&mut self) -> Result<Signal, NatError> {
        self.rx.recv().await.ok_or(NatError::ChannelClosed)
    }
}

/// Signal channel over a WebSocket, one JSON text frame per signal
pub struct WsChannel<S> {
    ws_stream: WebSocketStream<S>,
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(ws_stream: WebSocketStream<S>) -> Self {
        Self { ws_stream }
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<(), NatError> {
        self.ws_stream
            .close(None)
            .await
            .map_err(|e| NatError::Signaling(format!("Close failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl<S> SignalChannel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, signal: Signal) -> Result<(), NatError> {
        let json = serde_json::to_string(&signal)
            .map_err(|e| NatError::Signaling(format!("Serialize failed: {}", e)))?;

        self.ws_stream
            .send(Message::Text(json))
            .await
            .map_err(|e| NatError::Signaling(format!("Send failed: {}", e)))?;

        trace!("Signal out: {}", signal.name());
        Ok(())
    }

    async fn receive(&mut self) -> Result<Signal, NatError> {
        loop {
            match self.ws_stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text).map_err(|e| {
                        NatError::Signaling(format!("Deserialize failed: {}", e))
                    });
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(NatError::ChannelClosed);
                }
                Some(Err(e)) => {
                    return Err(NatError::Signaling(format!("Receive failed: {}", e)));
                }
                _ => continue,
            }
        }
    }
}
