//! Frame Transport
//!
//! Owns one WebSocket connection at a time and hands every complete text
//! frame to an observer until the peer closes, the connection fails or the
//! cancel signal fires.
//!
//! # Contract
//!
//! - `on_open` fires only after the handshake succeeded.
//! - `on_close` fires exactly once per `on_open`, however the loop ends.
//! - Binary frames are logged and ignored.
//! - A close frame from the peer ends the stream without an error.
//! - Cancellation attempts a close handshake bounded by `close_timeout`;
//!   failures of that handshake are swallowed.
//! - `stream` is not reentrant; a second concurrent call fails fast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// `stream` was called while a previous call is still running.
    #[error("transport is already streaming")]
    AlreadyStreaming,

    /// Connecting or the WebSocket handshake failed.
    #[error("failed to connect: {0}")]
    Connect(#[source] Box<WsError>),

    /// Reading from or writing to the socket failed.
    #[error("receive failed: {0}")]
    Receive(#[source] Box<WsError>),

    /// The socket ended without a close frame.
    #[error("connection closed unexpectedly")]
    ConnectionClosed,
}

/// Receives connection lifecycle notifications and text frames.
pub trait TransportObserver: Send + Sync {
    /// The handshake succeeded.
    fn on_open(&self);

    /// One complete text frame.
    fn on_message(&self, text: &str);

    /// The connection ended (paired with `on_open`).
    fn on_close(&self);
}

/// A connection that delivers text frames to an observer.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Connect to `uri` and deliver frames until closed or cancelled.
    ///
    /// Returns `Ok(())` when the peer closed cleanly or `cancel` fired.
    async fn stream(
        &self,
        uri: &str,
        cancel: CancellationToken,
        observer: &dyn TransportObserver,
    ) -> Result<(), TransportError>;

    /// Whether a `stream` call is in progress.
    fn is_streaming(&self) -> bool;
}

// =============================================================================
// Guards
// =============================================================================

struct StreamingGuard<'a>(&'a AtomicBool);

impl Drop for StreamingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct CloseGuard<'a>(&'a dyn TransportObserver);

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        self.0.on_close();
    }
}

// =============================================================================
// WebSocket Transport
// =============================================================================

/// `tokio-tungstenite` implementation of [`FrameTransport`].
#[derive(Debug)]
pub struct WebSocketTransport {
    close_timeout: Duration,
    streaming: AtomicBool,
}

impl WebSocketTransport {
    /// Create a transport with the given close handshake bound.
    #[must_use]
    pub const fn new(close_timeout: Duration) -> Self {
        Self {
            close_timeout,
            streaming: AtomicBool::new(false),
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl FrameTransport for WebSocketTransport {
    async fn stream(
        &self,
        uri: &str,
        cancel: CancellationToken,
        observer: &dyn TransportObserver,
    ) -> Result<(), TransportError> {
        if self
            .streaming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransportError::AlreadyStreaming);
        }
        let _streaming = StreamingGuard(&self.streaming);

        info!(uri, "connecting to stream");
        let connected = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            connected = tokio_tungstenite::connect_async(uri) => connected,
        };
        let (ws_stream, _response) =
            connected.map_err(|e| TransportError::Connect(Box::new(e)))?;
        let (mut write, mut read) = ws_stream.split();

        observer.on_open();
        let _closed = CloseGuard(observer);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let handshake = async {
                        write.send(Message::Close(None)).await?;
                        while let Some(msg) = read.next().await {
                            if matches!(msg?, Message::Close(_)) {
                                break;
                            }
                        }
                        Ok::<(), WsError>(())
                    };
                    match tokio::time::timeout(self.close_timeout, handshake).await {
                        Ok(Ok(())) => debug!(uri, "close handshake completed"),
                        Ok(Err(e)) => debug!(uri, error = %e, "close handshake failed"),
                        Err(_) => debug!(uri, "close handshake timed out"),
                    }
                    return Ok(());
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => observer.on_message(text.as_str()),
                        Some(Ok(Message::Binary(data))) => {
                            warn!(uri, len = data.len(), "ignoring binary frame");
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write
                                .send(Message::Pong(data))
                                .await
                                .map_err(|e| TransportError::Receive(Box::new(e)))?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(uri, reason = ?frame, "server sent close frame");
                            return Ok(());
                        }
                        Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                        Some(Err(e)) => return Err(TransportError::Receive(Box::new(e))),
                        None => return Err(TransportError::ConnectionClosed),
                    }
                }
            }
        }
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }
}
