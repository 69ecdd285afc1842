//! Duplex framed transport.
//!
//! The pool and session only need four operations from a socket: send a
//! frame, receive a frame, ping, and close. [`Transport`] captures exactly
//! that so both can be driven by an in-memory fake in tests, while
//! [`WsTransport`] provides the production implementation over
//! `tokio-tungstenite` with rustls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::HeaderMap;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Close code used by peers that vanish without a closing handshake.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Bound on how long `close()` waits to flush the close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

// =============================================================================
// Errors
// =============================================================================

/// Transport failures, classified so callers can tell a dead socket from a
/// recoverable protocol problem.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer sent a close frame.
    #[error("Connection closed by peer (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },

    /// The stream ended without a close frame.
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// The peer reset the connection without a closing handshake.
    #[error("Connection reset without closing handshake")]
    Reset,

    /// No frame arrived within the read timeout.
    #[error("Read timed out")]
    Timeout,

    /// `close()` was called on this side.
    #[error("Connection closed locally")]
    LocallyClosed,

    /// Opening handshake failed or timed out.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The handshake was answered with a non-upgrade HTTP status.
    #[error("Handshake rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("WebSocket protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// True when the connection ended ungracefully and must not be reused.
    pub fn is_abnormal_closure(&self) -> bool {
        match self {
            Self::UnexpectedEof | Self::Reset => true,
            Self::Closed { code, .. } => *code == Some(ABNORMAL_CLOSE_CODE),
            _ => false,
        }
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::Closed {
                    code: None,
                    reason: "connection already closed".to_string(),
                }
            }
            tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                Self::Reset
            }
            tungstenite::Error::Io(io) => match io.kind() {
                std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEof,
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe => Self::Reset,
                _ => Self::Io(io.to_string()),
            },
            tungstenite::Error::Http(response) => {
                let status = response.status();
                let body = response
                    .body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                Self::Rejected {
                    status: status.as_u16(),
                    body,
                }
            }
            other => Self::Protocol(other.to_string()),
        }
    }
}

// =============================================================================
// Trait
// =============================================================================

/// A duplex, message-framed connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Writes one binary frame.
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Reads the next data frame, skipping control frames.
    async fn recv(&self) -> Result<Bytes, TransportError>;

    /// Sends a keepalive ping.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Closes the connection. Idempotent; wakes a blocked `recv`.
    async fn close(&self);
}

// =============================================================================
// WebSocket implementation
// =============================================================================

/// Connection options for [`WsTransport::connect`].
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub handshake_timeout: Duration,
    /// Per-frame read deadline. `None` waits forever.
    pub read_timeout: Option<Duration>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            read_timeout: Some(Duration::from_secs(30)),
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Transport`] over a tokio-tungstenite client socket.
pub struct WsTransport {
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    stream: tokio::sync::Mutex<SplitStream<WsStream>>,
    closed: CancellationToken,
    closing: AtomicBool,
    read_timeout: Option<Duration>,
}

impl WsTransport {
    /// Performs the opening handshake against `url` with extra `headers`.
    pub async fn connect(
        url: &str,
        headers: HeaderMap,
        options: TransportOptions,
    ) -> Result<Self, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Handshake(format!("Invalid WebSocket URL: {e}")))?;
        request.headers_mut().extend(headers);

        debug!(url = %url, "Opening WebSocket connection");
        let (ws_stream, _response) =
            tokio::time::timeout(options.handshake_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| {
                    TransportError::Handshake(format!(
                        "Connection timed out after {}ms",
                        options.handshake_timeout.as_millis()
                    ))
                })??;

        info!(url = %url, "WebSocket connected");

        let (sink, stream) = ws_stream.split();
        Ok(Self {
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
            closed: CancellationToken::new(),
            closing: AtomicBool::new(false),
            read_timeout: options.read_timeout,
        })
    }

    async fn next_message(
        stream: &mut SplitStream<WsStream>,
        read_timeout: Option<Duration>,
    ) -> Result<Option<Result<Message, tungstenite::Error>>, TransportError> {
        match read_timeout {
            Some(deadline) => tokio::time::timeout(deadline, stream.next())
                .await
                .map_err(|_| TransportError::Timeout),
            None => Ok(stream.next().await),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::LocallyClosed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(frame)).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        let mut stream = tokio::select! {
            _ = self.closed.cancelled() => return Err(TransportError::LocallyClosed),
            guard = self.stream.lock() => guard,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(TransportError::LocallyClosed),
                next = Self::next_message(&mut stream, self.read_timeout) => next?,
            };

            match next {
                None => return Err(TransportError::UnexpectedEof),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Binary(data))) => return Ok(data),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Bytes::copy_from_slice(text.as_bytes()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_string()))
                        .unwrap_or((None, String::new()));
                    debug!(?code, reason = %reason, "Peer sent close frame");
                    return Err(TransportError::Closed { code, reason });
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            }
        }
    }

    async fn ping(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::LocallyClosed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Ping(Bytes::new())).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();

        let goodbye = async {
            let mut sink = self.sink.lock().await;
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                })))
                .await;
            let _ = sink.close().await;
        };
        if tokio::time::timeout(CLOSE_GRACE, goodbye).await.is_err() {
            debug!("Timed out flushing WebSocket close frame");
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}
