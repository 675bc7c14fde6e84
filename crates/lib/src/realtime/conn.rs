//! Transport seam: a dialer that opens a duplex connection, and the connection itself.
//!
//! The streaming session only talks to [`Dialer`] and [`Connection`], so it can be
//! driven by the in-memory implementation in [`super::testing`] as well as by the
//! WebSocket implementation here.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// One transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Ping, pong, or any other frame without application data.
    Control,
}

/// Close codes the client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1011
    InternalError,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::InternalError => 1011,
        }
    }
}

impl From<CloseCode> for WsCloseCode {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => WsCloseCode::Normal,
            CloseCode::InternalError => WsCloseCode::Error,
        }
    }
}

/// Extra handshake parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialOptions {
    pub headers: Vec<(String, String)>,
}

impl DialOptions {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// What the server answered to the upgrade request; kept for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer closed normally or the stream ended.
    #[error("end of stream")]
    EndOfStream,

    #[error("connection closed by peer: {code} {reason}")]
    PeerClosed { code: u16, reason: String },

    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, TransportError::EndOfStream)
    }
}

/// An open duplex connection. Reads and closes may run concurrently; close must be idempotent.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Wait for the next frame.
    async fn read(&self) -> Result<Frame, TransportError>;

    async fn close(&self, code: CloseCode, reason: &str) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        uri: &str,
        opts: &DialOptions,
    ) -> Result<(Arc<dyn Connection>, Handshake), TransportError>;
}

/// Dials real WebSocket endpoints (`ws://` and `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(
        &self,
        uri: &str,
        opts: &DialOptions,
    ) -> Result<(Arc<dyn Connection>, Handshake), TransportError> {
        let mut req = uri.into_client_request()?;
        for (name, value) in &opts.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Other(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Other(format!("invalid header value: {}", e)))?;
            req.headers_mut().insert(name, value);
        }
        let (ws, resp) = tokio_tungstenite::connect_async(req).await?;
        let handshake = Handshake {
            status: resp.status().as_u16(),
            headers: resp
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_string(),
                        String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    )
                })
                .collect(),
        };
        Ok((Arc::new(WsConnection::new(ws)), handshake))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close` waits to hand the close frame to the peer.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket connection split into halves so a pending read never blocks a close.
pub struct WsConnection {
    reader: Mutex<SplitStream<WsStream>>,
    writer: Mutex<SplitSink<WsStream, WsMessage>>,
    closed: AtomicBool,
    close_timeout: Duration,
}

impl WsConnection {
    pub fn new(ws: WsStream) -> Self {
        let (writer, reader) = ws.split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn read(&self) -> Result<Frame, TransportError> {
        let mut reader = self.reader.lock().await;
        match reader.next().await {
            None => Err(TransportError::EndOfStream),
            Some(Ok(msg)) => classify(msg),
            Some(Err(tungstenite::Error::ConnectionClosed))
            | Some(Err(tungstenite::Error::AlreadyClosed)) => Err(TransportError::EndOfStream),
            Some(Err(e)) => Err(e.into()),
        }
    }

    async fn close(&self, code: CloseCode, reason: &str) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let frame = CloseFrame {
            code: code.into(),
            reason: Cow::Owned(reason.to_string()),
        };
        let send = async {
            let mut writer = self.writer.lock().await;
            writer.send(WsMessage::Close(Some(frame))).await
        };
        match tokio::time::timeout(self.close_timeout, send).await {
            Err(_) => {
                log::warn!(
                    "realtime: close frame not sent within {:?}, giving up",
                    self.close_timeout
                );
                Err(TransportError::Other("close timed out".into()))
            }
            Ok(Ok(())) => Ok(()),
            Ok(Err(tungstenite::Error::ConnectionClosed))
            | Ok(Err(tungstenite::Error::AlreadyClosed)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

fn classify(msg: WsMessage) -> Result<Frame, TransportError> {
    match msg {
        WsMessage::Text(s) => Ok(Frame::Text(s)),
        WsMessage::Binary(b) => Ok(Frame::Binary(b)),
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(Frame::Control),
        WsMessage::Close(None) => Err(TransportError::EndOfStream),
        WsMessage::Close(Some(cf)) => match cf.code {
            WsCloseCode::Normal | WsCloseCode::Away => Err(TransportError::EndOfStream),
            code => Err(TransportError::PeerClosed {
                code: code.into(),
                reason: cf.reason.into_owned(),
            }),
        },
    }
}
