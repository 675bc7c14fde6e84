//! One streaming session: a read loop feeding a dispatch loop through a one-slot channel.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::conn::{CloseCode, Connection, Frame, TransportError};
use super::message::{Decoder, Message};

/// What the handler wants the session to do after a message.
#[derive(Debug)]
pub enum Flow {
    Continue,
    /// End the session successfully.
    Stop,
    /// End the session with this error.
    Fail(anyhow::Error),
}

impl Flow {
    pub fn fail(err: impl Into<anyhow::Error>) -> Self {
        Flow::Fail(err.into())
    }
}

/// Receives every decoded message of a session, one at a time, in arrival order.
#[async_trait]
pub trait Handler: Send {
    async fn handle(&mut self, cancel: &CancellationToken, msg: Message) -> Flow;
}

#[async_trait]
impl<F> Handler for F
where
    F: FnMut(&CancellationToken, Message) -> Flow + Send,
{
    async fn handle(&mut self, cancel: &CancellationToken, msg: Message) -> Flow {
        (self)(cancel, msg)
    }
}

/// Why a session ended unsuccessfully.
#[derive(Debug)]
pub(crate) enum SessionError {
    Transport(TransportError),
    Handler(anyhow::Error),
}

/// Drive `conn` until cancellation, end of stream, a handler stop, or an error.
pub(crate) async fn run<H: Handler>(
    conn: Arc<dyn Connection>,
    decoder: Decoder,
    cancel: &CancellationToken,
    mut handler: H,
) -> Result<(), SessionError> {
    let (tx, mut rx) = mpsc::channel(1);
    let teardown = CancellationToken::new();
    // Stops the read loop whenever this function returns.
    let _guard = teardown.clone().drop_guard();
    let mut reader = tokio::spawn(read_loop(Arc::clone(&conn), decoder, tx, teardown));

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("realtime: session cancelled");
                close(&conn, CloseCode::Normal, "").await;
                return Ok(());
            }
            next = rx.recv() => {
                let Some(msg) = next else {
                    return match (&mut reader).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) if e.is_end_of_stream() => Ok(()),
                        Ok(Err(e)) => Err(SessionError::Transport(e)),
                        Err(e) => Err(SessionError::Transport(TransportError::Other(format!(
                            "read loop failed: {}",
                            e
                        )))),
                    };
                };
                match handler.handle(cancel, msg).await {
                    Flow::Continue => {}
                    Flow::Stop => {
                        close(&conn, CloseCode::Normal, "").await;
                        return Ok(());
                    }
                    Flow::Fail(err) => {
                        close(&conn, CloseCode::InternalError, &err.to_string()).await;
                        return Err(SessionError::Handler(err));
                    }
                }
            }
        }
    }
}

async fn close(conn: &Arc<dyn Connection>, code: CloseCode, reason: &str) {
    // Close reasons are limited to 123 bytes on the wire.
    let reason = truncate(reason, 123);
    if let Err(e) = conn.close(code, reason).await {
        log::debug!("realtime: close failed: {}", e);
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

async fn read_loop(
    conn: Arc<dyn Connection>,
    mut decoder: Decoder,
    tx: mpsc::Sender<Message>,
    teardown: CancellationToken,
) -> Result<(), TransportError> {
    loop {
        let frame = tokio::select! {
            _ = teardown.cancelled() => return Ok(()),
            frame = conn.read() => frame?,
        };
        let Frame::Text(text) = frame else {
            continue;
        };
        let Ok(msg) = decoder.decode(text.as_bytes()) else {
            continue;
        };
        tokio::select! {
            _ = teardown.cancelled() => return Ok(()),
            sent = tx.send(msg) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
