//! In-memory dialer and connection for exercising streaming code without a network.
//!
//! ```ignore
//! let (dialer, script) = sense::realtime::testing::scripted();
//! script.text(r#"{"type":"hello","payload":{"online":true}}"#);
//! drop(script); // end of stream after the scripted frames
//! let client = RealtimeClient::default().with_dialer(Arc::new(dialer.clone()));
//! ```

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::conn::{CloseCode, Connection, DialOptions, Dialer, Frame, Handshake, TransportError};

type Scripted = Result<Frame, TransportError>;

/// Create a connected dialer/script pair. Frames pushed on the script are read, in order,
/// by the connection the dialer hands out. Dropping the script ends the stream.
pub fn scripted() -> (ScriptedDialer, FrameScript) {
    let (tx, rx) = mpsc::unbounded_channel();
    let dialer = ScriptedDialer {
        inner: Arc::new(Inner {
            rx: Mutex::new(Some(rx)),
            fail: None,
            dialed: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
            closes: Arc::new(Mutex::new(Vec::new())),
        }),
    };
    (dialer, FrameScript { tx })
}

/// Feeds frames to a [`ScriptedConnection`].
#[derive(Clone)]
pub struct FrameScript {
    tx: mpsc::UnboundedSender<Scripted>,
}

impl FrameScript {
    pub fn text(&self, s: impl Into<String>) {
        let _ = self.tx.send(Ok(Frame::Text(s.into())));
    }

    pub fn json(&self, v: &serde_json::Value) {
        self.text(v.to_string());
    }

    pub fn binary(&self, b: impl Into<Vec<u8>>) {
        let _ = self.tx.send(Ok(Frame::Binary(b.into())));
    }

    pub fn control(&self) {
        let _ = self.tx.send(Ok(Frame::Control));
    }

    /// Make the next read after the queued frames fail with `err`.
    pub fn error(&self, err: TransportError) {
        let _ = self.tx.send(Err(err));
    }
}

struct Inner {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Scripted>>>,
    fail: Option<String>,
    dialed: Mutex<Vec<String>>,
    options: Mutex<Vec<DialOptions>>,
    closes: Arc<Mutex<Vec<(CloseCode, String)>>>,
}

/// Records every dial and close; cheap to clone, clones share the record.
#[derive(Clone)]
pub struct ScriptedDialer {
    inner: Arc<Inner>,
}

impl ScriptedDialer {
    /// A dialer whose every dial fails with `msg`.
    pub fn failing(msg: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                rx: Mutex::new(None),
                fail: Some(msg.into()),
                dialed: Mutex::new(Vec::new()),
                options: Mutex::new(Vec::new()),
                closes: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    /// URIs dialed so far.
    pub fn dialed(&self) -> Vec<String> {
        lock(&self.inner.dialed).clone()
    }

    pub fn options(&self) -> Vec<DialOptions> {
        lock(&self.inner.options).clone()
    }

    /// Every close call made on connections from this dialer, including repeated ones.
    pub fn closes(&self) -> Vec<(CloseCode, String)> {
        lock(&self.inner.closes).clone()
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(
        &self,
        uri: &str,
        opts: &DialOptions,
    ) -> Result<(Arc<dyn Connection>, Handshake), TransportError> {
        lock(&self.inner.dialed).push(uri.to_string());
        lock(&self.inner.options).push(opts.clone());
        if let Some(msg) = &self.inner.fail {
            return Err(TransportError::Other(msg.clone()));
        }
        // Only the first connection gets the script; later ones see an empty stream.
        let rx = lock(&self.inner.rx).take().unwrap_or_else(|| {
            let (_, rx) = mpsc::unbounded_channel();
            rx
        });
        let conn = ScriptedConnection {
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
            closes: Arc::clone(&self.inner.closes),
        };
        let handshake = Handshake {
            status: 101,
            headers: Vec::new(),
        };
        Ok((Arc::new(conn), handshake))
    }
}

/// Connection handed out by [`ScriptedDialer`]. Closing it interrupts a pending read.
pub struct ScriptedConnection {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Scripted>>,
    closed: CancellationToken,
    closes: Arc<Mutex<Vec<(CloseCode, String)>>>,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn read(&self) -> Result<Frame, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::EndOfStream);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::EndOfStream),
            next = rx.recv() => next.unwrap_or(Err(TransportError::EndOfStream)),
        }
    }

    async fn close(&self, code: CloseCode, reason: &str) -> Result<(), TransportError> {
        lock(&self.closes).push((code, reason.to_string()));
        self.closed.cancel();
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_arrive_in_order_then_end() {
        let (dialer, script) = scripted();
        script.text("a");
        script.control();
        script.text("b");
        drop(script);
        let (conn, hs) = dialer.dial("ws://x/", &DialOptions::default()).await.unwrap();
        assert_eq!(hs.status, 101);
        assert_eq!(conn.read().await.unwrap(), Frame::Text("a".into()));
        assert_eq!(conn.read().await.unwrap(), Frame::Control);
        assert_eq!(conn.read().await.unwrap(), Frame::Text("b".into()));
        assert!(conn.read().await.unwrap_err().is_end_of_stream());
        assert_eq!(dialer.dialed(), vec!["ws://x/".to_string()]);
    }

    #[tokio::test]
    async fn close_interrupts_pending_read_and_is_recorded() {
        let (dialer, _script) = scripted();
        let (conn, _) = dialer.dial("ws://x/", &DialOptions::default()).await.unwrap();
        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.read().await })
        };
        tokio::task::yield_now().await;
        conn.close(CloseCode::Normal, "").await.unwrap();
        conn.close(CloseCode::Normal, "").await.unwrap();
        assert!(reader.await.unwrap().unwrap_err().is_end_of_stream());
        assert_eq!(dialer.closes().len(), 2);
        assert_eq!(dialer.closes()[0].0, CloseCode::Normal);
    }

    #[tokio::test]
    async fn failing_dialer_records_uri() {
        let dialer = ScriptedDialer::failing("no route to host");
        let err = dialer
            .dial("wss://nowhere/", &DialOptions::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "no route to host");
        assert_eq!(dialer.dialed().len(), 1);
    }
}
