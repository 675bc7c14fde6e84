//! Realtime feed client: builds the feed URI, dials, and runs a session.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::conn::{DialOptions, Dialer, TransportError, WsDialer};
use super::message::Decoder;
use super::session::{self, Handler, SessionError};
use crate::auth::{AuthError, TokenSource};

pub const DEFAULT_REALTIME_URL: &str = "wss://clientrt.sense.com/";
pub const DEFAULT_ORIGIN: &str = "https://home.sense.com";

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("invalid realtime url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("obtaining access token: {0}")]
    Token(#[source] AuthError),

    #[error("dialing {uri}: {source}")]
    Dial {
        uri: String,
        #[source]
        source: TransportError,
    },

    #[error("realtime stream: {0}")]
    Transport(#[from] TransportError),

    /// Returned verbatim from the handler.
    #[error("{0}")]
    Handler(anyhow::Error),
}

impl StreamError {
    /// The handler's own error, when the session ended because the handler failed.
    pub fn handler_error(&self) -> Option<&anyhow::Error> {
        match self {
            StreamError::Handler(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_handler_error(self) -> Result<anyhow::Error, Self> {
        match self {
            StreamError::Handler(e) => Ok(e),
            other => Err(other),
        }
    }
}

impl From<SessionError> for StreamError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Transport(e) => StreamError::Transport(e),
            SessionError::Handler(e) => StreamError::Handler(e),
        }
    }
}

/// Opens realtime feeds for monitors.
#[derive(Clone)]
pub struct RealtimeClient {
    base_url: String,
    origin: String,
    device_id: Option<String>,
    token_source: Option<Arc<dyn TokenSource>>,
    dialer: Arc<dyn Dialer>,
}

impl Default for RealtimeClient {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REALTIME_URL.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            device_id: None,
            token_source: None,
            dialer: Arc::new(WsDialer),
        }
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("base_url", &self.base_url)
            .field("origin", &self.origin)
            .field("device_id", &self.device_id)
            .field("token_source", &self.token_source.is_some())
            .finish_non_exhaustive()
    }
}

impl RealtimeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Sent as the `device_id` query parameter. Empty means not sent.
    pub fn with_device_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.device_id = if id.is_empty() { None } else { Some(id) };
        self
    }

    pub fn with_token_source(mut self, ts: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(ts);
        self
    }

    pub fn without_token_source(mut self) -> Self {
        self.token_source = None;
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Feed URI and handshake options for `monitor_id`. Fetches a token when a source is set.
    pub async fn build_request(&self, monitor_id: i64) -> Result<(Url, DialOptions), StreamError> {
        let mut base = Url::parse(&self.base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let mut url = base.join(&format!("monitors/{}/realtimefeed", monitor_id))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("client_type", "web");
            q.append_pair("ui_language", "en-US");
            if let Some(id) = &self.device_id {
                q.append_pair("device_id", id);
            }
        }
        if let Some(ts) = &self.token_source {
            let token = ts.token().await.map_err(StreamError::Token)?;
            url.query_pairs_mut()
                .append_pair("access_token", &token.access_token);
        }
        let opts = DialOptions::default().header("Origin", self.origin.clone());
        Ok((url, opts))
    }

    /// Stream messages for `monitor_id` to `handler` until it stops or fails, the feed ends,
    /// or `cancel` fires. Cancellation and a handler stop both return `Ok(())`.
    pub async fn stream<H: Handler>(
        &self,
        monitor_id: i64,
        cancel: &CancellationToken,
        handler: H,
    ) -> Result<(), StreamError> {
        let (url, opts) = self.build_request(monitor_id).await?;
        let shown = redact(&url);
        log::debug!("realtime: dialing {}", shown);

        let dialed = tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("realtime: cancelled while dialing {}", shown);
                return Ok(());
            }
            r = self.dialer.dial(url.as_str(), &opts) => r,
        };
        let (conn, handshake) = dialed.map_err(|source| StreamError::Dial {
            uri: shown.clone(),
            source,
        })?;
        log::debug!("realtime: connected (status {})", handshake.status);

        let result = session::run(conn, Decoder::new(), cancel, handler).await;
        match &result {
            Ok(()) => log::info!("realtime: session for monitor {} ended", monitor_id),
            Err(e) => log::info!("realtime: session for monitor {} failed: {:?}", monitor_id, e),
        }
        result.map_err(StreamError::from)
    }
}

/// URI with the access token hidden, for logs and errors.
fn redact(url: &Url) -> String {
    if !url.query_pairs().any(|(k, _)| k == "access_token") {
        return url.to_string();
    }
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "access_token" {
                "REDACTED".to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), v)
        })
        .collect();
    let mut shown = url.clone();
    shown.query_pairs_mut().clear().extend_pairs(pairs);
    shown.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticTokenSource, Token};
    use crate::realtime::conn::CloseCode;
    use crate::realtime::testing::{scripted, ScriptedDialer};
    use crate::realtime::{Flow, Message};
    use async_trait::async_trait;

    fn client(dialer: &ScriptedDialer) -> RealtimeClient {
        RealtimeClient::new()
            .with_base_url("wss://clientrt.example.test/path/")
            .with_dialer(Arc::new(dialer.clone()))
    }

    #[tokio::test]
    async fn stops_after_third_update() {
        let (dialer, script) = scripted();
        script.text(r#"{"type":"hello","payload":{"online":true}}"#);
        for w in [590.4, 591.4, 592.4, 593.4] {
            script.json(&serde_json::json!({"type": "realtime_update", "payload": {"w": w}}));
        }
        let mut seen = Vec::new();
        let res = client(&dialer)
            .stream(123, &CancellationToken::new(), |_: &CancellationToken, m: Message| {
                if let Message::RealtimeUpdate(rt) = m {
                    seen.push(rt.w);
                    if seen.len() == 3 {
                        return Flow::Stop;
                    }
                }
                Flow::Continue
            })
            .await;
        assert!(res.is_ok());
        assert_eq!(seen, vec![590.4, 591.4, 592.4]);
        let dialed = dialer.dialed();
        assert_eq!(dialed.len(), 1);
        assert!(dialed[0].contains("/monitors/123/realtimefeed"));
        assert_eq!(dialer.closes()[0].0, CloseCode::Normal);
    }

    #[tokio::test]
    async fn uri_and_origin() {
        let (dialer, script) = scripted();
        drop(script);
        client(&dialer)
            .stream(123, &CancellationToken::new(), |_: &CancellationToken, _: Message| {
                Flow::Continue
            })
            .await
            .unwrap();
        assert_eq!(
            dialer.dialed(),
            vec!["wss://clientrt.example.test/path/monitors/123/realtimefeed?client_type=web&ui_language=en-US".to_string()]
        );
        assert_eq!(
            dialer.options()[0].headers,
            vec![("Origin".to_string(), DEFAULT_ORIGIN.to_string())]
        );
    }

    #[tokio::test]
    async fn base_without_trailing_slash_keeps_its_path() {
        let (url, _) = RealtimeClient::new()
            .with_base_url("wss://clientrt.example.test/path")
            .build_request(5)
            .await
            .unwrap();
        assert_eq!(url.path(), "/path/monitors/5/realtimefeed");
    }

    #[tokio::test]
    async fn device_id_and_token_in_query() {
        let (dialer, script) = scripted();
        drop(script);
        let token = Token {
            access_token: "t1.v2.secret".into(),
            ..Token::default()
        };
        client(&dialer)
            .with_device_id("dev-1")
            .with_token_source(Arc::new(StaticTokenSource::new(token)))
            .stream(7, &CancellationToken::new(), |_: &CancellationToken, _: Message| {
                Flow::Continue
            })
            .await
            .unwrap();
        let uri = &dialer.dialed()[0];
        assert!(uri.ends_with(
            "?client_type=web&ui_language=en-US&device_id=dev-1&access_token=t1.v2.secret"
        ));
    }

    #[tokio::test]
    async fn empty_device_id_is_omitted() {
        let (url, _) = RealtimeClient::new()
            .with_device_id("")
            .build_request(1)
            .await
            .unwrap();
        assert!(!url.as_str().contains("device_id"));
    }

    struct Broken;

    #[async_trait]
    impl TokenSource for Broken {
        async fn token(&self) -> Result<Token, AuthError> {
            Err(AuthError::NotRenewable)
        }
    }

    #[tokio::test]
    async fn token_failure_prevents_dial() {
        let (dialer, _script) = scripted();
        let err = client(&dialer)
            .with_token_source(Arc::new(Broken))
            .stream(1, &CancellationToken::new(), |_: &CancellationToken, _: Message| {
                Flow::Continue
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Token(_)));
        assert!(dialer.dialed().is_empty());
    }

    #[tokio::test]
    async fn dial_failure_is_wrapped_and_token_redacted() {
        let dialer = ScriptedDialer::failing("connection refused");
        let token = Token {
            access_token: "secret".into(),
            ..Token::default()
        };
        let mut called = false;
        let err = client(&dialer)
            .with_token_source(Arc::new(StaticTokenSource::new(token)))
            .stream(1, &CancellationToken::new(), |_: &CancellationToken, _: Message| {
                called = true;
                Flow::Continue
            })
            .await
            .unwrap_err();
        assert!(!called);
        match err {
            StreamError::Dial { uri, source } => {
                assert!(uri.contains("access_token=REDACTED"));
                assert!(!uri.contains("secret"));
                assert_eq!(source.to_string(), "connection refused");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn handler_error_is_returned_verbatim() {
        #[derive(Debug, thiserror::Error)]
        #[error("disk full")]
        struct DiskFull;

        let (dialer, script) = scripted();
        script.text(r#"{"type":"hello"}"#);
        let err = client(&dialer)
            .stream(1, &CancellationToken::new(), |_: &CancellationToken, _: Message| {
                Flow::fail(DiskFull)
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert!(err.handler_error().and_then(|e| e.downcast_ref::<DiskFull>()).is_some());
        assert_eq!(dialer.closes()[0].0, CloseCode::InternalError);
    }

    #[tokio::test]
    async fn cancelled_mid_stream() {
        let (dialer, script) = scripted();
        script.text(r#"{"type":"hello"}"#);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut hellos = 0;
        let res = client(&dialer)
            .stream(1, &cancel, |_: &CancellationToken, _: Message| {
                hellos += 1;
                let trigger = trigger.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    trigger.cancel();
                });
                Flow::Continue
            })
            .await;
        assert!(res.is_ok());
        assert_eq!(hellos, 1);
        assert_eq!(dialer.closes(), vec![(CloseCode::Normal, String::new())]);
    }

    #[test]
    fn redact_only_touches_token() {
        let url = Url::parse("wss://h/monitors/1/realtimefeed?client_type=web&access_token=abc").unwrap();
        assert_eq!(
            redact(&url),
            "wss://h/monitors/1/realtimefeed?client_type=web&access_token=REDACTED"
        );
        let plain = Url::parse("wss://h/x?client_type=web").unwrap();
        assert_eq!(redact(&plain), "wss://h/x?client_type=web");
    }
}
