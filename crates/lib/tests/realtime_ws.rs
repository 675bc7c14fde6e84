//! Integration test: run a local WebSocket feed on a free port and stream it with the real dialer.
//! Each test starts its own server; the server task is left running when the test ends.

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use sense::realtime::{
    CloseCode, Connection, DialOptions, Dialer, RealtimeClient, StreamError, TransportError,
    WsDialer,
};
use sense::{Flow, Message};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How the server ends a connection after sending its frames.
#[derive(Clone, Copy)]
enum Ending {
    /// Keep reading until the client closes.
    WaitForClose,
    /// Close from the server side with this code.
    CloseWith(u16),
}

#[derive(Default)]
struct Seen {
    monitor: Option<i64>,
    query: HashMap<String, String>,
    origin: Option<String>,
    close_code: Option<u16>,
}

struct Feed {
    frames: Vec<String>,
    ending: Ending,
    seen: Mutex<Seen>,
}

async fn feed_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<i64>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(feed): State<Arc<Feed>>,
) -> Response {
    {
        let mut seen = feed.seen.lock().unwrap();
        seen.monitor = Some(id);
        seen.query = query;
        seen.origin = headers
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }
    ws.on_upgrade(move |socket| serve(socket, feed))
}

async fn serve(mut socket: WebSocket, feed: Arc<Feed>) {
    for frame in &feed.frames {
        if socket.send(WsMessage::Text(frame.clone())).await.is_err() {
            return;
        }
    }
    if let Ending::CloseWith(code) = feed.ending {
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code,
                reason: "server says bye".into(),
            })))
            .await;
    }
    while let Some(Ok(msg)) = socket.recv().await {
        if let WsMessage::Close(frame) = msg {
            feed.seen.lock().unwrap().close_code = frame.map(|f| f.code);
            break;
        }
    }
}

async fn start(frames: Vec<String>, ending: Ending) -> (String, Arc<Feed>) {
    let feed = Arc::new(Feed {
        frames,
        ending,
        seen: Mutex::new(Seen::default()),
    });
    let app = Router::new()
        .route("/feed/monitors/:id/realtimefeed", get(feed_handler))
        .with_state(Arc::clone(&feed));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind free port");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("ws://{}/feed/", addr), feed)
}

fn update(w: f64) -> String {
    serde_json::json!({"type": "realtime_update", "payload": {"w": w, "hz": 60.0}}).to_string()
}

async fn wait_for_close_code(feed: &Feed) -> Option<u16> {
    for _ in 0..100 {
        if let Some(code) = feed.seen.lock().unwrap().close_code {
            return Some(code);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

#[tokio::test]
async fn handler_stop_closes_normally() {
    let frames = vec![
        r#"{"type":"hello","payload":{"online":true}}"#.to_string(),
        update(590.4),
        update(591.4),
        update(592.4),
        update(593.4),
    ];
    let (base, feed) = start(frames, Ending::WaitForClose).await;
    let client = RealtimeClient::new()
        .with_base_url(base)
        .with_device_id("dev-xyz");

    let mut seen = Vec::new();
    client
        .stream(42, &CancellationToken::new(), |_: &CancellationToken, m: Message| {
            if let Message::RealtimeUpdate(rt) = m {
                seen.push(rt.w);
                if seen.len() == 3 {
                    return Flow::Stop;
                }
            }
            Flow::Continue
        })
        .await
        .expect("stream");

    assert_eq!(seen, vec![590.4, 591.4, 592.4]);
    assert_eq!(wait_for_close_code(&feed).await, Some(1000));

    let recorded = feed.seen.lock().unwrap();
    assert_eq!(recorded.monitor, Some(42));
    assert_eq!(recorded.query.get("client_type").map(String::as_str), Some("web"));
    assert_eq!(recorded.query.get("ui_language").map(String::as_str), Some("en-US"));
    assert_eq!(recorded.query.get("device_id").map(String::as_str), Some("dev-xyz"));
    assert!(!recorded.query.contains_key("access_token"));
    assert_eq!(recorded.origin.as_deref(), Some("https://home.sense.com"));
}

#[tokio::test]
async fn handler_failure_closes_with_internal_error() {
    let (base, feed) = start(vec![update(1.0)], Ending::WaitForClose).await;
    let err = RealtimeClient::new()
        .with_base_url(base)
        .stream(1, &CancellationToken::new(), |_: &CancellationToken, _: Message| {
            Flow::fail(anyhow::anyhow!("cannot keep up"))
        })
        .await
        .expect_err("handler failure");
    assert_eq!(err.to_string(), "cannot keep up");
    assert!(err.handler_error().is_some());
    assert_eq!(wait_for_close_code(&feed).await, Some(1011));
}

#[tokio::test]
async fn server_normal_close_ends_stream() {
    let (base, _feed) = start(vec![update(1.0), update(2.0)], Ending::CloseWith(1000)).await;
    let mut seen = 0;
    RealtimeClient::new()
        .with_base_url(base)
        .stream(1, &CancellationToken::new(), |_: &CancellationToken, _: Message| {
            seen += 1;
            Flow::Continue
        })
        .await
        .expect("normal close is not an error");
    assert_eq!(seen, 2);
}

#[tokio::test]
async fn server_error_close_is_reported() {
    let (base, _feed) = start(vec![update(1.0)], Ending::CloseWith(1008)).await;
    let err = RealtimeClient::new()
        .with_base_url(base)
        .stream(1, &CancellationToken::new(), |_: &CancellationToken, _: Message| {
            Flow::Continue
        })
        .await
        .expect_err("policy close");
    match err {
        StreamError::Transport(TransportError::PeerClosed { code, reason }) => {
            assert_eq!(code, 1008);
            assert_eq!(reason, "server says bye");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn cancellation_closes_normally() {
    let (base, feed) = start(vec![update(1.0)], Ending::WaitForClose).await;
    let cancel = CancellationToken::new();
    let mut seen = 0;
    let trigger = cancel.clone();
    RealtimeClient::new()
        .with_base_url(base)
        .stream(1, &cancel, |_: &CancellationToken, _: Message| {
            seen += 1;
            trigger.cancel();
            Flow::Continue
        })
        .await
        .expect("cancellation is not an error");
    assert_eq!(seen, 1);
    assert_eq!(wait_for_close_code(&feed).await, Some(1000));
}

#[tokio::test]
async fn dial_failure_is_wrapped() {
    // Bind then drop to get a port nobody listens on.
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        l.local_addr().expect("local_addr").port()
    };
    let err = RealtimeClient::new()
        .with_base_url(format!("ws://127.0.0.1:{}/", port))
        .stream(1, &CancellationToken::new(), |_: &CancellationToken, _: Message| {
            Flow::Continue
        })
        .await
        .expect_err("nothing listening");
    match err {
        StreamError::Dial { uri, .. } => assert!(uri.contains("/monitors/1/realtimefeed")),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn closing_twice_is_harmless() {
    let (base, feed) = start(Vec::new(), Ending::WaitForClose).await;
    let uri = format!("{}monitors/5/realtimefeed", base);
    let (conn, handshake) = WsDialer
        .dial(&uri, &DialOptions::default())
        .await
        .expect("dial");
    assert_eq!(handshake.status, 101);
    conn.close(CloseCode::Normal, "").await.expect("first close");
    conn.close(CloseCode::InternalError, "again")
        .await
        .expect("second close");
    assert_eq!(wait_for_close_code(&feed).await, Some(1000));
}
