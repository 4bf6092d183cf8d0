//! Chat connection acceptance tests against an in-process WebSocket server:
//! token embedding, ping/pong, ordered delivery, reconnect with backoff,
//! clean-disconnect finality, and auth-push termination.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use agora_sdk::credentials::{CredentialStore, TokenPair};
use agora_sdk::{ChatConnection, ConnectionState, Error, Identity, StreamConfig, StreamEvent};

const EVENT_WAIT: Duration = Duration::from_secs(5);

type ServerWs = WebSocketStream<TcpStream>;

struct MockChatServer {
    listener: TcpListener,
    port: u16,
}

impl MockChatServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/api/chat/ws", self.port)
    }

    /// Accept one connection; returns the socket and the request URI
    /// (path + query) the client connected with.
    async fn accept(&self) -> (ServerWs, String) {
        let (tcp, _) = self.listener.accept().await.unwrap();
        let uri: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&uri);
        let ws = tokio_tungstenite::accept_hdr_async(
            tcp,
            move |req: &Request, resp: Response| {
                *seen.lock().unwrap() = Some(req.uri().to_string());
                Ok(resp)
            },
        )
        .await
        .unwrap();
        let uri = uri.lock().unwrap().take().unwrap_or_default();
        (ws, uri)
    }
}

fn store_with(access: &str, refresh: &str) -> Arc<CredentialStore> {
    let store = Arc::new(CredentialStore::in_memory());
    store.set(TokenPair {
        access_token: access.to_string(),
        refresh_token: refresh.to_string(),
    });
    store
}

fn fast_config(url: String) -> StreamConfig {
    StreamConfig {
        url,
        max_reconnect_attempts: 2,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(2),
        identity: None,
    }
}

async fn next_event(rx: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
    timeout(EVENT_WAIT, rx.recv())
        .await
        .expect("timed out waiting for stream event")
        .expect("event channel closed")
}

async fn server_recv_text(ws: &mut ServerWs) -> String {
    loop {
        let frame = timeout(EVENT_WAIT, ws.next())
            .await
            .expect("timed out waiting for client frame")
            .expect("server socket closed")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return text;
        }
    }
}

#[tokio::test]
async fn connect_carries_the_token_as_a_query_parameter() {
    let server = MockChatServer::start().await;
    let store = store_with("A1", "R1");
    let conn = ChatConnection::new(fast_config(server.url()), store);
    let mut events = conn.connect().unwrap();

    let (_ws, uri) = server.accept().await;
    assert!(uri.contains("token=A1"), "uri was {uri}");

    assert!(matches!(next_event(&mut events).await, StreamEvent::Open));
    assert_eq!(conn.state(), ConnectionState::Open);
    conn.disconnect();
}

#[tokio::test]
async fn anonymous_connect_omits_the_token() {
    let server = MockChatServer::start().await;
    let store = Arc::new(CredentialStore::in_memory());
    let conn = ChatConnection::new(fast_config(server.url()), store);
    let mut events = conn.connect().unwrap();

    let (_ws, uri) = server.accept().await;
    assert!(!uri.contains("token="), "uri was {uri}");
    assert!(matches!(next_event(&mut events).await, StreamEvent::Open));
    conn.disconnect();
}

#[tokio::test]
async fn messages_are_delivered_in_transport_order() {
    let server = MockChatServer::start().await;
    let conn = ChatConnection::new(fast_config(server.url()), store_with("A1", "R1"));
    let mut events = conn.connect().unwrap();

    let (mut ws, _) = server.accept().await;
    assert!(matches!(next_event(&mut events).await, StreamEvent::Open));

    for (id, content) in [("m1", "first"), ("m2", "second"), ("m3", "third")] {
        let body = json!({
            "id": id,
            "content": content,
            "user_id": 7,
            "username": "bob",
            "created_at": "2024-05-01T12:00:00Z"
        });
        ws.send(WsMessage::Text(body.to_string())).await.unwrap();
    }

    for expected in ["first", "second", "third"] {
        match next_event(&mut events).await {
            StreamEvent::Message(msg) => assert_eq!(msg.content, expected),
            other => panic!("expected message, got {other:?}"),
        }
    }
    conn.disconnect();
}

#[tokio::test]
async fn liveness_probe_is_answered_with_pong() {
    let server = MockChatServer::start().await;
    let conn = ChatConnection::new(fast_config(server.url()), store_with("A1", "R1"));
    let mut events = conn.connect().unwrap();

    let (mut ws, _) = server.accept().await;
    assert!(matches!(next_event(&mut events).await, StreamEvent::Open));

    ws.send(WsMessage::Text(json!({"type": "ping"}).to_string()))
        .await
        .unwrap();

    let reply = server_recv_text(&mut ws).await;
    let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(value["type"], "pong");
    conn.disconnect();
}

#[tokio::test]
async fn malformed_payloads_are_dropped_without_killing_the_connection() {
    let server = MockChatServer::start().await;
    let conn = ChatConnection::new(fast_config(server.url()), store_with("A1", "R1"));
    let mut events = conn.connect().unwrap();

    let (mut ws, _) = server.accept().await;
    assert!(matches!(next_event(&mut events).await, StreamEvent::Open));

    ws.send(WsMessage::Text("{not json".to_string())).await.unwrap();
    ws.send(WsMessage::Text(json!({"content": "still here"}).to_string()))
        .await
        .unwrap();

    match next_event(&mut events).await {
        StreamEvent::Message(msg) => assert_eq!(msg.content, "still here"),
        other => panic!("expected message, got {other:?}"),
    }
    conn.disconnect();
}

#[tokio::test]
async fn outbound_messages_carry_identity_and_temp_id() {
    let server = MockChatServer::start().await;
    let mut config = fast_config(server.url());
    config.identity = Some(Identity {
        user_id: 42,
        username: "alice".to_string(),
    });
    let conn = ChatConnection::new(config, store_with("A1", "R1"));
    let mut events = conn.connect().unwrap();

    let (mut ws, _) = server.accept().await;
    assert!(matches!(next_event(&mut events).await, StreamEvent::Open));

    conn.send("hello there", "tmp-7").await.unwrap();

    let wire = server_recv_text(&mut ws).await;
    let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
    assert_eq!(value["type"], "message");
    assert_eq!(value["content"], "hello there");
    assert_eq!(value["tempId"], "tmp-7");
    assert_eq!(value["user_id"], 42);
    assert_eq!(value["username"], "alice");
    assert!(value["timestamp"].is_string());
    conn.disconnect();
}

#[tokio::test]
async fn send_while_not_open_signals_not_connected() {
    let server = MockChatServer::start().await;
    let conn = ChatConnection::new(fast_config(server.url()), store_with("A1", "R1"));

    // Never connected.
    assert!(matches!(
        conn.send("hi", "tmp-1").await.unwrap_err(),
        Error::NotConnected
    ));
}

#[tokio::test]
async fn duplicate_connect_is_a_no_op() {
    let server = MockChatServer::start().await;
    let conn = ChatConnection::new(fast_config(server.url()), store_with("A1", "R1"));
    let mut events = conn.connect().unwrap();

    let (_ws, _) = server.accept().await;
    assert!(matches!(next_event(&mut events).await, StreamEvent::Open));

    assert!(conn.connect().is_none());
    conn.disconnect();
}

/// Property: the server pushing an auth error terminates the connection for
/// good: credentials cleared, one notification, zero reconnect attempts.
#[tokio::test]
async fn auth_push_clears_credentials_and_never_reconnects() {
    let server = MockChatServer::start().await;
    let store = store_with("A1", "R1");
    let conn = ChatConnection::new(fast_config(server.url()), Arc::clone(&store));
    let mut events = conn.connect().unwrap();

    let (mut ws, _) = server.accept().await;
    assert!(matches!(next_event(&mut events).await, StreamEvent::Open));

    ws.send(WsMessage::Text(
        json!({"type": "auth_error", "message": "token revoked"}).to_string(),
    ))
    .await
    .unwrap();

    match next_event(&mut events).await {
        StreamEvent::SessionExpired { reason } => assert_eq!(reason, "token revoked"),
        other => panic!("expected session expiry, got {other:?}"),
    }
    assert!(store.get().is_none());
    assert_eq!(conn.state(), ConnectionState::Closed);

    // The event channel closes with no further events, and no reconnect
    // reaches the server.
    assert!(timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("channel should close, not hang")
        .is_none());
    let no_reconnect = timeout(Duration::from_millis(500), server.listener.accept()).await;
    assert!(no_reconnect.is_err());
}

/// Property: unclean drops are retried with non-decreasing delays, and the
/// connection gives up permanently once the attempt ceiling is reached.
#[tokio::test]
async fn unclean_close_backs_off_then_gives_up() {
    let server = MockChatServer::start().await;
    let conn = ChatConnection::new(fast_config(server.url()), store_with("A1", "R1"));
    let mut events = conn.connect().unwrap();

    let (ws, _) = server.accept().await;
    assert!(matches!(next_event(&mut events).await, StreamEvent::Open));

    // Kill the socket without a close handshake, then refuse all further
    // connections by dropping the listener.
    drop(ws);
    drop(server);

    let mut delays = Vec::new();
    loop {
        match next_event(&mut events).await {
            StreamEvent::Reconnecting { attempt, delay } => {
                assert_eq!(attempt as usize, delays.len() + 1);
                delays.push(delay);
            }
            StreamEvent::Closed { reason } => {
                let reason = reason.unwrap_or_default();
                assert!(reason.contains("gave up"), "reason was {reason}");
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert_eq!(delays.len(), 2);
    assert!(delays[1] >= delays[0]);
    assert_eq!(conn.state(), ConnectionState::Closed);
}

/// Property: a successful reopen resets the attempt counter.
#[tokio::test]
async fn reconnect_counter_resets_after_a_successful_open() {
    let server = MockChatServer::start().await;
    let conn = ChatConnection::new(fast_config(server.url()), store_with("A1", "R1"));
    let mut events = conn.connect().unwrap();

    let (ws, _) = server.accept().await;
    assert!(matches!(next_event(&mut events).await, StreamEvent::Open));
    drop(ws);

    match next_event(&mut events).await {
        StreamEvent::Reconnecting { attempt: 1, .. } => {}
        other => panic!("expected first reconnect, got {other:?}"),
    }

    let (ws, _) = server.accept().await;
    assert!(matches!(next_event(&mut events).await, StreamEvent::Open));
    drop(ws);

    // The counter starts over after the successful open.
    match next_event(&mut events).await {
        StreamEvent::Reconnecting { attempt: 1, .. } => {}
        other => panic!("expected counter reset, got {other:?}"),
    }
    conn.disconnect();
}

/// Property: disconnect during the backoff wait cancels the pending
/// reconnect; nothing is resurrected afterwards.
#[tokio::test]
async fn disconnect_cancels_a_pending_reconnect() {
    let server = MockChatServer::start().await;
    let mut config = fast_config(server.url());
    config.initial_backoff = Duration::from_secs(30);
    config.max_backoff = Duration::from_secs(30);
    let conn = ChatConnection::new(config, store_with("A1", "R1"));
    let mut events = conn.connect().unwrap();

    let (ws, _) = server.accept().await;
    assert!(matches!(next_event(&mut events).await, StreamEvent::Open));
    drop(ws);

    match next_event(&mut events).await {
        StreamEvent::Reconnecting { .. } => {}
        other => panic!("expected reconnect scheduling, got {other:?}"),
    }

    conn.disconnect();

    match next_event(&mut events).await {
        StreamEvent::Closed { .. } => {}
        other => panic!("expected closed, got {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Closed);

    let no_reconnect = timeout(Duration::from_millis(500), server.listener.accept()).await;
    assert!(no_reconnect.is_err());
}

/// A normal close frame from the server is a clean termination: terminal,
/// no reconnect.
#[tokio::test]
async fn server_side_normal_close_is_terminal() {
    let server = MockChatServer::start().await;
    let conn = ChatConnection::new(fast_config(server.url()), store_with("A1", "R1"));
    let mut events = conn.connect().unwrap();

    let (mut ws, _) = server.accept().await;
    assert!(matches!(next_event(&mut events).await, StreamEvent::Open));

    ws.close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "shutting down".into(),
    }))
    .await
    .unwrap();

    match next_event(&mut events).await {
        StreamEvent::Closed { reason } => {
            assert_eq!(reason.as_deref(), Some("shutting down"));
        }
        other => panic!("expected clean close, got {other:?}"),
    }

    let no_reconnect = timeout(Duration::from_millis(500), server.listener.accept()).await;
    assert!(no_reconnect.is_err());
}

/// After a terminal close, the manager accepts a fresh connect.
#[tokio::test]
async fn connect_works_again_after_a_terminal_close() {
    let server = MockChatServer::start().await;
    let conn = ChatConnection::new(fast_config(server.url()), store_with("A1", "R1"));
    let mut events = conn.connect().unwrap();

    let (_ws, _) = server.accept().await;
    assert!(matches!(next_event(&mut events).await, StreamEvent::Open));

    conn.disconnect();
    loop {
        match next_event(&mut events).await {
            StreamEvent::Closed { .. } => break,
            _ => {}
        }
    }

    let mut events = conn.connect().expect("reconnect after terminal close");
    let (_ws, _) = server.accept().await;
    assert!(matches!(next_event(&mut events).await, StreamEvent::Open));
    conn.disconnect();
}
