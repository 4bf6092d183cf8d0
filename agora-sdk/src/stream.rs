//! Resilient WebSocket chat connection.
//!
//! Owns a single logical connection to the chat service and keeps it alive
//! across network drops: unclean closes are retried with bounded exponential
//! backoff, carrying the current access token on every attempt, while the
//! consumer sees a stable send/receive contract and a read-only state watch.
//!
//! Authentication failures pushed by the server are never retried: they
//! mean the credential, not the network, is the problem. The connection
//! closes, the stored credentials are cleared, and the consumer is told to
//! re-authenticate.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::credentials::CredentialStore;
use crate::error::Error;
use crate::event::StreamEvent;
use crate::types::ChatMessage;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Configuration for a chat connection.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:8083/api/chat/ws`.
    pub url: String,
    /// Reconnect attempts before giving up permanently.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt; doubles per attempt.
    pub initial_backoff: Duration,
    /// Ceiling for the backoff delay.
    pub max_backoff: Duration,
    /// Timeout for a single connect attempt.
    pub connect_timeout: Duration,
    /// Identity stamped onto outbound messages.
    pub identity: Option<Identity>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8083/api/chat/ws".to_string(),
            max_reconnect_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            identity: None,
        }
    }
}

/// Who outbound messages are sent as.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
}

/// Connection lifecycle, exported read-only through [`ChatConnection::watch_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// An outbound chat message queued by the consumer.
#[derive(Debug)]
struct Outbound {
    content: String,
    temp_id: String,
}

struct Active {
    cmd_tx: mpsc::Sender<Outbound>,
    close_tx: Option<oneshot::Sender<()>>,
}

/// Manager for one logical chat connection.
///
/// Create one per composition root and share it by reference; the manager is
/// the exclusive owner of the underlying socket. Multiple independent
/// instances are fine (and what the tests do).
pub struct ChatConnection {
    config: StreamConfig,
    store: Arc<CredentialStore>,
    state_tx: watch::Sender<ConnectionState>,
    inner: parking_lot::Mutex<Option<Active>>,
}

impl ChatConnection {
    pub fn new(config: StreamConfig, store: Arc<CredentialStore>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            config,
            store,
            state_tx,
            inner: parking_lot::Mutex::new(None),
        }
    }

    /// Start the connection and return the event receiver.
    ///
    /// Returns `None` without touching the socket when a connection is
    /// already connecting, open, or closing; duplicate sockets are never
    /// created. After a terminal close, `connect` may be called again for a
    /// fresh connection.
    pub fn connect(&self) -> Option<mpsc::Receiver<StreamEvent>> {
        let mut inner = self.inner.lock();
        if matches!(
            *self.state_tx.borrow(),
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Closing
        ) {
            tracing::debug!("connect ignored, connection already active");
            return None;
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();

        *inner = Some(Active {
            cmd_tx,
            close_tx: Some(close_tx),
        });
        // Claim the connection before the task runs, so a connect racing
        // this one sees it and backs off.
        self.state_tx.send_replace(ConnectionState::Connecting);

        tokio::spawn(run_loop(
            self.config.clone(),
            Arc::clone(&self.store),
            self.state_tx.clone(),
            event_tx,
            cmd_rx,
            close_rx,
        ));

        Some(event_rx)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watchable lifecycle state for UIs that render a status indicator.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Queue a message for transmission. `temp_id` is echoed back by the
    /// server so the caller can reconcile its optimistic copy.
    ///
    /// Fails with [`Error::NotConnected`] while the connection is anything
    /// other than open; a transient condition, not a crash.
    pub async fn send(&self, content: &str, temp_id: &str) -> Result<(), Error> {
        if self.state() != ConnectionState::Open {
            return Err(Error::NotConnected);
        }
        let cmd_tx = self.inner.lock().as_ref().map(|a| a.cmd_tx.clone());
        let Some(cmd_tx) = cmd_tx else {
            return Err(Error::NotConnected);
        };
        cmd_tx
            .send(Outbound {
                content: content.to_string(),
                temp_id: temp_id.to_string(),
            })
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Explicit clean termination. Suppresses further reconnect attempts,
    /// including one already scheduled and waiting out its backoff delay.
    pub fn disconnect(&self) {
        let close_tx = self.inner.lock().as_mut().and_then(|a| a.close_tx.take());
        if let Some(tx) = close_tx {
            if matches!(
                *self.state_tx.borrow(),
                ConnectionState::Connecting | ConnectionState::Open
            ) {
                self.state_tx.send_replace(ConnectionState::Closing);
            }
            let _ = tx.send(());
        }
    }
}

/// How a single established session ended.
enum SessionEnd {
    /// Normal closure or explicit disconnect; terminal.
    Clean(Option<String>),
    /// The server pushed an authentication failure; terminal, no retry.
    AuthRejected(String),
    /// Network-level drop; retried with backoff.
    Dropped(String),
}

async fn run_loop(
    config: StreamConfig,
    store: Arc<CredentialStore>,
    state: watch::Sender<ConnectionState>,
    event_tx: mpsc::Sender<StreamEvent>,
    mut cmd_rx: mpsc::Receiver<Outbound>,
    mut close_rx: oneshot::Receiver<()>,
) {
    let mut attempts: u32 = 0;

    loop {
        state.send_replace(ConnectionState::Connecting);

        let url = match connect_url(&config.url, store.access_token().as_deref()) {
            Ok(url) => url,
            Err(e) => {
                state.send_replace(ConnectionState::Closed);
                let _ = event_tx
                    .send(StreamEvent::Closed {
                        reason: Some(format!("invalid url: {e}")),
                    })
                    .await;
                return;
            }
        };

        let connecting = tokio::time::timeout(config.connect_timeout, connect_async(url.as_str()));
        let result = tokio::select! {
            biased;
            _ = &mut close_rx => {
                finish_clean(&state, &event_tx).await;
                return;
            }
            r = connecting => r,
        };

        match result {
            Ok(Ok((ws, _response))) => {
                attempts = 0;
                state.send_replace(ConnectionState::Open);
                let _ = event_tx.send(StreamEvent::Open).await;
                tracing::debug!(url = %config.url, "chat connection open");

                match run_session(ws, &config, &event_tx, &mut cmd_rx, &mut close_rx).await {
                    SessionEnd::Clean(reason) => {
                        state.send_replace(ConnectionState::Closed);
                        let _ = event_tx.send(StreamEvent::Closed { reason }).await;
                        return;
                    }
                    SessionEnd::AuthRejected(reason) => {
                        tracing::warn!(reason = %reason, "server rejected credential, closing for good");
                        store.clear();
                        state.send_replace(ConnectionState::Closed);
                        let _ = event_tx.send(StreamEvent::SessionExpired { reason }).await;
                        return;
                    }
                    SessionEnd::Dropped(reason) => {
                        tracing::warn!(reason = %reason, "chat connection dropped");
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "chat connect failed");
            }
            Err(_) => {
                tracing::warn!("chat connect timed out");
            }
        }

        // Unclean end: back off and retry, or give up.
        attempts += 1;
        if attempts > config.max_reconnect_attempts {
            state.send_replace(ConnectionState::Closed);
            let _ = event_tx
                .send(StreamEvent::Closed {
                    reason: Some(format!(
                        "gave up after {} reconnect attempts",
                        config.max_reconnect_attempts
                    )),
                })
                .await;
            return;
        }

        let delay = backoff_delay(&config, attempts);
        tracing::info!(attempt = attempts, delay_ms = delay.as_millis() as u64, "reconnecting");
        let _ = event_tx
            .send(StreamEvent::Reconnecting {
                attempt: attempts,
                delay,
            })
            .await;

        // The backoff sleep races the close signal, so an explicit
        // disconnect cancels a pending reconnect deterministically.
        tokio::select! {
            biased;
            _ = &mut close_rx => {
                finish_clean(&state, &event_tx).await;
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_session(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    config: &StreamConfig,
    event_tx: &mpsc::Sender<StreamEvent>,
    cmd_rx: &mut mpsc::Receiver<Outbound>,
    close_rx: &mut oneshot::Receiver<()>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            biased;
            _ = &mut *close_rx => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return SessionEnd::Clean(None);
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Some(end) = handle_inbound(&text, &mut sink, event_tx).await {
                        return end;
                    }
                }
                Some(Ok(WsMessage::Ping(_))) => {
                    // Pong is handled automatically by tungstenite.
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    return close_disposition(frame);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return SessionEnd::Dropped(format!("websocket error: {e}"));
                }
                None => {
                    return SessionEnd::Dropped("stream ended".to_string());
                }
            },
            Some(out) = cmd_rx.recv() => {
                let payload = outbound_payload(&out, config.identity.as_ref());
                if let Err(e) = sink.send(WsMessage::Text(payload)).await {
                    return SessionEnd::Dropped(format!("send failed: {e}"));
                }
            },
        }
    }
}

/// Process one inbound text frame. Returns `Some` when the session must end.
async fn handle_inbound<S>(
    text: &str,
    sink: &mut S,
    event_tx: &mpsc::Sender<StreamEvent>,
) -> Option<SessionEnd>
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "malformed stream payload, dropping");
            return None;
        }
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("auth_error") | Some("AUTH_ERROR") => {
            let reason = value
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("authentication rejected")
                .to_string();
            Some(SessionEnd::AuthRejected(reason))
        }
        Some("ping") => {
            let pong = r#"{"type":"pong"}"#.to_string();
            if let Err(e) = sink.send(WsMessage::Text(pong)).await {
                return Some(SessionEnd::Dropped(format!("pong failed: {e}")));
            }
            None
        }
        Some("auth_success") | Some("anon_info") => {
            tracing::debug!("chat handshake notice received");
            None
        }
        _ => match serde_json::from_value::<ChatMessage>(value) {
            Ok(msg) => {
                if event_tx.send(StreamEvent::Message(msg)).await.is_err() {
                    return Some(SessionEnd::Clean(Some("consumer dropped".to_string())));
                }
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "unrecognized stream payload, dropping");
                None
            }
        },
    }
}

/// Wire shape for outbound messages: the caller's `{type, content, tempId}`
/// plus the connection-layer stamp.
#[derive(Serialize)]
struct WirePayload<'a> {
    r#type: &'static str,
    content: &'a str,
    #[serde(rename = "tempId")]
    temp_id: &'a str,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
}

fn outbound_payload(out: &Outbound, identity: Option<&Identity>) -> String {
    let payload = WirePayload {
        r#type: "message",
        content: &out.content,
        temp_id: &out.temp_id,
        timestamp: chrono::Utc::now().to_rfc3339(),
        user_id: identity.map(|i| i.user_id),
        username: identity.map(|i| i.username.as_str()),
    };
    serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string())
}

fn connect_url(base: &str, token: Option<&str>) -> Result<Url, Error> {
    let mut url = Url::parse(base)?;
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

fn close_disposition(frame: Option<CloseFrame<'_>>) -> SessionEnd {
    match frame {
        Some(f) if f.code == CloseCode::Normal => SessionEnd::Clean(if f.reason.is_empty() {
            None
        } else {
            Some(f.reason.to_string())
        }),
        Some(f) => SessionEnd::Dropped(format!(
            "closed with code {}: {}",
            u16::from(f.code),
            f.reason
        )),
        None => SessionEnd::Dropped("closed without a close frame".to_string()),
    }
}

/// Bounded exponential backoff: `initial * 2^(n-1)`, capped.
fn backoff_delay(config: &StreamConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    config
        .initial_backoff
        .saturating_mul(1u32 << exp)
        .min(config.max_backoff)
}

async fn finish_clean(state: &watch::Sender<ConnectionState>, event_tx: &mpsc::Sender<StreamEvent>) {
    state.send_replace(ConnectionState::Closed);
    let _ = event_tx.send(StreamEvent::Closed { reason: None }).await;
}
