//! Long-lived event-stream sessions.
//!
//! Each session owns one task holding its liveness timer and a [`SessionGuard`]. The task ends
//! when the peer goes away, a write fails, or the server shuts down; dropping the guard is the
//! one place a session is released.

use crate::error::RelayError;
use crate::gateway::timestamp;
use crate::notify::{Notification, Notifier};
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);
/// Longest accepted liveness interval.
pub const MAX_KEEPALIVE: Duration = Duration::from_secs(24 * 60 * 60);

const SESSION_BUFFER: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// One `data:` frame on an event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Handshake {
        protocol_version: String,
        capabilities: Value,
        server_info: ServerInfo,
        session_id: String,
        timestamp: String,
    },
    Ping {
        timestamp: String,
    },
    Notification {
        method: String,
        params: Value,
        timestamp: String,
    },
}

impl StreamEvent {
    fn handshake(session_id: Uuid, server_info: ServerInfo) -> Self {
        Self::Handshake {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({ "tools": {}, "resources": {} }),
            server_info,
            session_id: session_id.to_string(),
            timestamp: timestamp(),
        }
    }

    fn ping() -> Self {
        Self::Ping {
            timestamp: timestamp(),
        }
    }

    fn notification(notification: Notification) -> Self {
        Self::Notification {
            method: notification.method,
            params: notification.params,
            timestamp: timestamp(),
        }
    }
}

type Sessions = Arc<RwLock<HashMap<Uuid, DateTime<Utc>>>>;

pub struct StreamManager {
    keepalive: Duration,
    server_info: ServerInfo,
    notifier: Notifier,
    shutdown: CancellationToken,
    sessions: Sessions,
}

impl StreamManager {
    #[must_use]
    pub fn new(keepalive: Duration, server_info: ServerInfo, notifier: Notifier) -> Self {
        Self {
            keepalive: keepalive.clamp(Duration::from_millis(1), MAX_KEEPALIVE),
            server_info,
            notifier,
            shutdown: CancellationToken::new(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Open a session. The handshake is queued before this returns.
    #[must_use]
    pub fn open(&self) -> SessionStream {
        let id = Uuid::new_v4();
        let opened_at = Utc::now();
        self.sessions.write().insert(id, opened_at);
        let guard = SessionGuard {
            id,
            opened_at,
            sessions: Arc::clone(&self.sessions),
        };

        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        if let Err(e) = tx.try_send(StreamEvent::handshake(id, self.server_info.clone())) {
            tracing::warn!(stream_session_id = %id, error = %e, "failed to queue handshake");
        }
        tracing::info!(stream_session_id = %id, "stream opened");

        tokio::spawn(run_session(
            tx,
            guard,
            self.keepalive,
            self.notifier.subscribe(),
            self.shutdown.clone(),
        ));

        SessionStream { id, rx }
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    /// End every open session and refuse to keep new ones alive.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

async fn run_session(
    tx: mpsc::Sender<StreamEvent>,
    guard: SessionGuard,
    keepalive: Duration,
    mut notifications: broadcast::Receiver<Notification>,
    shutdown: CancellationToken,
) {
    let id = guard.id;
    let now = Instant::now();
    let first_tick = now.checked_add(keepalive).unwrap_or(now + MAX_KEEPALIVE);
    let mut ticker = tokio::time::interval_at(first_tick, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut notifications_open = true;

    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => {
                tracing::debug!(stream_session_id = %id, "server shutting down; ending stream");
                break;
            }
            () = tx.closed() => {
                tracing::debug!(stream_session_id = %id, "stream peer disconnected");
                break;
            }
            _ = ticker.tick() => {
                tracing::trace!(stream_session_id = %id, "stream ping");
                StreamEvent::ping()
            }
            received = notifications.recv(), if notifications_open => match received {
                Ok(notification) => StreamEvent::notification(notification),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(stream_session_id = %id, skipped, "stream lagged; notifications dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    notifications_open = false;
                    continue;
                }
            },
        };

        tokio::select! {
            () = shutdown.cancelled() => break,
            sent = tx.send(event) => {
                if let Err(e) = sent {
                    let err = write_failed(&e);
                    tracing::debug!(stream_session_id = %id, error = %err, "stream write failed");
                    break;
                }
            }
        }
    }

    drop(guard);
}

fn write_failed(e: &mpsc::error::SendError<StreamEvent>) -> RelayError {
    RelayError::Transport(e.to_string())
}

/// Releases a session's bookkeeping when dropped.
struct SessionGuard {
    id: Uuid,
    opened_at: DateTime<Utc>,
    sessions: Sessions,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.write().remove(&self.id);
        let open_ms = (Utc::now() - self.opened_at).num_milliseconds();
        tracing::info!(stream_session_id = %self.id, open_ms, "stream closed");
    }
}

/// Receiving half of a session, in emission order.
pub struct SessionStream {
    id: Uuid,
    rx: mpsc::Receiver<StreamEvent>,
}

impl SessionStream {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Stream for SessionStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
