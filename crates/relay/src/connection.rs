//! The single logical connection to the tool provider.
//!
//! One [`ProviderConnection`] exists per process. Every invocation goes through
//! [`ProviderConnection::ensure_connected`], which either returns immediately (connected), joins
//! the attempt already in flight, or starts exactly one new attempt. Failed attempts close a
//! backoff gate so a dead provider is not hammered by every incoming request.

use crate::error::{RelayError, Result};
use crate::notify::{CONNECTION_STATE, Notifier};
use crate::provider::{Connector, JsonObject, ProviderLink, ToolDescriptor};
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, timeout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    Failed { reason: String },
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed { .. } => "failed",
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Reason retained from the last failed attempt.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Bounds on connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
    /// Backoff after the first consecutive failure.
    pub backoff_min: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            backoff_min: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::from_millis(0);
        }

        let min_ms = u64::try_from(self.backoff_min.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.backoff_max.as_millis()).unwrap_or(u64::MAX);

        // Exponential backoff: min * 2^(failures-1), capped at max.
        let exp = (consecutive_failures - 1).min(30);
        let candidate = min_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(candidate.min(max_ms))
    }
}

#[derive(Debug)]
struct BackoffState {
    consecutive_failures: u32,
    next_allowed_attempt: Instant,
}

type PendingAttempt = Shared<BoxFuture<'static, std::result::Result<(), String>>>;

/// Shared handle onto the provider connection.
#[derive(Clone)]
pub struct ProviderConnection {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    notifier: Notifier,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    link: RwLock<Option<Arc<dyn ProviderLink>>>,
    /// The attempt in flight, if any. Concurrent callers await a clone of it.
    pending: Mutex<Option<PendingAttempt>>,
    backoff: Mutex<BackoffState>,
    /// Bumped by `close` so an attempt that finishes afterwards discards its link.
    epoch: AtomicU64,
}

impl ProviderConnection {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy, notifier: Notifier) -> Self {
        let (state, _rx) = watch::channel(ConnectionState::Uninitialized);
        Self {
            inner: Arc::new(Inner {
                connector,
                notifier,
                policy,
                state,
                link: RwLock::new(None),
                pending: Mutex::new(None),
                backoff: Mutex::new(BackoffState {
                    consecutive_failures: 0,
                    next_allowed_attempt: Instant::now(),
                }),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().is_connected()
    }

    #[must_use]
    pub fn provider(&self) -> String {
        self.inner.connector.describe()
    }

    /// Establish the link, ignoring the backoff gate. Returns whether the link is up.
    ///
    /// A no-op while connected. Concurrent callers share one attempt.
    pub async fn initialize(&self) -> bool {
        match self.attempt(false).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "initialize did not connect");
                false
            }
        }
    }

    /// Make sure the link is up, connecting if needed.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotConnected`] if the attempt fails or the backoff gate is closed.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.attempt(true).await
    }

    /// List the provider's tools. Not cached: every call asks the provider.
    ///
    /// # Errors
    ///
    /// [`RelayError::NotConnected`] unless connected; [`RelayError::Provider`] on provider failure.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let link = self.connected_link()?;
        link.list_tools().await
    }

    /// Invoke a tool and return the provider's raw payload.
    ///
    /// # Errors
    ///
    /// [`RelayError::InvalidRequest`] for an empty name, [`RelayError::NotConnected`] unless
    /// connected, [`RelayError::Provider`] when the provider fails the call.
    pub async fn call_tool(&self, name: &str, arguments: JsonObject) -> Result<Value> {
        if name.is_empty() {
            return Err(RelayError::InvalidRequest(
                "Tool name is required".to_string(),
            ));
        }
        let link = self.connected_link()?;
        link.call_tool(name, arguments).await
    }

    /// Release the link if held. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns the provider's error if shutting the link down fails; the connection is
    /// considered closed regardless.
    pub async fn close(&self) -> Result<()> {
        let link = {
            let mut slot = self.inner.link.write();
            self.inner.epoch.fetch_add(1, Ordering::AcqRel);
            self.inner.set_state(ConnectionState::Uninitialized);
            slot.take()
        };
        let Some(link) = link else {
            return Ok(());
        };
        tracing::info!(provider = %self.provider(), "closing tool provider connection");
        link.close().await
    }

    fn connected_link(&self) -> Result<Arc<dyn ProviderLink>> {
        let not_connected = || RelayError::NotConnected("Tool provider is not connected".to_string());
        if !self.is_connected() {
            return Err(not_connected());
        }
        self.inner.link.read().clone().ok_or_else(not_connected)
    }

    async fn attempt(&self, respect_backoff: bool) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let pending = {
            let mut pending = self.inner.pending.lock();
            if let Some(attempt) = pending.as_ref() {
                attempt.clone()
            } else {
                // Re-check: an attempt may have finished between the fast path and the lock.
                if self.is_connected() {
                    return Ok(());
                }
                if respect_backoff && let Some(remaining) = self.inner.backoff_remaining() {
                    return Err(RelayError::NotConnected(self.inner.backoff_message(remaining)));
                }

                // Own task: dropping a caller never cancels the attempt.
                let inner = Arc::clone(&self.inner);
                let attempt = tokio::spawn(inner.connect_once())
                    .map(|joined| {
                        joined.unwrap_or_else(|e| Err(format!("connection attempt aborted: {e}")))
                    })
                    .boxed()
                    .shared();
                *pending = Some(attempt.clone());
                attempt
            }
        };

        pending.await.map_err(RelayError::NotConnected)
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            let params = match next.reason() {
                Some(reason) => json!({ "state": next.as_str(), "reason": reason }),
                None => json!({ "state": next.as_str() }),
            };
            self.notifier.publish(CONNECTION_STATE, params);
        }
    }

    fn backoff_remaining(&self) -> Option<Duration> {
        let backoff = self.backoff.lock();
        let now = Instant::now();
        (now < backoff.next_allowed_attempt).then(|| backoff.next_allowed_attempt - now)
    }

    fn backoff_message(&self, remaining: Duration) -> String {
        let state = self.state.borrow();
        let reason = state.reason().unwrap_or("Tool provider is not connected");
        format!("{reason} (retry in {}ms)", remaining.as_millis())
    }

    fn record_failure(&self) -> Duration {
        let mut backoff = self.backoff.lock();
        backoff.consecutive_failures = backoff.consecutive_failures.saturating_add(1);
        let delay = self.policy.backoff_delay(backoff.consecutive_failures);
        let now = Instant::now();
        backoff.next_allowed_attempt = now.checked_add(delay).unwrap_or(now);
        delay
    }

    fn reset_backoff(&self) {
        let mut backoff = self.backoff.lock();
        backoff.consecutive_failures = 0;
        backoff.next_allowed_attempt = Instant::now();
    }

    async fn connect_once(self: Arc<Self>) -> std::result::Result<(), String> {
        let epoch = {
            let _slot = self.link.write();
            self.set_state(ConnectionState::Connecting);
            self.epoch.load(Ordering::Acquire)
        };
        let mut guard = AttemptGuard {
            inner: &*self,
            epoch,
            settled: false,
        };
        let provider = self.connector.describe();
        tracing::info!(%provider, "connecting to tool provider");

        let connect_timeout = self.policy.connect_timeout;
        let connected = match timeout(connect_timeout, self.connector.connect(self.notifier.clone()))
            .await
        {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!(
                "Connection to tool provider timed out after {}s",
                connect_timeout.as_secs()
            )),
        };

        let outcome = match connected {
            Ok(link) => {
                let stale = {
                    let mut slot = self.link.write();
                    if self.epoch.load(Ordering::Acquire) == epoch {
                        *slot = Some(link);
                        self.set_state(ConnectionState::Connected);
                        None
                    } else {
                        Some(link)
                    }
                };
                if let Some(link) = stale {
                    tracing::info!(%provider, "connection closed while connecting; discarding link");
                    if let Err(e) = link.close().await {
                        tracing::debug!(%provider, error = %e, "failed to close discarded link");
                    }
                    Err("Connection closed during initialization".to_string())
                } else {
                    self.reset_backoff();
                    tracing::info!(%provider, "tool provider connected");
                    Ok(())
                }
            }
            Err(reason) => {
                let delay = self.record_failure();
                tracing::warn!(
                    %provider,
                    error = %reason,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "tool provider connection failed"
                );
                let _slot = self.link.write();
                if self.epoch.load(Ordering::Acquire) == epoch {
                    self.set_state(ConnectionState::Failed {
                        reason: reason.clone(),
                    });
                }
                Err(reason)
            }
        };

        guard.settled = true;
        outcome
    }
}

/// Clears the in-flight slot when an attempt ends, however it ends. An attempt that never
/// reached an outcome (panic, runtime shutdown) is recorded as a failure.
struct AttemptGuard<'a> {
    inner: &'a Inner,
    epoch: u64,
    settled: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let reason = "Connection attempt aborted".to_string();
            self.inner.record_failure();
            tracing::warn!(error = %reason, "tool provider connection attempt did not complete");
            let _slot = self.inner.link.write();
            if self.inner.epoch.load(Ordering::Acquire) == self.epoch {
                self.inner.set_state(ConnectionState::Failed { reason });
            }
        }
        self.inner.pending.lock().take();
    }
}
