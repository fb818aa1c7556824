use anyhow::Context as _;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use std::net::TcpListener;
use std::process::Child;
use std::time::{Duration, Instant};

pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// Pick an unused TCP port on localhost.
///
/// Note: this does not reserve the port; it's still possible for another process to bind it
/// before you do.
///
/// # Errors
///
/// Returns an error if binding an ephemeral localhost port fails or if the bound socket's
/// local address cannot be read.
pub fn pick_unused_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("bind ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

/// Poll an HTTP URL until it returns a success status (2xx/3xx).
///
/// # Errors
///
/// Returns an error if the timeout elapses before the endpoint returns a success status.
pub async fn wait_http_ok(url: &str, timeout_dur: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout_dur {
            anyhow::bail!("timed out waiting for {url}");
        }

        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            _ => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    }
}

/// JSON payloads of an event-stream response, skipping frames without data.
pub struct EventReader {
    events: BoxStream<'static, anyhow::Result<serde_json::Value>>,
}

impl EventReader {
    #[must_use]
    pub fn new(resp: reqwest::Response) -> Self {
        let events = sse_stream::SseStream::from_byte_stream(resp.bytes_stream())
            .filter_map(|evt| async move {
                let evt = match evt.context("read SSE event") {
                    Ok(evt) => evt,
                    Err(e) => return Some(Err(e)),
                };
                let payload = evt.data.unwrap_or_default();
                if payload.trim().is_empty() {
                    return None;
                }
                Some(serde_json::from_str(&payload).context("parse SSE data as JSON"))
            })
            .boxed();
        Self { events }
    }

    /// Next JSON payload.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout, on a malformed event, or if the stream ended.
    pub async fn next_json(&mut self, timeout_dur: Duration) -> anyhow::Result<serde_json::Value> {
        tokio::time::timeout(timeout_dur, self.events.next())
            .await
            .context("timed out waiting for an event")?
            .context("event stream ended")?
    }

    /// Next payload whose `type` field equals `kind`, skipping others.
    ///
    /// # Errors
    ///
    /// As [`EventReader::next_json`].
    pub async fn next_of_type(
        &mut self,
        kind: &str,
        timeout_dur: Duration,
    ) -> anyhow::Result<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + timeout_dur;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = self.next_json(remaining).await?;
            if event.get("type").and_then(serde_json::Value::as_str) == Some(kind) {
                return Ok(event);
            }
        }
    }

    /// Wait for the server to end the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is still open after `timeout_dur`.
    pub async fn wait_closed(&mut self, timeout_dur: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout_dur;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, self.events.next()).await {
                Ok(None | Some(Err(_))) => return Ok(()),
                Ok(Some(Ok(_))) => {}
                Err(_) => anyhow::bail!("event stream still open after {timeout_dur:?}"),
            }
        }
    }
}
