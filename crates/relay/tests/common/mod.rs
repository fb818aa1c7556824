#![allow(dead_code)]

use anyhow::Context as _;
use std::io::Write as _;
use std::process::{Command, Stdio};
use std::time::Duration;

pub use toolrelay_test_support::{EventReader, KillOnDrop};

pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(20);

pub struct RunningRelay {
    pub base: String,
    _child: KillOnDrop,
    _config: Option<tempfile::NamedTempFile>,
}

impl RunningRelay {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

pub fn provider_bin() -> &'static str {
    env!("CARGO_BIN_EXE_toolrelay-stdio-test-provider")
}

/// Start the relay with extra command-line arguments and wait for `/health`.
pub async fn start_relay(args: &[&str]) -> anyhow::Result<RunningRelay> {
    start(args, None).await
}

/// Start the relay with a YAML config file and wait for `/health`.
pub async fn start_relay_with_config(yaml: &str, args: &[&str]) -> anyhow::Result<RunningRelay> {
    let mut file = tempfile::NamedTempFile::new().context("create config file")?;
    file.write_all(yaml.as_bytes()).context("write config file")?;
    start(args, Some(file)).await
}

async fn start(args: &[&str], config: Option<tempfile::NamedTempFile>) -> anyhow::Result<RunningRelay> {
    let port = toolrelay_test_support::pick_unused_port()?;
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_toolrelay"));
    cmd.arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port.to_string())
        .arg("--log-level")
        .arg("info")
        .env_remove("PORT")
        .env_remove("TOOLRELAY_CONFIG")
        .env_remove("TOOLRELAY_HOST")
        .stdout(Stdio::null())
        .args(args);
    if let Some(file) = &config {
        cmd.arg("--config").arg(file.path());
    }
    let child = KillOnDrop(cmd.spawn().context("spawn toolrelay")?);

    let base = format!("http://127.0.0.1:{port}");
    toolrelay_test_support::wait_http_ok(&format!("{base}/health"), STARTUP_TIMEOUT).await?;
    Ok(RunningRelay {
        base,
        _child: child,
        _config: config,
    })
}

pub async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
) -> anyhow::Result<(reqwest::StatusCode, serde_json::Value)> {
    let resp = client.post(url).json(body).send().await.context("POST")?;
    let status = resp.status();
    Ok((status, resp.json().await.context("parse JSON response")?))
}

pub async fn get_json(
    client: &reqwest::Client,
    url: &str,
) -> anyhow::Result<(reqwest::StatusCode, serde_json::Value)> {
    let resp = client.get(url).send().await.context("GET")?;
    let status = resp.status();
    Ok((status, resp.json().await.context("parse JSON response")?))
}

pub async fn open_stream(client: &reqwest::Client, url: &str) -> anyhow::Result<EventReader> {
    let resp = client
        .get(url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .context("open event stream")?;
    anyhow::ensure!(resp.status().is_success(), "stream status {}", resp.status());
    Ok(EventReader::new(resp))
}
