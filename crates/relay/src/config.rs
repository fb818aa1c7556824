//! Command line and YAML configuration.

use crate::connection::ReconnectPolicy;
use crate::error::{RelayError, Result};
use crate::stream::MAX_KEEPALIVE;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "toolrelay", version, about)]
pub struct Cli {
    /// HTTP listen port
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// HTTP listen address
    #[arg(long, env = "TOOLRELAY_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// YAML config file with `provider` and `gateway` sections
    #[arg(long, env = "TOOLRELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Spawn this MCP server and talk to it over stdio
    #[arg(long, conflicts_with_all = ["provider_url", "mock"])]
    pub provider_command: Option<String>,

    /// Argument for `--provider-command` (repeatable)
    #[arg(
        long = "provider-arg",
        allow_hyphen_values = true,
        requires = "provider_command"
    )]
    pub provider_args: Vec<String>,

    /// Remote MCP server speaking streamable HTTP
    #[arg(long, conflicts_with = "mock")]
    pub provider_url: Option<String>,

    /// Serve canned responses from the built-in mock provider
    #[arg(long)]
    pub mock: bool,

    /// Log filter (`info`, `toolrelay=debug`, ...); `RUST_LOG` wins when set
    #[arg(long, env = "TOOLRELAY_LOG", default_value = "info")]
    pub log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Do not attempt the provider connection at startup
    #[arg(long)]
    pub no_eager_connect: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Tool provider selection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProviderConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    StreamableHttp {
        url: String,
    },
    Mock,
}

const MAX_STARTUP_TIMEOUT_SECS: u64 = 60 * 60;
const MAX_CALL_TIMEOUT_SECS: u64 = 24 * 60 * 60;
const MAX_BACKOFF_MS: u64 = 60 * 60 * 1000;

fn in_range(field: &str, value: u64, max: u64) -> Result<()> {
    if value == 0 || value > max {
        return Err(RelayError::Config(format!(
            "{field} must be between 1 and {max}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct GatewaySettings {
    pub keep_alive_secs: u64,
    pub startup_timeout_secs: u64,
    /// Per tool call; unset means no timeout beyond the provider's own.
    pub call_timeout_secs: Option<u64>,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            keep_alive_secs: 30,
            startup_timeout_secs: 30,
            call_timeout_secs: None,
            backoff_min_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl GatewaySettings {
    fn validate(&self) -> Result<()> {
        in_range("keepAliveSecs", self.keep_alive_secs, MAX_KEEPALIVE.as_secs())?;
        in_range("startupTimeoutSecs", self.startup_timeout_secs, MAX_STARTUP_TIMEOUT_SECS)?;
        if let Some(call_timeout) = self.call_timeout_secs {
            in_range("callTimeoutSecs", call_timeout, MAX_CALL_TIMEOUT_SECS)?;
        }
        if self.backoff_max_ms > MAX_BACKOFF_MS {
            return Err(RelayError::Config(format!(
                "backoffMaxMs must be <= {MAX_BACKOFF_MS}"
            )));
        }
        if self.backoff_min_ms > self.backoff_max_ms {
            return Err(RelayError::Config(format!(
                "backoffMinMs ({}) must not exceed backoffMaxMs ({})",
                self.backoff_min_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            connect_timeout: Duration::from_secs(self.startup_timeout_secs),
            backoff_min: Duration::from_millis(self.backoff_min_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
    #[serde(default)]
    pub gateway: GatewaySettings,
}

impl FileConfig {
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid config YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("read {}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    /// # Errors
    ///
    /// Returns an error if `raw` is not valid config YAML.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub provider: ProviderConfig,
    pub settings: GatewaySettings,
    pub eager_connect: bool,
}

impl RelayConfig {
    /// Merge the command line with the optional config file. Provider flags win over the file.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if no provider is configured or a tunable is out of range.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let provider = provider_from_flags(cli).or(file.provider).ok_or_else(|| {
            RelayError::Config(
                "no tool provider configured: pass --provider-command, --provider-url, --mock, \
                 or a config file with a provider section"
                    .to_string(),
            )
        })?;
        if let ProviderConfig::Stdio { command, .. } = &provider
            && command.trim().is_empty()
        {
            return Err(RelayError::Config(
                "stdio provider command must not be empty".to_string(),
            ));
        }

        file.gateway.validate()?;

        Ok(Self {
            bind: SocketAddr::new(cli.host, cli.port),
            provider,
            settings: file.gateway,
            eager_connect: !cli.no_eager_connect,
        })
    }
}

fn provider_from_flags(cli: &Cli) -> Option<ProviderConfig> {
    if let Some(command) = &cli.provider_command {
        return Some(ProviderConfig::Stdio {
            command: command.clone(),
            args: cli.provider_args.clone(),
            env: HashMap::new(),
        });
    }
    if let Some(url) = &cli.provider_url {
        return Some(ProviderConfig::StreamableHttp { url: url.clone() });
    }
    cli.mock.then_some(ProviderConfig::Mock)
}
