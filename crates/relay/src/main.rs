use anyhow::Context as _;
use clap::Parser as _;
use toolrelay::config::{Cli, RelayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    toolrelay::telemetry::init_tracing(&cli.log_level, cli.log_format)?;

    let config = RelayConfig::resolve(&cli).context("invalid configuration")?;
    tracing::info!(
        bind = %config.bind,
        eager_connect = config.eager_connect,
        keep_alive_secs = config.settings.keep_alive_secs,
        "starting toolrelay"
    );

    toolrelay::run(config).await.context("toolrelay failed")
}
