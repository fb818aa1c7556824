//! Process wiring: build the relay from config, serve until a shutdown signal.

use crate::config::{GatewaySettings, RelayConfig};
use crate::connection::ProviderConnection;
use crate::error::{RelayError, Result};
use crate::gateway::Gateway;
use crate::http::{self, AppState};
use crate::notify::Notifier;
use crate::provider::{Connector, connector_for};
use crate::stream::{ServerInfo, StreamManager};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;

/// One relay instance: the provider connection, the stream manager, and the router over both.
pub struct Relay {
    state: AppState,
}

impl Relay {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, settings: &GatewaySettings) -> Self {
        let notifier = Notifier::new();
        let connection =
            ProviderConnection::new(connector, settings.reconnect_policy(), notifier.clone());
        let streams = Arc::new(StreamManager::new(
            settings.keepalive(),
            ServerInfo::default(),
            notifier,
        ));
        Self {
            state: AppState {
                gateway: Gateway::new(connection),
                streams,
            },
        }
    }

    #[must_use]
    pub fn connection(&self) -> &ProviderConnection {
        self.state.gateway.connection()
    }

    #[must_use]
    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.state.streams
    }

    #[must_use]
    pub fn router(&self) -> Router {
        http::router(self.state.clone())
    }

    /// End open streams and release the provider. Close failures are logged, not returned.
    pub async fn shutdown(&self) {
        self.state.streams.shutdown();
        if let Err(e) = self.connection().close().await {
            tracing::warn!(error = %e, "failed to close tool provider connection");
        }
    }
}

/// Serve until SIGINT/SIGTERM.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run(config: RelayConfig) -> Result<()> {
    let connector = connector_for(&config.provider, config.settings.call_timeout());
    let relay = Relay::new(connector, &config.settings);

    let listener = TcpListener::bind(config.bind)
        .await
        .map_err(|e| RelayError::Startup(format!("failed to bind {}: {e}", config.bind)))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        provider = %relay.connection().provider(),
        "toolrelay listening"
    );

    if config.eager_connect {
        let connection = relay.connection().clone();
        tokio::spawn(async move {
            if !connection.initialize().await {
                tracing::warn!("initial provider connection failed; will retry on demand");
            }
        });
    }

    let streams = Arc::clone(relay.streams());
    axum::serve(listener, relay.router())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            streams.shutdown();
        })
        .await?;

    relay.shutdown().await;
    tracing::info!("toolrelay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
