//! Tool provider links.
//!
//! A [`Connector`] knows how to reach one kind of provider and yields a [`ProviderLink`] once the
//! link is up. The connection state machine in [`crate::connection`] owns at most one link at a
//! time and never looks at which connector produced it.

mod mock;
mod rmcp_link;

pub use mock::MockConnector;
pub use rmcp_link::{RmcpConnector, RmcpTransport};

use crate::config::ProviderConfig;
use crate::error::Result;
use crate::notify::Notifier;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Tool arguments as passed to the provider.
pub type JsonObject = Map<String, Value>;

/// Tool information as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Short description used in logs and `/health`.
    fn describe(&self) -> String;

    /// Establish a new link. Provider-initiated notifications are published on `notifier`.
    async fn connect(&self, notifier: Notifier) -> Result<Arc<dyn ProviderLink>>;
}

#[async_trait]
pub trait ProviderLink: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    /// Invoke `name`, returning the provider's raw result payload.
    async fn call_tool(&self, name: &str, arguments: JsonObject) -> Result<Value>;

    async fn close(&self) -> Result<()>;
}

/// Build the connector selected by configuration.
#[must_use]
pub fn connector_for(config: &ProviderConfig, call_timeout: Option<Duration>) -> Arc<dyn Connector> {
    match config {
        ProviderConfig::Stdio { command, args, env } => Arc::new(RmcpConnector::new(
            RmcpTransport::Stdio {
                command: command.clone(),
                args: args.clone(),
                env: env.clone(),
            },
            call_timeout,
        )),
        ProviderConfig::StreamableHttp { url } => Arc::new(RmcpConnector::new(
            RmcpTransport::StreamableHttp { url: url.clone() },
            call_timeout,
        )),
        ProviderConfig::Mock => Arc::new(MockConnector::new()),
    }
}
