//! MCP provider links via rmcp (child-process stdio or streamable HTTP).

use super::{Connector, JsonObject, ProviderLink, ToolDescriptor};
use crate::error::{RelayError, Result};
use crate::notify::{Notifier, TOOLS_LIST_CHANGED};
use async_trait::async_trait;
use rmcp::{
    ClientHandler, RoleClient, ServiceExt as _,
    model::{CallToolRequestParams, ClientInfo},
    service::{Peer, RunningService, ServiceError},
    transport::{StreamableHttpClientTransport, TokioChildProcess},
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Type alias for the rmcp running client service
type ProviderClient = RunningService<RoleClient, RelayClientHandler>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RmcpTransport {
    /// Spawn the provider and speak MCP over its stdin/stdout.
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    /// Remote MCP server speaking streamable HTTP.
    StreamableHttp { url: String },
}

pub struct RmcpConnector {
    transport: RmcpTransport,
    call_timeout: Option<Duration>,
}

impl RmcpConnector {
    #[must_use]
    pub fn new(transport: RmcpTransport, call_timeout: Option<Duration>) -> Self {
        Self {
            transport,
            call_timeout,
        }
    }
}

#[async_trait]
impl Connector for RmcpConnector {
    fn describe(&self) -> String {
        match &self.transport {
            RmcpTransport::Stdio { command, .. } => format!("stdio:{command}"),
            RmcpTransport::StreamableHttp { url } => format!("streamable-http:{url}"),
        }
    }

    async fn connect(&self, notifier: Notifier) -> Result<Arc<dyn ProviderLink>> {
        let handler = RelayClientHandler { notifier };
        let described = self.describe();

        let client: ProviderClient = match &self.transport {
            RmcpTransport::Stdio { command, args, env } => {
                let mut cmd = Command::new(command);
                cmd.args(args);
                for (key, value) in env {
                    cmd.env(key, value);
                }
                let transport = TokioChildProcess::new(cmd).map_err(|e| {
                    RelayError::Provider(format!("Failed to spawn '{command}': {e}"))
                })?;
                handler.serve(transport).await.map_err(|e| {
                    RelayError::Provider(format!("Failed to connect to '{described}': {e}"))
                })?
            }
            RmcpTransport::StreamableHttp { url } => {
                let transport = StreamableHttpClientTransport::from_uri(url.as_str());
                handler.serve(transport).await.map_err(|e| {
                    RelayError::Provider(format!("Failed to connect to '{described}': {e}"))
                })?
            }
        };

        if let Some(server_info) = client.peer_info() {
            tracing::info!(
                provider = %described,
                server_name = %server_info.server_info.name,
                server_version = %server_info.server_info.version,
                "MCP provider handshake complete"
            );
        }

        let peer = client.peer().clone();
        Ok(Arc::new(RmcpLink {
            peer,
            client: Mutex::new(Some(client)),
            call_timeout: self.call_timeout,
        }))
    }
}

#[derive(Debug, Clone)]
struct RelayClientHandler {
    notifier: Notifier,
}

impl ClientHandler for RelayClientHandler {
    fn get_info(&self) -> ClientInfo {
        let mut info = ClientInfo::default();
        info.client_info.name = env!("CARGO_PKG_NAME").to_string();
        info.client_info.version = env!("CARGO_PKG_VERSION").to_string();
        info
    }

    fn on_tool_list_changed(
        &self,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let notifier = self.notifier.clone();
        async move {
            let reached = notifier.publish(TOOLS_LIST_CHANGED, json!({}));
            tracing::debug!(streams = reached, "relayed provider tools list_changed");
        }
    }
}

struct RmcpLink {
    peer: Peer<RoleClient>,
    client: Mutex<Option<ProviderClient>>,
    call_timeout: Option<Duration>,
}

fn service_error_message(err: &ServiceError) -> String {
    match err {
        ServiceError::McpError(e) => e.message.to_string(),
        other => other.to_string(),
    }
}

/// Text blocks of an `isError` tool result, joined; falls back to the whole payload.
fn tool_error_message(payload: &Value) -> String {
    let texts: Vec<&str> = payload
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if texts.is_empty() {
        return format!("tool reported an error: {payload}");
    }
    texts.join("\n")
}

#[async_trait]
impl ProviderLink for RmcpLink {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let tools = self
            .peer
            .list_all_tools()
            .await
            .map_err(|e| RelayError::Provider(service_error_message(&e)))?;

        Ok(tools
            .into_iter()
            .map(|t| ToolDescriptor {
                name: t.name.to_string(),
                description: t.description.clone().map(|d| d.to_string()),
                input_schema: Value::Object(t.input_schema.as_ref().clone()),
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: JsonObject) -> Result<Value> {
        let request = rmcp::model::ClientRequest::CallToolRequest(rmcp::model::CallToolRequest {
            method: rmcp::model::CallToolRequestMethod,
            params: CallToolRequestParams {
                name: name.to_string().into(),
                arguments: Some(arguments),
                meta: None,
                task: None,
            },
            extensions: rmcp::model::Extensions::default(),
        });

        let handle = self
            .peer
            .send_cancellable_request(
                request,
                rmcp::service::PeerRequestOptions {
                    timeout: self.call_timeout,
                    meta: None,
                },
            )
            .await
            .map_err(|e| RelayError::Provider(format!("Tool call failed to send: {e}")))?;

        let server_result = match handle.await_response().await {
            Ok(v) => v,
            Err(ServiceError::Timeout { .. }) => {
                let ms = self.call_timeout.map_or(0, |t| t.as_millis());
                return Err(RelayError::Provider(format!(
                    "Tool call timed out after {ms}ms"
                )));
            }
            Err(e) => return Err(RelayError::Provider(service_error_message(&e))),
        };

        let result = match server_result {
            rmcp::model::ServerResult::CallToolResult(r) => r,
            other => {
                return Err(RelayError::Provider(format!(
                    "Unexpected response type for tools/call: {other:?}",
                )));
            }
        };

        let payload = serde_json::to_value(&result)?;
        if payload.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(RelayError::Provider(tool_error_message(&payload)));
        }
        Ok(payload)
    }

    async fn close(&self) -> Result<()> {
        let client = self.client.lock().await.take();
        let Some(client) = client else {
            return Ok(());
        };
        client
            .cancel()
            .await
            .map(|reason| tracing::debug!(?reason, "MCP provider client stopped"))
            .map_err(|e| RelayError::Provider(format!("Failed to stop MCP provider client: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::{RmcpConnector, RmcpTransport, tool_error_message};
    use crate::provider::Connector as _;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn tool_error_message_joins_text_blocks() {
        let payload = json!({
            "isError": true,
            "content": [
                {"type": "text", "text": "product 7 not found"},
                {"type": "image", "data": "...", "mimeType": "image/png"},
                {"type": "text", "text": "check the id"}
            ]
        });
        assert_eq!(
            tool_error_message(&payload),
            "product 7 not found\ncheck the id"
        );
    }

    #[test]
    fn tool_error_message_without_text_keeps_payload() {
        let payload = json!({"isError": true, "content": []});
        assert!(tool_error_message(&payload).starts_with("tool reported an error"));
    }

    #[test]
    fn describe_names_transport() {
        let stdio = RmcpConnector::new(
            RmcpTransport::Stdio {
                command: "shop-mcp".to_string(),
                args: Vec::new(),
                env: HashMap::new(),
            },
            None,
        );
        assert_eq!(stdio.describe(), "stdio:shop-mcp");

        let http = RmcpConnector::new(
            RmcpTransport::StreamableHttp {
                url: "http://127.0.0.1:9/mcp".to_string(),
            },
            None,
        );
        assert_eq!(http.describe(), "streamable-http:http://127.0.0.1:9/mcp");
    }

    #[tokio::test]
    async fn spawning_a_missing_command_fails() {
        let connector = RmcpConnector::new(
            RmcpTransport::Stdio {
                command: "/nonexistent/toolrelay-provider".to_string(),
                args: Vec::new(),
                env: HashMap::new(),
            },
            None,
        );
        let Err(err) = connector.connect(crate::notify::Notifier::new()).await else {
            panic!("expected spawn failure");
        };
        assert!(err.to_string().contains("/nonexistent/toolrelay-provider"));
    }
}
