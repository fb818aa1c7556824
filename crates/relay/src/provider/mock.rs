//! In-process stand-in provider for local development and tests.

use super::{Connector, JsonObject, ProviderLink, ToolDescriptor};
use crate::error::{RelayError, Result};
use crate::notify::Notifier;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct MockConnector;

impl MockConnector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn describe(&self) -> String {
        "mock".to_string()
    }

    async fn connect(&self, _notifier: Notifier) -> Result<Arc<dyn ProviderLink>> {
        tracing::info!("using mock tool provider");
        Ok(Arc::new(MockLink::default()))
    }
}

#[derive(Debug, Default)]
struct MockLink {
    closed: AtomicBool,
}

impl MockLink {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::Provider("mock provider is closed".to_string()));
        }
        Ok(())
    }
}

fn mock_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "get_products".to_string(),
            description: Some("Retrieve products from the store".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": { "type": "number", "default": 50 }
                }
            }),
        },
        ToolDescriptor {
            name: "update_product_image".to_string(),
            description: Some("Update product image alt text".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_id": { "type": "number" },
                    "image_id": { "type": "number" },
                    "alt": { "type": "string" }
                },
                "required": ["product_id", "image_id", "alt"]
            }),
        },
    ]
}

#[async_trait]
impl ProviderLink for MockLink {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.ensure_open()?;
        Ok(mock_tools())
    }

    async fn call_tool(&self, name: &str, arguments: JsonObject) -> Result<Value> {
        self.ensure_open()?;
        tracing::debug!(tool = name, "mock provider executing tool");

        let result = match name {
            "get_products" => json!({
                "products": [{
                    "id": 12345,
                    "title": "Test Product",
                    "images": [{ "id": 67890, "alt": null, "position": 1 }]
                }]
            }),
            "update_product_image" => json!({
                "image": {
                    "id": arguments.get("image_id").cloned().unwrap_or(Value::Null),
                    "alt": arguments.get("alt").cloned().unwrap_or(Value::Null),
                    "updated_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                }
            }),
            other => json!({ "message": format!("Tool {other} executed successfully") }),
        };
        Ok(result)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
