//! Invocation gateway: HTTP-shaped requests in, uniform envelopes out.
//!
//! Every operation goes through [`ProviderConnection::ensure_connected`] first, so a request that
//! arrives while the provider is down triggers (or joins) a reconnect attempt.

use crate::connection::ProviderConnection;
use crate::error::{RelayError, Result};
use crate::provider::{JsonObject, ToolDescriptor};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const TOOL_NAME_REQUIRED: &str = "Tool name is required";

const DEFAULT_PRODUCTS_LIMIT: i64 = 50;

/// ISO-8601 UTC timestamp with millisecond precision.
#[must_use]
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvokeRequest {
    #[serde(default)]
    pub tool: Option<Value>,
    #[serde(default)]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductsRequest {
    #[serde(default)]
    pub limit: Option<Value>,
    #[serde(default)]
    pub page_info: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProductImageRequest {
    #[serde(default)]
    pub product_id: Option<Value>,
    #[serde(default)]
    pub image_id: Option<Value>,
    #[serde(default)]
    pub alt: Option<Value>,
    #[serde(default)]
    pub position: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolsListed {
    pub success: bool,
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Invoked {
    pub success: bool,
    pub tool: String,
    pub arguments: JsonObject,
    pub result: Value,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShorthandOk {
    pub success: bool,
    pub data: Value,
}

/// Failure envelope sent for every rejected request.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

/// A failed gateway operation, with the tool name when one was resolved.
#[derive(Debug)]
pub struct Rejection {
    pub error: RelayError,
    pub tool: Option<String>,
}

impl Rejection {
    fn with_tool(error: RelayError, tool: &str) -> Self {
        Self {
            error,
            tool: Some(tool.to_string()),
        }
    }

    #[must_use]
    pub fn envelope(&self) -> Failure {
        Failure {
            success: false,
            error: self.error.to_string(),
            tool: self.tool.clone(),
        }
    }
}

impl From<RelayError> for Rejection {
    fn from(error: RelayError) -> Self {
        Self { error, tool: None }
    }
}

/// Use the provider's `content` when it carries one; otherwise the whole payload.
#[must_use]
pub fn normalize_result(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) if map.get("content").is_some_and(|c| !c.is_null()) => {
            map.remove("content").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// `None` for absent, null and empty-string values.
fn present(value: Option<Value>) -> Option<Value> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(v) => Some(v),
    }
}

/// Accept a JSON integer or a string holding one.
fn integer(field: &str, value: &Value) -> Result<i64> {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| RelayError::InvalidRequest(format!("{field} must be an integer")))
}

fn required_integer(field: &str, value: Option<Value>) -> Result<i64> {
    let value =
        present(value).ok_or_else(|| RelayError::InvalidRequest(format!("{field} is required")))?;
    integer(field, &value)
}

#[derive(Clone)]
pub struct Gateway {
    connection: ProviderConnection,
}

impl Gateway {
    #[must_use]
    pub fn new(connection: ProviderConnection) -> Self {
        Self { connection }
    }

    #[must_use]
    pub fn connection(&self) -> &ProviderConnection {
        &self.connection
    }

    /// # Errors
    ///
    /// Fails when the provider cannot be reached or rejects the listing.
    pub async fn list_tools(&self) -> std::result::Result<ToolsListed, Rejection> {
        self.connection.ensure_connected().await?;
        let tools = self.connection.list_tools().await?;
        Ok(ToolsListed {
            success: true,
            tools,
        })
    }

    /// Invoke a named tool with the given arguments.
    ///
    /// # Errors
    ///
    /// [`RelayError::InvalidRequest`] for a missing tool name or non-object arguments, before the
    /// provider is contacted; otherwise whatever the connection or provider reports.
    pub async fn invoke(&self, request: InvokeRequest) -> std::result::Result<Invoked, Rejection> {
        let tool = match request.tool {
            Some(Value::String(name)) if !name.is_empty() => name,
            _ => {
                return Err(RelayError::InvalidRequest(TOOL_NAME_REQUIRED.to_string()).into());
            }
        };
        let arguments = match request.arguments {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(arguments)) => arguments,
            Some(_) => {
                return Err(Rejection::with_tool(
                    RelayError::InvalidRequest("arguments must be a JSON object".to_string()),
                    &tool,
                ));
            }
        };

        let payload = self
            .call(&tool, arguments.clone())
            .await
            .map_err(|e| Rejection::with_tool(e, &tool))?;

        Ok(Invoked {
            success: true,
            tool,
            arguments,
            result: normalize_result(payload),
            timestamp: timestamp(),
        })
    }

    /// `get_products` with a default page size.
    ///
    /// # Errors
    ///
    /// As [`Gateway::invoke`]; a non-integer `limit` is an invalid request.
    pub async fn products(&self, request: ProductsRequest) -> std::result::Result<ShorthandOk, Rejection> {
        let limit = match present(request.limit) {
            Some(limit) => integer("limit", &limit)?,
            None => DEFAULT_PRODUCTS_LIMIT,
        };
        let mut arguments = Map::new();
        arguments.insert("limit".to_string(), Value::from(limit));
        if let Some(page_info) = present(request.page_info) {
            arguments.insert("page_info".to_string(), page_info);
        }
        self.shorthand("get_products", arguments).await
    }

    /// `get_product` for one product id taken from the request path.
    ///
    /// # Errors
    ///
    /// As [`Gateway::invoke`]; a non-integer id is an invalid request.
    pub async fn product(&self, id: &str) -> std::result::Result<ShorthandOk, Rejection> {
        let id = integer("id", &Value::String(id.to_string()))?;
        let mut arguments = Map::new();
        arguments.insert("id".to_string(), Value::from(id));
        self.shorthand("get_product", arguments).await
    }

    /// # Errors
    ///
    /// As [`Gateway::invoke`]; missing or non-integer ids are invalid requests.
    pub async fn update_product_image(
        &self,
        request: UpdateProductImageRequest,
    ) -> std::result::Result<ShorthandOk, Rejection> {
        let product_id = required_integer("product_id", request.product_id)?;
        let image_id = required_integer("image_id", request.image_id)?;

        let mut arguments = Map::new();
        arguments.insert("product_id".to_string(), Value::from(product_id));
        arguments.insert("image_id".to_string(), Value::from(image_id));
        if let Some(alt) = present(request.alt) {
            arguments.insert("alt".to_string(), alt);
        }
        if let Some(position) = present(request.position) {
            arguments.insert(
                "position".to_string(),
                Value::from(integer("position", &position)?),
            );
        }
        self.shorthand("update_product_image", arguments).await
    }

    async fn shorthand(
        &self,
        tool: &str,
        arguments: JsonObject,
    ) -> std::result::Result<ShorthandOk, Rejection> {
        let payload = self.call(tool, arguments).await?;
        Ok(ShorthandOk {
            success: true,
            data: normalize_result(payload),
        })
    }

    async fn call(&self, tool: &str, arguments: JsonObject) -> Result<Value> {
        self.connection.ensure_connected().await?;
        tracing::debug!(tool, "invoking tool");
        let result = self.connection.call_tool(tool, arguments).await;
        if let Err(e) = &result {
            tracing::warn!(tool, error = %e, "tool invocation failed");
        }
        result
    }
}
