//! HTTP surface: JSON API, event stream, health.

use crate::error::RelayError;
use crate::gateway::{
    Gateway, InvokeRequest, Invoked, ProductsRequest, Rejection, ShorthandOk, ToolsListed,
    UpdateProductImageRequest, timestamp,
};
use crate::stream::StreamManager;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt as _};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;

const SERVICE_NAME: &str = env!("CARGO_PKG_NAME");
const BODY_LIMIT_BYTES: usize = 50 * 1024 * 1024;

const ENDPOINTS: &[&str] = &[
    "GET /health",
    "GET /mcp",
    "GET /api/tools",
    "POST /api/execute",
    "POST /api/shopify/products",
    "POST /api/shopify/product/{id}",
    "POST /api/shopify/update-product-image",
];

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub streams: Arc<StreamManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mcp", get(open_stream))
        .route("/api/tools", get(list_tools))
        .route("/api/execute", post(execute))
        .route("/api/shopify/products", post(products))
        .route("/api/shopify/product/{id}", post(product))
        .route(
            "/api/shopify/update-product-image",
            post(update_product_image),
        )
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .with_state(state)
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.error.status_code(), Json(self.envelope())).into_response()
    }
}

/// Parse a JSON body regardless of content type; an empty body means "all defaults".
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Rejection> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| RelayError::InvalidRequest(format!("Malformed JSON body: {e}")).into())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let connection = state.gateway.connection();
    let connection_state = connection.state();
    Json(json!({
        "status": "ok",
        "timestamp": timestamp(),
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "mcpConnected": connection_state.is_connected(),
        "connectionState": connection_state.as_str(),
        "provider": connection.provider(),
        "activeStreams": state.streams.active_sessions(),
        "endpoints": ENDPOINTS,
    }))
}

async fn open_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let session = state.streams.open();
    let shutdown = state.streams.shutdown_token();
    let events = session
        .map(|event| Event::default().json_data(&event))
        .take_until(async move { shutdown.cancelled().await });
    Sse::new(events)
}

async fn list_tools(State(state): State<AppState>) -> Result<Json<ToolsListed>, Rejection> {
    state.gateway.list_tools().await.map(Json)
}

async fn execute(State(state): State<AppState>, body: Bytes) -> Result<Json<Invoked>, Rejection> {
    let request: InvokeRequest = parse_body(&body)?;
    state.gateway.invoke(request).await.map(Json)
}

async fn products(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ShorthandOk>, Rejection> {
    let request: ProductsRequest = parse_body(&body)?;
    state.gateway.products(request).await.map(Json)
}

async fn product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ShorthandOk>, Rejection> {
    state.gateway.product(&id).await.map(Json)
}

async fn update_product_image(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ShorthandOk>, Rejection> {
    let request: UpdateProductImageRequest = parse_body(&body)?;
    state.gateway.update_product_image(request).await.map(Json)
}

#[cfg(test)]
mod tests {
    use super::{AppState, router};
    use crate::connection::{ProviderConnection, ReconnectPolicy};
    use crate::gateway::Gateway;
    use crate::notify::Notifier;
    use crate::provider::testing::FakeConnector;
    use crate::provider::{Connector, MockConnector};
    use crate::stream::{ServerInfo, StreamManager};
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt as _;

    fn state(connector: Arc<dyn Connector>) -> AppState {
        let notifier = Notifier::new();
        let policy = ReconnectPolicy {
            connect_timeout: Duration::from_secs(5),
            backoff_min: Duration::ZERO,
            backoff_max: Duration::ZERO,
        };
        AppState {
            gateway: Gateway::new(ProviderConnection::new(connector, policy, notifier.clone())),
            streams: Arc::new(StreamManager::new(
                Duration::from_secs(30),
                ServerInfo::default(),
                notifier,
            )),
        }
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone())
            .oneshot(request)
            .await
            .expect("infallible");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&body).expect("json body"))
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn health_is_ok_before_any_connection() {
        let state = state(Arc::new(FakeConnector::failing()));
        let (status, body) = send(&state, get("/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["mcpConnected"], json!(false));
        assert_eq!(body["connectionState"], json!("uninitialized"));
        assert_eq!(body["provider"], json!("fake"));
        assert_eq!(body["activeStreams"], json!(0));
        assert!(body["endpoints"].as_array().is_some_and(|e| e.len() == 7));
    }

    #[tokio::test]
    async fn execute_without_tool_is_a_bad_request() {
        let fake = Arc::new(FakeConnector::new());
        let state = state(fake.clone());

        let (status, body) = send(&state, post("/api/execute", "{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({"success": false, "error": "Tool name is required"})
        );
        assert_eq!(fake.attempts(), 0);
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let state = state(Arc::new(FakeConnector::new()));
        let (status, body) = send(&state, post("/api/execute", "{not json")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], json!(false));
        assert!(
            body["error"]
                .as_str()
                .is_some_and(|e| e.starts_with("Malformed JSON body"))
        );
    }

    #[tokio::test]
    async fn execute_against_the_mock_provider() {
        let state = state(Arc::new(MockConnector::new()));
        let (status, body) = send(
            &state,
            post(
                "/api/execute",
                r#"{"tool":"get_products","arguments":{"limit":5}}"#,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["tool"], json!("get_products"));
        assert_eq!(body["arguments"], json!({"limit": 5}));
        assert_eq!(body["result"]["products"][0]["id"], json!(12345));
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn tools_listing_fails_with_500_when_the_provider_is_down() {
        let fake = Arc::new(FakeConnector::failing());
        let state = state(fake.clone());

        let (status, body) = send(&state, get("/api/tools")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body,
            json!({"success": false, "error": "provider unreachable"})
        );

        fake.set_failing(false);
        let (status, body) = send(&state, get("/api/tools")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tools"][0]["name"], json!("echo"));
        assert_eq!(body["tools"][0]["inputSchema"], json!({"type": "object"}));
    }

    #[tokio::test]
    async fn provider_errors_carry_the_tool_name() {
        let state = state(Arc::new(FakeConnector::new()));
        let (status, body) = send(&state, post("/api/execute", r#"{"tool":"boom"}"#)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body,
            json!({"success": false, "error": "boom failed", "tool": "boom"})
        );
    }

    #[tokio::test]
    async fn shorthand_routes_build_tool_arguments() {
        let state = state(Arc::new(FakeConnector::new()));

        let (status, body) = send(&state, post("/api/shopify/products", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"success": true, "data": {"echo": {"limit": 50}}})
        );

        let (status, body) = send(&state, post("/api/shopify/product/77", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!({"echo": {"id": 77}}));

        let (status, body) = send(
            &state,
            post(
                "/api/shopify/update-product-image",
                r#"{"product_id":"1","image_id":2,"alt":"Blue","position":""}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["data"],
            json!({"echo": {"product_id": 1, "image_id": 2, "alt": "Blue"}})
        );
    }

    #[tokio::test]
    async fn shorthand_rejects_bad_integers() {
        let fake = Arc::new(FakeConnector::new());
        let state = state(fake.clone());

        let (status, body) = send(&state, post("/api/shopify/product/abc", "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({"success": false, "error": "id must be an integer"})
        );

        let (status, _) = send(
            &state,
            post("/api/shopify/products", r#"{"limit":"many"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(fake.attempts(), 0);
    }

    #[tokio::test]
    async fn event_stream_starts_with_the_handshake() {
        let state = state(Arc::new(FakeConnector::new()));
        let response = router(state.clone())
            .oneshot(get("/mcp"))
            .await
            .expect("infallible");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert_eq!(state.streams.active_sessions(), 1);

        let mut body = response.into_body().into_data_stream();
        let chunk = futures::StreamExt::next(&mut body)
            .await
            .expect("first frame")
            .expect("bytes");
        let frame = std::str::from_utf8(&chunk).expect("utf-8");
        let payload: Value = serde_json::from_str(
            frame
                .trim()
                .strip_prefix("data: ")
                .expect("data frame"),
        )
        .expect("json");
        assert_eq!(payload["type"], json!("handshake"));
        assert_eq!(payload["protocolVersion"], json!("2024-11-05"));

        state.streams.shutdown();
        assert!(futures::StreamExt::next(&mut body).await.is_none());
    }
}
