//! Minimal MCP stdio provider used only by the relay's integration tests.
//!
//! Speaks JSON-RPC over stdio directly (one JSON message per line) and serves a tiny product
//! catalog. With `--refuse-if-exists <path>` it exits before answering anything while `path`
//! exists, which lets tests take the provider down and bring it back.

use serde_json::{Value, json};
use std::io::{BufRead as _, Write};

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(marker) = flag_value(&args, "--refuse-if-exists")
        && std::path::Path::new(marker).exists()
    {
        eprintln!("refusing to start: {marker} exists");
        std::process::exit(1);
    }

    let mut state = CatalogState::default();
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        for message in handle_line(&mut state, &line) {
            write_json_line(&mut stdout, &message)?;
        }
    }

    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

#[derive(Default)]
struct CatalogState {
    image_updates: u64,
}

fn handle_line(state: &mut CatalogState, line: &str) -> Vec<Value> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let Ok(msg) = serde_json::from_str::<Value>(line) else {
        return Vec::new();
    };
    handle_message(state, &msg)
}

fn handle_message(state: &mut CatalogState, msg: &Value) -> Vec<Value> {
    let Some(method) = msg.get("method").and_then(Value::as_str) else {
        return Vec::new();
    };

    // Ignore notifications (no `id`).
    let Some(id) = msg.get("id").cloned() else {
        return Vec::new();
    };

    match method {
        "initialize" => vec![jsonrpc_ok(&id, &initialize_result(msg))],
        "tools/list" => vec![jsonrpc_ok(&id, &tools_list_result())],
        "tools/call" => {
            let name = msg
                .get("params")
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let arguments = msg
                .get("params")
                .and_then(|p| p.get("arguments"))
                .cloned()
                .unwrap_or_else(|| json!({}));

            // Announce a catalog change before answering.
            let mut out = Vec::new();
            if name == "refresh_catalog" {
                out.push(json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/tools/list_changed"
                }));
            }
            out.push(match tools_call_result(state, name, &arguments) {
                Ok(result) => jsonrpc_ok(&id, &result),
                Err(error) => jsonrpc_err(&id, &error),
            });
            out
        }
        "ping" => vec![jsonrpc_ok(&id, &json!({}))],
        _ => {
            let error = json!({ "code": -32601, "message": "method not found" });
            vec![jsonrpc_err(&id, &error)]
        }
    }
}

fn initialize_result(msg: &Value) -> Value {
    let protocol_version = msg
        .get("params")
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str)
        .unwrap_or("2024-11-05")
        .to_string();

    json!({
        "protocolVersion": protocol_version,
        "capabilities": { "tools": { "listChanged": true } },
        "serverInfo": { "name": "toolrelay-stdio-test-provider", "version": "0" }
    })
}

fn tools_list_result() -> Value {
    json!({
        "tools": [
            {
                "name": "get_products",
                "description": "List catalog products",
                "inputSchema": {
                    "type": "object",
                    "properties": { "limit": { "type": "number" }, "page_info": { "type": "string" } }
                }
            },
            {
                "name": "get_product",
                "description": "Fetch one product by id",
                "inputSchema": {
                    "type": "object",
                    "properties": { "id": { "type": "number" } },
                    "required": ["id"]
                }
            },
            {
                "name": "update_product_image",
                "description": "Update a product image",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "product_id": { "type": "number" },
                        "image_id": { "type": "number" },
                        "alt": { "type": "string" },
                        "position": { "type": "number" }
                    },
                    "required": ["product_id", "image_id"]
                }
            },
            {
                "name": "refresh_catalog",
                "description": "Announce a tool list change",
                "inputSchema": { "type": "object" }
            },
            {
                "name": "fail",
                "description": "Always report a tool error",
                "inputSchema": { "type": "object" }
            }
        ]
    })
}

fn text_content(body: &Value) -> Value {
    json!({ "content": [{ "type": "text", "text": body.to_string() }] })
}

fn tools_call_result(state: &mut CatalogState, name: &str, arguments: &Value) -> Result<Value, Value> {
    match name {
        "get_products" => {
            let limit = arguments.get("limit").and_then(Value::as_u64).unwrap_or(50);
            let products: Vec<Value> = (1..=limit.min(3))
                .map(|n| json!({ "id": n, "title": format!("Product {n}") }))
                .collect();
            Ok(text_content(&json!({ "products": products })))
        }
        "get_product" => {
            let id = arguments.get("id").and_then(Value::as_i64).unwrap_or_default();
            Ok(text_content(
                &json!({ "product": { "id": id, "title": format!("Product {id}") } }),
            ))
        }
        "update_product_image" => {
            state.image_updates += 1;
            Ok(text_content(&json!({
                "image": {
                    "product_id": arguments.get("product_id"),
                    "id": arguments.get("image_id"),
                    "alt": arguments.get("alt"),
                    "updates": state.image_updates
                }
            })))
        }
        "refresh_catalog" => Ok(text_content(&json!({ "refreshed": true }))),
        "fail" => Ok(json!({
            "content": [{ "type": "text", "text": "catalog is read-only" }],
            "isError": true
        })),
        _ => Err(json!({ "code": -32602, "message": format!("unknown tool: {name}") })),
    }
}

fn jsonrpc_ok(id: &Value, result: &Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn jsonrpc_err(id: &Value, error: &Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

fn write_json_line(stdout: &mut dyn Write, v: &Value) -> anyhow::Result<()> {
    writeln!(stdout, "{}", serde_json::to_string(v)?)?;
    stdout.flush()?;
    Ok(())
}
