mod common;

use common::{get_json, open_stream, post_json, start_relay_with_config};
use serde_json::json;
use std::time::Duration;

const FAST_KEEPALIVE: &str = "provider:\n  type: mock\ngateway:\n  keepAliveSecs: 1\n";

async fn wait_for_active_streams(
    client: &reqwest::Client,
    url: &str,
    expected: u64,
) -> anyhow::Result<()> {
    for _ in 0..50 {
        let (_, health) = get_json(client, url).await?;
        if health["activeStreams"].as_u64() == Some(expected) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("activeStreams never reached {expected}")
}

#[tokio::test]
async fn pings_follow_the_handshake_in_order() -> anyhow::Result<()> {
    let relay = start_relay_with_config(FAST_KEEPALIVE, &["--no-eager-connect"]).await?;
    let client = reqwest::Client::new();

    let mut events = open_stream(&client, &relay.url("/mcp")).await?;
    let handshake = events.next_json(Duration::from_secs(5)).await?;
    assert_eq!(handshake["type"], json!("handshake"));

    let first = events.next_of_type("ping", Duration::from_secs(5)).await?;
    let second = events.next_of_type("ping", Duration::from_secs(5)).await?;
    let t1 = first["timestamp"].as_str().expect("timestamp");
    let t2 = second["timestamp"].as_str().expect("timestamp");
    assert!(t1 < t2, "pings out of order: {t1} then {t2}");
    Ok(())
}

#[tokio::test]
async fn disconnected_streams_are_released() -> anyhow::Result<()> {
    let relay = start_relay_with_config(FAST_KEEPALIVE, &["--no-eager-connect"]).await?;
    let client = reqwest::Client::new();
    let health = relay.url("/health");

    for _ in 0..5 {
        let mut events = open_stream(&client, &relay.url("/mcp")).await?;
        events.next_json(Duration::from_secs(5)).await?;
        drop(events);
    }

    let mut survivor = open_stream(&client, &relay.url("/mcp")).await?;
    survivor.next_json(Duration::from_secs(5)).await?;
    wait_for_active_streams(&client, &health, 1).await?;

    // Closing the others did not disturb the survivor.
    survivor.next_of_type("ping", Duration::from_secs(5)).await?;

    drop(survivor);
    wait_for_active_streams(&client, &health, 0).await
}

#[tokio::test]
async fn connection_state_changes_reach_open_streams() -> anyhow::Result<()> {
    let relay = start_relay_with_config(FAST_KEEPALIVE, &["--no-eager-connect"]).await?;
    let client = reqwest::Client::new();

    let mut events = open_stream(&client, &relay.url("/mcp")).await?;
    events.next_json(Duration::from_secs(5)).await?;

    let (status, _) = post_json(
        &client,
        &relay.url("/api/execute"),
        &json!({"tool": "get_products"}),
    )
    .await?;
    assert!(status.is_success());

    let mut states = Vec::new();
    while states.len() < 2 {
        let event = events
            .next_of_type("notification", Duration::from_secs(5))
            .await?;
        assert_eq!(event["method"], json!("connection/state"));
        states.push(event["params"]["state"].clone());
    }
    assert_eq!(states, [json!("connecting"), json!("connected")]);
    Ok(())
}
