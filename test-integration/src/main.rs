//! Live smoke test against a running bridge.
//!
//! Publishes one "active" event for a mapped tool on the ingest broker and
//! waits for the trimmed message on the display broker.
//!
//! Env: INGEST_MQTT_HOST/PORT, DISPLAY_MQTT_HOST/PORT, SMOKE_TOOL_ID,
//! SMOKE_DISPLAY_NAME, BACKEND_PREFIX, DISPLAY_PREFIX.

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Deserialize;
use tokio::time::{timeout, Duration, Instant};

const WAIT_FOR: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct DisplayMessage {
    user_name: String,
    event_type: String,
    in_use: bool,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn port(key: &str, default: u16) -> Result<u16> {
    match std::env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("{key} is not a port: {v}")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let tool_id = env_or("SMOKE_TOOL_ID", "113");
    let display_name = env_or("SMOKE_DISPLAY_NAME", "aja2-evap");
    let backend_prefix = env_or("BACKEND_PREFIX", "nemo/backend");
    let display_prefix = env_or("DISPLAY_PREFIX", "nemo/esp32");
    let display_topic = format!("{display_prefix}/{display_name}/status");

    // display side first so the retained + live message is seen
    let mut display_opts = MqttOptions::new(
        "nemo-smoke-display",
        env_or("DISPLAY_MQTT_HOST", "127.0.0.1"),
        port("DISPLAY_MQTT_PORT", 1883)?,
    );
    display_opts.set_keep_alive(Duration::from_secs(30));
    let (display, mut display_loop) = AsyncClient::new(display_opts, 10);
    display.subscribe(&display_topic, QoS::AtLeastOnce).await?;

    let mut ingest_opts = MqttOptions::new(
        "nemo-smoke-ingest",
        env_or("INGEST_MQTT_HOST", "127.0.0.1"),
        port("INGEST_MQTT_PORT", 1886)?,
    );
    ingest_opts.set_keep_alive(Duration::from_secs(30));
    let (ingest, mut ingest_loop) = AsyncClient::new(ingest_opts, 10);
    tokio::spawn(async move {
        loop {
            if let Err(e) = ingest_loop.poll().await {
                warn!("ingest broker error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    let started = chrono::Utc::now().to_rfc3339();
    let event = serde_json::json!({
        "id": tool_id,
        "name": "smoke",
        "status": "active",
        "operational": true,
        "problematic": false,
        "timestamp": started,
        "user": {"name": "Smoke Test", "username": "smoke", "id": "0"},
        "usage": {"start_time": started, "usage_id": "smoke-1"}
    });
    let ingest_topic = format!("{backend_prefix}/tools/{tool_id}/status");
    ingest
        .publish(&ingest_topic, QoS::AtLeastOnce, false, serde_json::to_vec(&event)?)
        .await?;
    info!("published smoke event to {}", ingest_topic);

    let deadline = Instant::now() + WAIT_FOR;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let polled = match timeout(remaining, display_loop.poll()).await {
            Ok(polled) => polled,
            Err(_) => bail!("no message on {} within {:?}", display_topic, WAIT_FOR),
        };
        match polled {
            Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == display_topic => {
                let msg: DisplayMessage = serde_json::from_slice(&p.payload)?;
                debug!("received {:?}", msg);
                if msg.in_use && msg.user_name == "Smoke Test" {
                    info!("bridge OK: {} -> {} ({})", tool_id, display_topic, msg.event_type);
                    return Ok(());
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("display broker error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
