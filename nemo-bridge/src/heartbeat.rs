//! Bridge liveness on `<bridge>/status`.
//!
//! The periodic message carries a health summary; the broker-held last will
//! and the shutdown announcement carry `status: "offline"`. All are retained
//! so a late subscriber sees the current state.

use crate::connection::{LinkHealth, LinkState};
use crate::mapping::ToolMappingTable;
use crate::publisher::{send_with_timeout, DisplaySink};
use crate::store::StatusStore;
use crate::topics::Topics;
use rumqttc::{LastWill, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkReport {
    pub state: LinkState,
    pub reconnects: u32,
}

impl From<&LinkHealth> for LinkReport {
    fn from(link: &LinkHealth) -> Self {
        Self {
            state: link.state(),
            reconnects: link.reconnects(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeHealth {
    pub status: BridgeState,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub uptime_seconds: u64,
    pub tools_tracked: usize,
    pub mappings_loaded: usize,
    pub memory_usage_mb: f32,
    pub ingest: LinkReport,
    pub display: LinkReport,
}

/// Retained offline message the display broker publishes if the bridge
/// vanishes without disconnecting.
pub fn last_will(topics: &Topics) -> LastWill {
    let payload = serde_json::json!({ "status": BridgeState::Offline }).to_string();
    LastWill::new(topics.bridge_status(), payload, QoS::AtLeastOnce, true)
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    store: Arc<StatusStore>,
    mapping: Arc<ToolMappingTable>,
    ingest: LinkHealth,
    display: LinkHealth,
}

impl HealthTracker {
    pub fn new(store: Arc<StatusStore>, mapping: Arc<ToolMappingTable>, ingest: LinkHealth, display: LinkHealth) -> Self {
        Self {
            start_time: Instant::now(),
            store,
            mapping,
            ingest,
            display,
        }
    }

    pub fn report(&self, status: BridgeState) -> BridgeHealth {
        BridgeHealth {
            status,
            timestamp: OffsetDateTime::now_utc(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            tools_tracked: self.store.len(),
            mappings_loaded: self.mapping.len(),
            memory_usage_mb: memory_usage_mb(),
            ingest: LinkReport::from(&self.ingest),
            display: LinkReport::from(&self.display),
        }
    }
}

pub struct Heartbeat<S> {
    sink: S,
    tracker: HealthTracker,
    topic: String,
    interval: Duration,
    publish_timeout: Duration,
}

impl<S: DisplaySink> Heartbeat<S> {
    pub fn new(sink: S, tracker: HealthTracker, topics: &Topics, interval: Duration, publish_timeout: Duration) -> Self {
        Self {
            sink,
            tracker,
            topic: topics.bridge_status(),
            interval,
            publish_timeout,
        }
    }

    pub async fn beat(&self, status: BridgeState) -> bool {
        let health = self.tracker.report(status);
        let payload = match serde_json::to_vec(&health) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode heartbeat");
                return false;
            }
        };
        match send_with_timeout(&self.sink, self.topic.clone(), payload, true, self.publish_timeout).await {
            Ok(()) => {
                debug!(uptime = health.uptime_seconds, tools = health.tools_tracked, status = ?status, "heartbeat published");
                true
            }
            Err(e) => {
                warn!(error = %e, "heartbeat publish failed");
                false
            }
        }
    }

    /// Publishes every interval until shutdown, then announces offline.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.beat(BridgeState::Online).await;
                }
            }
        }
        self.beat(BridgeState::Offline).await;
    }
}

/// Resident set size from /proc; 0 where unavailable.
fn memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
