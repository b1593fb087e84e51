//! Facility-wide counts published to `<display>/overall`.

use crate::models::{OverallStatusSnapshot, ToolStatus};
use crate::publisher::{send_with_timeout, DisplaySink};
use crate::store::StatusStore;
use crate::topics::Topics;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

/// A problematic tool is never counted as active or available, even while a
/// session is open on it. `active + available + problematic == total`.
pub fn compute(tools: &[Arc<ToolStatus>], now: OffsetDateTime) -> OverallStatusSnapshot {
    let total = tools.len();
    let problematic = tools.iter().filter(|t| t.problematic).count();
    let active = tools.iter().filter(|t| t.in_use() && !t.problematic).count();
    OverallStatusSnapshot {
        total_tools: total,
        active_tools: active,
        available_tools: total.saturating_sub(active + problematic),
        problematic_tools: problematic,
        generated_at: now,
    }
}

pub struct Aggregator<S> {
    sink: S,
    store: Arc<StatusStore>,
    topic: String,
    interval: Duration,
    publish_timeout: Duration,
    trigger: Arc<Notify>,
    last: Option<OverallStatusSnapshot>,
}

impl<S: DisplaySink> Aggregator<S> {
    pub fn new(
        sink: S,
        store: Arc<StatusStore>,
        topics: &Topics,
        interval: Duration,
        publish_timeout: Duration,
        trigger: Arc<Notify>,
    ) -> Self {
        Self {
            sink,
            store,
            topic: topics.display_overall(),
            interval,
            publish_timeout,
            trigger,
            last: None,
        }
    }

    /// Recomputes and publishes. When `only_if_changed` is set, identical
    /// counts are not republished. Returns whether anything went out.
    pub async fn publish(&mut self, only_if_changed: bool) -> bool {
        let snapshot = compute(&self.store.snapshot_all(), OffsetDateTime::now_utc());
        if only_if_changed && self.last.is_some_and(|last| last.same_counts(&snapshot)) {
            return false;
        }
        let payload = match serde_json::to_vec(&snapshot) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode overall snapshot");
                return false;
            }
        };
        match send_with_timeout(&self.sink, self.topic.clone(), payload, true, self.publish_timeout).await {
            Ok(()) => {
                debug!(
                    total = snapshot.total_tools,
                    active = snapshot.active_tools,
                    problematic = snapshot.problematic_tools,
                    "overall status published"
                );
                self.last = Some(snapshot);
                true
            }
            Err(e) => {
                // retried on the next tick
                warn!(error = %e, "overall status publish failed");
                false
            }
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let trigger = self.trigger.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.publish(false).await;
                }
                _ = trigger.notified() => {
                    self.publish(true).await;
                }
            }
        }
        debug!("aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, UsageSession};
    use crate::store::tests::status;
    use nemo_devkit::MockMqttClient;
    use time::macros::datetime;

    fn now() -> OffsetDateTime {
        datetime!(2025-01-15 18:00 UTC)
    }

    fn tool(id: &str, in_use: bool, problematic: bool) -> Arc<ToolStatus> {
        let mut s = status(id, now());
        if in_use {
            s.event_type = EventType::InUse;
            s.usage = Some(UsageSession {
                start_time: now(),
                start_time_formatted: String::new(),
                usage_id: String::new(),
            });
        }
        s.problematic = problematic;
        Arc::new(s)
    }

    #[test]
    fn test_counts_partition_total() {
        let tools = vec![
            tool("1", true, false),
            tool("2", false, false),
            tool("3", false, true),
            tool("4", true, true),
            tool("5", false, false),
        ];
        let snap = compute(&tools, now());
        assert_eq!(snap.total_tools, 5);
        assert_eq!(snap.active_tools, 1);
        assert_eq!(snap.problematic_tools, 2);
        assert_eq!(snap.available_tools, 2);
        assert_eq!(
            snap.active_tools + snap.available_tools + snap.problematic_tools,
            snap.total_tools
        );
    }

    #[test]
    fn test_empty_store() {
        let snap = compute(&[], now());
        assert_eq!(snap.total_tools, 0);
        assert_eq!(snap.available_tools, 0);
    }

    #[test]
    fn test_disabled_tool_counts_as_available() {
        let mut s = status("1", now());
        s.event_type = EventType::Disabled;
        s.operational = false;
        let snap = compute(&[Arc::new(s)], now());
        assert_eq!(snap.available_tools, 1);
    }

    #[tokio::test]
    async fn test_publish_only_when_counts_change() {
        let client = MockMqttClient::new();
        let store = Arc::new(StatusStore::new());
        store.upsert(status("1", now()));
        let topics = Topics::new("backend", "esp32", "nemo/bridge");
        let mut agg = Aggregator::new(
            client.clone(),
            store.clone(),
            &topics,
            Duration::from_secs(60),
            Duration::from_secs(1),
            Arc::new(Notify::new()),
        );

        assert!(agg.publish(true).await);
        assert!(!agg.publish(true).await);
        store.upsert(status("2", now()));
        assert!(agg.publish(true).await);
        // the periodic path always republishes
        assert!(agg.publish(false).await);

        let messages = client.find_messages_by_topic("esp32/overall");
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.retain));
        let last: serde_json::Value = client.get_last_json_message("esp32/overall").unwrap().unwrap();
        assert_eq!(last["total_tools"], 2);
        assert_eq!(last["available_tools"], 2);
        assert!(last["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_failed_publish_is_retried() {
        let client = MockMqttClient::new();
        let store = Arc::new(StatusStore::new());
        store.upsert(status("1", now()));
        let topics = Topics::new("backend", "esp32", "nemo/bridge");
        let mut agg = Aggregator::new(
            client.clone(),
            store,
            &topics,
            Duration::from_secs(60),
            Duration::from_secs(1),
            Arc::new(Notify::new()),
        );
        client.set_fail_publishes(true);
        assert!(!agg.publish(true).await);
        client.set_fail_publishes(false);
        assert!(agg.publish(true).await);
    }
}
