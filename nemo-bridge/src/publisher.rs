//! Per-tool fan-out to the display broker.
//!
//! The ingest task queues every accepted record in the `ChangeFeed`; the
//! publisher task drains it in order, so each upsert reaches the display
//! broker. A slow or disconnected display broker never holds up ingest:
//! while the link is down the queue is bounded by collapsing it to the
//! newest record per tool, and a reconnect republishes the whole store.

use crate::connection::LinkState;
use crate::error::BridgeError;
use crate::models::{DisplayMessage, EventType, ToolStatus};
use crate::store::StatusStore;
use crate::topics::Topics;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

const DEFAULT_FEED_CAPACITY: usize = 256;

/// Where display-side messages go. Implemented by the MQTT client; tests
/// substitute a recording mock.
pub trait DisplaySink: Send + Sync + 'static {
    fn send(
        &self,
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send;
}

impl DisplaySink for AsyncClient {
    fn send(
        &self,
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        async move {
            AsyncClient::publish(self, topic, QoS::AtLeastOnce, retain, payload)
                .await
                .map_err(BridgeError::from)
        }
    }
}

/// Publish with the bounded publish timeout; elapsed counts as a failure.
pub async fn send_with_timeout<S: DisplaySink>(
    sink: &S,
    topic: String,
    payload: Vec<u8>,
    retain: bool,
    limit: Duration,
) -> Result<(), BridgeError> {
    tokio::time::timeout(limit, sink.send(topic, payload, retain))
        .await
        .map_err(|_| BridgeError::Timeout("publish"))?
}

#[derive(Debug, Clone)]
pub enum Pending {
    Status(Arc<ToolStatus>),
    /// Empty retained payload on a display name that is no longer mapped.
    Clear(String),
}

/// Ordered queue of display updates.
#[derive(Debug)]
pub struct ChangeFeed {
    queue: Mutex<VecDeque<Pending>>,
    capacity: usize,
    notify: Notify,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, status: Arc<ToolStatus>) {
        self.enqueue(Pending::Status(status));
    }

    pub fn push_clear(&self, display_name: String) {
        self.enqueue(Pending::Clear(display_name));
    }

    fn enqueue(&self, item: Pending) {
        {
            let mut queue = self.queue.lock();
            queue.push_back(item);
            if queue.len() > self.capacity {
                let before = queue.len();
                collapse(&mut queue);
                debug!(before, after = queue.len(), "display queue collapsed to newest per tool");
            }
        }
        self.notify.notify_one();
    }

    /// Replaces the queued records with `snapshot()`, taken under the queue
    /// lock so a concurrent push is either in the snapshot or queued after it.
    pub fn resync<F>(&self, snapshot: F) -> usize
    where
        F: FnOnce() -> Vec<Arc<ToolStatus>>,
    {
        let count = {
            let mut queue = self.queue.lock();
            queue.retain(|item| matches!(item, Pending::Clear(_)));
            let records = snapshot();
            let count = records.len();
            queue.extend(records.into_iter().map(Pending::Status));
            count
        };
        self.notify.notify_one();
        count
    }

    pub fn take(&self) -> Vec<Pending> {
        self.queue.lock().drain(..).collect()
    }

    /// Puts unsent items back ahead of anything queued since.
    pub fn requeue_front(&self, items: Vec<Pending>) {
        let mut queue = self.queue.lock();
        for item in items.into_iter().rev() {
            queue.push_front(item);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn changed(&self) {
        self.notify.notified().await
    }
}

/// Keeps the newest record per tool, in queue order. Clears are kept.
fn collapse(queue: &mut VecDeque<Pending>) {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(queue.len());
    for item in queue.drain(..).rev() {
        let keep = match &item {
            Pending::Status(status) => seen.insert(status.backend_id.clone()),
            Pending::Clear(_) => true,
        };
        if keep {
            kept.push(item);
        }
    }
    queue.extend(kept.into_iter().rev());
}

pub struct DisplayPublisher<S> {
    sink: S,
    store: Arc<StatusStore>,
    feed: Arc<ChangeFeed>,
    topics: Topics,
    max_name_length: usize,
    publish_timeout: Duration,
}

impl<S: DisplaySink> DisplayPublisher<S> {
    pub fn new(
        sink: S,
        store: Arc<StatusStore>,
        feed: Arc<ChangeFeed>,
        topics: Topics,
        max_name_length: usize,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            sink,
            store,
            feed,
            topics,
            max_name_length,
            publish_timeout,
        }
    }

    pub async fn publish_status(&self, status: &ToolStatus) -> Result<(), BridgeError> {
        let message = display_message(status, self.max_name_length);
        let topic = self.topics.display_status(&status.display_name);
        let payload = serde_json::to_vec(&message)?;
        send_with_timeout(&self.sink, topic.clone(), payload, true, self.publish_timeout).await?;
        debug!(%topic, backend_id = %status.backend_id, event = %message.event_type, "display status published");
        Ok(())
    }

    async fn publish_pending(&self, item: &Pending) -> Result<(), BridgeError> {
        match item {
            Pending::Status(status) => self.publish_status(status).await,
            Pending::Clear(display_name) => {
                let topic = self.topics.display_status(display_name);
                send_with_timeout(&self.sink, topic.clone(), Vec::new(), true, self.publish_timeout).await?;
                info!(%topic, "retained status cleared for renamed tool");
                Ok(())
            }
        }
    }

    /// Publishes everything queued, in order. On the first failure the unsent
    /// items go back to the front of the queue and the error is returned.
    pub async fn flush(&self) -> Result<usize, BridgeError> {
        let items = self.feed.take();
        for (i, item) in items.iter().enumerate() {
            if let Err(e) = self.publish_pending(item).await {
                self.feed.requeue_front(items[i..].to_vec());
                return Err(e);
            }
        }
        Ok(items.len())
    }

    /// Publisher task. Publishes only while the display link is up; every
    /// (re)connection republishes the whole store so nodes and a restarted
    /// broker catch up.
    pub async fn run(self, mut link: watch::Receiver<LinkState>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = link.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if link.borrow_and_update().is_connected() {
                        let tools = self.feed.resync(|| self.store.snapshot_all());
                        info!(tools, "display link up, resynchronising");
                    }
                    continue;
                }
                _ = self.feed.changed() => {}
            }

            if !link.borrow().is_connected() {
                // stays queued; the next Connected transition triggers a flush
                continue;
            }
            if let Err(e) = self.flush().await {
                warn!(error = %e, pending = self.feed.len(), "display publish failed, will retry");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.publish_timeout) => self.feed.notify.notify_one(),
                }
            }
        }
        debug!("display publisher stopped");
    }
}

/// Trimmed wire form for the display nodes.
pub fn display_message(status: &ToolStatus, max_name_length: usize) -> DisplayMessage {
    let (user_name, user_label) = match (&status.user, &status.last_user) {
        (Some(user), _) => (display_user_name(&user.name, max_name_length), "User"),
        (None, Some(last)) => (display_user_name(last, max_name_length), "Last User"),
        (None, None) => (String::new(), "User"),
    };
    let time_label = if status.in_use() {
        "Started"
    } else {
        match (status.event_type, status.event_label.as_str()) {
            (_, "end" | "ended") => "Ended",
            (EventType::Enabled, _) => "Enabled Since",
            (EventType::Disabled, _) => "Disabled Since",
            _ => "Since",
        }
    };
    DisplayMessage {
        user_name,
        user_label: user_label.to_string(),
        timestamp: status.since_formatted.clone(),
        time_label: time_label.to_string(),
        event_type: status.event_label.clone(),
        in_use: status.in_use(),
    }
}

/// Drops a trailing `(role)`; overlong names collapse to the first name,
/// cut to `max` characters.
pub fn display_user_name(full: &str, max: usize) -> String {
    let name = full.split('(').next().unwrap_or_default().trim();
    if name.chars().count() <= max {
        return name.to_string();
    }
    let first = name.split_whitespace().next().unwrap_or_default();
    first.chars().take(max).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{UsageSession, UserRef};
    use crate::store::tests::status;
    use nemo_devkit::MockMqttClient;
    use time::macros::datetime;

    impl DisplaySink for MockMqttClient {
        fn send(
            &self,
            topic: String,
            payload: Vec<u8>,
            retain: bool,
        ) -> impl Future<Output = Result<(), BridgeError>> + Send {
            async move {
                self.publish(topic, QoS::AtLeastOnce, retain, payload)
                    .await
                    .map_err(|e| BridgeError::Publish(e.to_string()))
            }
        }
    }

    fn in_use_status() -> ToolStatus {
        let mut s = status("113", datetime!(2025-01-15 10:31 UTC));
        s.display_name = "aja2-evap".into();
        s.event_type = EventType::InUse;
        s.event_label = "active".into();
        s.user = Some(UserRef {
            name: "John Doe".into(),
            username: "jdoe".into(),
            id: "42".into(),
        });
        s.usage = Some(UsageSession {
            start_time: datetime!(2025-01-15 10:30 UTC),
            start_time_formatted: "Jan 15, 2025 at 10:30 AM".into(),
            usage_id: "u-7".into(),
        });
        s.since_formatted = "Jan 15, 10:30 AM".into();
        s
    }

    fn publisher(client: &MockMqttClient, store: Arc<StatusStore>, feed: Arc<ChangeFeed>) -> DisplayPublisher<MockMqttClient> {
        DisplayPublisher::new(
            client.clone(),
            store,
            feed,
            Topics::new("backend", "esp32", "nemo/bridge"),
            14,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_display_message_in_use() {
        let msg = display_message(&in_use_status(), 14);
        assert_eq!(
            msg,
            DisplayMessage {
                user_name: "John Doe".into(),
                user_label: "User".into(),
                timestamp: "Jan 15, 10:30 AM".into(),
                time_label: "Started".into(),
                event_type: "active".into(),
                in_use: true,
            }
        );
    }

    #[test]
    fn test_display_message_after_end() {
        let mut s = status("1", datetime!(2025-10-14 19:16 UTC));
        s.event_label = "end".into();
        s.last_user = Some("Alex Denton (admin)".into());
        let msg = display_message(&s, 14);
        assert_eq!(msg.user_name, "Alex Denton");
        assert_eq!(msg.user_label, "Last User");
        assert_eq!(msg.time_label, "Ended");
        assert!(!msg.in_use);
    }

    #[test]
    fn test_time_labels() {
        let mut s = status("1", datetime!(2025-10-14 19:16 UTC));
        s.event_type = EventType::Disabled;
        s.event_label = "disabled".into();
        assert_eq!(display_message(&s, 14).time_label, "Disabled Since");
        s.event_type = EventType::Enabled;
        s.event_label = "enabled".into();
        assert_eq!(display_message(&s, 14).time_label, "Enabled Since");
        s.event_type = EventType::Unknown;
        assert_eq!(display_message(&s, 14).time_label, "Since");
    }

    #[test]
    fn test_user_name_trimming() {
        assert_eq!(display_user_name("Alex Denton (admin)", 14), "Alex Denton");
        assert_eq!(display_user_name("Bartholomew Fitzgerald", 14), "Bartholomew");
        assert_eq!(display_user_name("Maximiliansupercalifragilistic", 14), "Maximiliansupe");
        assert_eq!(display_user_name("", 14), "");
    }

    #[tokio::test]
    async fn test_publish_status_topic_and_payload() {
        let client = MockMqttClient::new();
        let publisher = publisher(&client, Arc::new(StatusStore::new()), Arc::new(ChangeFeed::new()));

        publisher.publish_status(&in_use_status()).await.unwrap();

        let messages = client.find_messages_by_topic("esp32/aja2-evap/status");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].retain);
        let msg: DisplayMessage = client.get_last_json_message("esp32/aja2-evap/status").unwrap().unwrap();
        assert_eq!(msg.user_name, "John Doe");
        assert_eq!(msg.event_type, "active");
        assert!(msg.in_use);
    }

    #[tokio::test]
    async fn test_every_queued_update_is_published_in_order() {
        let client = MockMqttClient::new();
        let feed = Arc::new(ChangeFeed::new());
        let publisher = publisher(&client, Arc::new(StatusStore::new()), feed.clone());

        let started = in_use_status();
        let mut ended = in_use_status();
        ended.event_type = EventType::Idle;
        ended.event_label = "end".into();
        ended.user = None;
        ended.usage = None;
        ended.last_user = Some("John Doe".into());
        feed.push(Arc::new(started));
        feed.push(Arc::new(ended));

        assert_eq!(publisher.flush().await.unwrap(), 2);
        let events: Vec<String> = client
            .find_messages_by_topic("esp32/aja2-evap/status")
            .iter()
            .map(|m| serde_json::from_slice::<DisplayMessage>(&m.payload).unwrap().event_type)
            .collect();
        assert_eq!(events, ["active", "end"]);
    }

    #[test]
    fn test_overflow_keeps_newest_per_tool() {
        let feed = ChangeFeed::with_capacity(3);
        let at = datetime!(2025-01-15 10:31 UTC);
        let mut first = status("113", at);
        first.event_label = "start".into();
        let mut second = status("113", at);
        second.event_label = "end".into();
        feed.push(Arc::new(first));
        feed.push_clear("old-name".into());
        feed.push(Arc::new(status("200", at)));
        feed.push(Arc::new(second));

        let queued = feed.take();
        assert_eq!(queued.len(), 3);
        assert!(matches!(&queued[0], Pending::Clear(name) if name == "old-name"));
        assert!(matches!(&queued[1], Pending::Status(s) if s.backend_id == "200"));
        assert!(matches!(&queued[2], Pending::Status(s) if s.event_label == "end"));
    }

    #[tokio::test]
    async fn test_clear_sends_empty_retained_payload() {
        let client = MockMqttClient::new();
        let feed = Arc::new(ChangeFeed::new());
        let publisher = publisher(&client, Arc::new(StatusStore::new()), feed.clone());
        feed.push_clear("old-name".into());

        assert_eq!(publisher.flush().await.unwrap(), 1);
        let messages = client.find_messages_by_topic("esp32/old-name/status");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].retain);
        assert!(messages[0].payload.is_empty());
    }

    #[tokio::test]
    async fn test_failed_flush_requeues() {
        let client = MockMqttClient::new();
        let feed = Arc::new(ChangeFeed::new());
        feed.push(Arc::new(in_use_status()));
        feed.push(Arc::new(status("200", datetime!(2025-01-15 10:31 UTC))));
        let publisher = publisher(&client, Arc::new(StatusStore::new()), feed.clone());

        client.set_fail_publishes(true);
        assert!(publisher.flush().await.is_err());
        assert_eq!(feed.len(), 2);
        assert!(client.get_published_messages().is_empty());

        client.set_fail_publishes(false);
        assert_eq!(publisher.flush().await.unwrap(), 2);
        assert!(feed.is_empty());
        let topics: Vec<String> = client.get_published_messages().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, ["esp32/aja2-evap/status", "esp32/tool-200/status"]);
    }

    #[tokio::test]
    async fn test_run_waits_for_link_then_resyncs() {
        let client = MockMqttClient::new();
        let store = Arc::new(StatusStore::new());
        let feed = Arc::new(ChangeFeed::new());
        store.upsert(in_use_status());

        let (link_tx, link_rx) = watch::channel(LinkState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(publisher(&client, store, feed.clone()).run(link_rx, stop_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.get_published_messages().is_empty());

        link_tx.send(LinkState::Connected).unwrap();
        let mut published = false;
        for _ in 0..100 {
            if !client.find_messages_by_topic("esp32/aja2-evap/status").is_empty() {
                published = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(published);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
