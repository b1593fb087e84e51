//! Backend feed consumer.
//!
//! Runs as a single task fed by the ingest connection's bounded queue, so
//! store writes are serialised. A bad message is logged with its topic and
//! dropped; it never ends the task and never touches the store.

use crate::error::IngestError;
use crate::mapping::ToolMappingTable;
use crate::models::BackendOverall;
use crate::normalize::Normalizer;
use crate::publisher::ChangeFeed;
use crate::store::{StatusStore, UpsertOutcome};
use crate::topics::{IngestTopic, Topics};
use rumqttc::Publish;
use serde_json::Value;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Updated { backend_id: String, display_name: String },
    Stale { backend_id: String },
    Overall,
}

pub struct IngestListener {
    topics: Topics,
    mapping: Arc<ToolMappingTable>,
    store: Arc<StatusStore>,
    normalizer: Normalizer,
    display_feed: Arc<ChangeFeed>,
    aggregate: Arc<Notify>,
}

impl IngestListener {
    pub fn new(
        topics: Topics,
        mapping: Arc<ToolMappingTable>,
        store: Arc<StatusStore>,
        normalizer: Normalizer,
        display_feed: Arc<ChangeFeed>,
        aggregate: Arc<Notify>,
    ) -> Self {
        Self {
            topics,
            mapping,
            store,
            normalizer,
            display_feed,
            aggregate,
        }
    }

    pub fn handle(&self, topic: &str, payload: &[u8], received_at: OffsetDateTime) -> Result<IngestOutcome, IngestError> {
        let kind = self
            .topics
            .parse_ingest(topic)
            .ok_or_else(|| IngestError::UnknownTopic(topic.to_string()))?;
        let raw = decode(topic, payload)?;

        match kind {
            IngestTopic::Overall => {
                self.cross_check(&raw);
                Ok(IngestOutcome::Overall)
            }
            IngestTopic::ToolStatus(backend_id) => {
                let identity = self.mapping.identity_for(&backend_id);
                let status = self.normalizer.normalize(&identity, &raw, received_at);
                match self.store.upsert(status) {
                    UpsertOutcome::Stale => {
                        debug!(%backend_id, "out-of-order event ignored");
                        Ok(IngestOutcome::Stale { backend_id })
                    }
                    _ => {
                        // single writer: the stored record is the one just upserted
                        if let Some(record) = self.store.get(&backend_id) {
                            self.display_feed.push(record);
                        }
                        self.aggregate.notify_one();
                        debug!(%backend_id, display_name = %identity.display_name, "tool status updated");
                        Ok(IngestOutcome::Updated {
                            backend_id,
                            display_name: identity.display_name,
                        })
                    }
                }
            }
        }
    }

    /// Consumes the inbound queue until the connection side drops it.
    pub async fn run(self, mut rx: mpsc::Receiver<Publish>) {
        while let Some(publish) = rx.recv().await {
            if let Err(e) = self.handle(&publish.topic, &publish.payload, OffsetDateTime::now_utc()) {
                warn!(topic = %publish.topic, error = %e, "ingest message dropped");
            }
        }
        debug!("ingest listener stopped");
    }

    fn cross_check(&self, raw: &Value) {
        let Ok(backend) = serde_json::from_value::<BackendOverall>(raw.clone()) else {
            return;
        };
        let local = self.store.len() as u64;
        if let Some(total) = backend.total_tools {
            if total != local {
                debug!(backend_total = total, local_total = local, active = ?backend.active_tools, "backend overall differs from local view");
            }
        }
    }
}

/// Brings stored records in line with a reloaded mapping. A renamed tool
/// gets its old retained topic cleared and is republished under the new name.
pub fn apply_mapping(store: &StatusStore, mapping: &ToolMappingTable, feed: &ChangeFeed) -> usize {
    let moved = store.reidentify(|backend_id| mapping.identity_for(backend_id));
    for (previous, record) in &moved {
        if *previous != record.display_name {
            info!(backend_id = %record.backend_id, from = %previous, to = %record.display_name, "tool renamed");
            feed.push_clear(previous.clone());
        }
        feed.push(record.clone());
    }
    moved.len()
}

/// Payloads must be JSON objects.
fn decode(topic: &str, payload: &[u8]) -> Result<Value, IngestError> {
    let value: Value = serde_json::from_slice(payload).map_err(|e| IngestError::Decode {
        topic: topic.to_string(),
        reason: e.to_string(),
    })?;
    if !value.is_object() {
        return Err(IngestError::Decode {
            topic: topic.to_string(),
            reason: "payload is not a JSON object".into(),
        });
    }
    Ok(value)
}
