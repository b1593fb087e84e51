//! Topic layout on both brokers.
//!
//! Ingest:  `{backend}/tools/{tool_id}/status`, `{backend}/tools/overall`
//! Display: `{display}/{display_name}/status`, `{display}/overall`
//! Bridge:  `{bridge}/status`

use crate::config::TopicsConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestTopic {
    ToolStatus(String),
    Overall,
}

#[derive(Debug, Clone)]
pub struct Topics {
    backend_prefix: String,
    display_prefix: String,
    bridge_status_prefix: String,
}

impl Topics {
    pub fn new(
        backend_prefix: impl Into<String>,
        display_prefix: impl Into<String>,
        bridge_status_prefix: impl Into<String>,
    ) -> Self {
        Self {
            backend_prefix: trim_slashes(backend_prefix.into()),
            display_prefix: trim_slashes(display_prefix.into()),
            bridge_status_prefix: trim_slashes(bridge_status_prefix.into()),
        }
    }

    pub fn from_config(cfg: &TopicsConfig) -> Self {
        Self::new(
            cfg.backend_prefix.clone(),
            cfg.display_prefix.clone(),
            cfg.bridge_status_prefix.clone(),
        )
    }

    /// Subscriptions re-issued on every ingest connection.
    pub fn ingest_subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}/tools/+/status", self.backend_prefix),
            format!("{}/tools/overall", self.backend_prefix),
        ]
    }

    /// The tool id comes from the topic path, never from the payload.
    pub fn parse_ingest(&self, topic: &str) -> Option<IngestTopic> {
        let rest = topic
            .strip_prefix(self.backend_prefix.as_str())?
            .strip_prefix("/tools/")?;
        if rest == "overall" {
            return Some(IngestTopic::Overall);
        }
        let tool_id = rest.strip_suffix("/status")?;
        if tool_id.is_empty() || tool_id.contains('/') {
            return None;
        }
        Some(IngestTopic::ToolStatus(tool_id.to_string()))
    }

    pub fn display_status(&self, display_name: &str) -> String {
        format!("{}/{}/status", self.display_prefix, display_name)
    }

    pub fn display_overall(&self) -> String {
        format!("{}/overall", self.display_prefix)
    }

    pub fn bridge_status(&self) -> String {
        format!("{}/status", self.bridge_status_prefix)
    }
}

fn trim_slashes(s: String) -> String {
    s.trim_matches('/').to_string()
}
