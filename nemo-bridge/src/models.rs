use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Resolved identity of one physical tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolIdentity {
    pub backend_id: String,
    pub display_name: String,
    pub category: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Enabled,
    Disabled,
    InUse,
    Idle,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub name: String,
    pub username: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSession {
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    pub start_time_formatted: String,
    pub usage_id: String,
}

/// Canonical per-tool state, owned by the status store.
///
/// `user` and `usage` are both `Some` exactly when the tool is in active use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub backend_id: String,
    pub display_name: String,
    pub category: String,
    pub event_type: EventType,
    /// Event name as the backend sent it, lower-cased (`active`, `start`, ...).
    pub event_label: String,
    pub operational: bool,
    pub problematic: bool,
    pub user: Option<UserRef>,
    pub usage: Option<UsageSession>,
    /// User named by an end-of-usage event.
    pub last_user: Option<String>,
    /// Short local rendering of the time the tool entered its current state.
    pub since_formatted: String,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    /// `observed_at` came from the event itself, not from the bridge's
    /// receipt clock. Only two source times are compared for ordering.
    pub source_timed: bool,
}

impl ToolStatus {
    pub fn in_use(&self) -> bool {
        self.usage.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OverallStatusSnapshot {
    pub total_tools: usize,
    pub active_tools: usize,
    pub available_tools: usize,
    pub problematic_tools: usize,
    #[serde(rename = "timestamp", with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

impl OverallStatusSnapshot {
    /// Same counts, ignoring when they were computed.
    pub fn same_counts(&self, other: &Self) -> bool {
        self.total_tools == other.total_tools
            && self.active_tools == other.active_tools
            && self.available_tools == other.available_tools
            && self.problematic_tools == other.problematic_tools
    }
}

/// Trimmed per-tool payload for the display nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMessage {
    pub user_name: String,
    pub user_label: String,
    pub timestamp: String,
    pub time_label: String,
    pub event_type: String,
    pub in_use: bool,
}

/// What the backend reports on its own overall topic. Only used to cross-check.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendOverall {
    #[serde(default)]
    pub total_tools: Option<u64>,
    #[serde(default)]
    pub active_tools: Option<u64>,
}
