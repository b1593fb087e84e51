/*!
Builders for backend events as they arrive on `<backend>/tools/<id>/status`

Two shapes: the canonical status document and the facility's native
usage events (`tool_usage_start`, `tool_usage_end`, `tool_enabled`, ...).
*/

use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub struct BackendEventBuilder {
    event: Value,
}

impl BackendEventBuilder {
    /// Canonical status event without user, usage or timestamp
    pub fn tool_status<S: Into<String>>(id: S, name: S, status: S) -> Self {
        Self {
            event: json!({
                "id": id.into(),
                "name": name.into(),
                "status": status.into(),
                "category": "",
                "operational": true,
                "problematic": false,
                "user": null,
                "usage": null
            }),
        }
    }

    /// Native usage event; `start_time` is now
    pub fn usage_event<S: Into<String>>(event: S, tool_id: u64, user_name: S) -> Self {
        Self {
            event: json!({
                "event": event.into(),
                "usage_id": 1,
                "user_id": 1,
                "user_name": user_name.into(),
                "tool_id": tool_id,
                "tool_name": format!("tool-{tool_id}"),
                "start_time": chrono::Utc::now().to_rfc3339(),
                "end_time": null
            }),
        }
    }

    pub fn with_user<S: Into<String>>(mut self, name: S, username: S, id: S) -> Self {
        self.event["user"] = json!({
            "name": name.into(),
            "username": username.into(),
            "id": id.into()
        });
        self
    }

    pub fn with_usage<S: Into<String>>(mut self, start_time: S, usage_id: S) -> Self {
        let start_time = start_time.into();
        self.event["usage"] = json!({
            "start_time": start_time,
            "start_time_formatted": start_time,
            "usage_id": usage_id.into()
        });
        self
    }

    pub fn with_timestamp<S: Into<String>>(mut self, timestamp: S) -> Self {
        self.event["timestamp"] = json!(timestamp.into());
        self
    }

    pub fn with_field<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.event[key.into()] = value;
        self
    }

    pub fn problematic(self, problematic: bool) -> Self {
        self.with_field("problematic", json!(problematic))
    }

    pub fn build(self) -> Value {
        self.event
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.event).unwrap_or_default()
    }
}
