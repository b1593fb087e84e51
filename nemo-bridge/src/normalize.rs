//! Raw backend event -> canonical `ToolStatus`.
//!
//! This is the only place that looks at untyped JSON. Two payload shapes
//! arrive on the ingest side:
//!
//! - the canonical one: `{id, name, status, category, operational,
//!   problematic, timestamp, user: {..}|null, usage: {..}|null}`
//! - the facility's native usage events: `{event: "tool_usage_start", usage_id,
//!   user_id, user_name, tool_id, tool_name, start_time, end_time}`
//!
//! Missing or oddly typed fields fall back to defaults; nothing here rejects
//! an event.

use crate::models::{EventType, ToolIdentity, ToolStatus, UsageSession, UserRef};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const LONG_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[month repr:short] [day], [year] at [hour repr:12]:[minute] [period]");
const SHORT_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[month repr:short] [day], [hour repr:12]:[minute] [period]");
const NAIVE_FORMATS: &[&[BorrowedFormatItem<'static>]] = &[
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]"),
];

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    offset: UtcOffset,
}

impl Normalizer {
    /// `offset` is the facility's local offset: used to render times and to
    /// read timestamps that carry no offset of their own.
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    pub fn normalize(&self, identity: &ToolIdentity, raw: &Value, received_at: OffsetDateTime) -> ToolStatus {
        let event_label = event_label(raw);
        let event_type = classify(&event_label);
        let active = event_type == EventType::InUse || flag(raw, "in_use") == Some(true);

        let source_time = ["timestamp", "end_time", "start_time"]
            .iter()
            .find_map(|key| text(raw, key).and_then(|s| parse_timestamp(&s, self.offset)));
        let observed_at = source_time.unwrap_or(received_at);

        let (user, usage) = if active {
            let usage = self.usage(raw, observed_at);
            (Some(user_ref(raw)), Some(usage))
        } else {
            (None, None)
        };

        let last_user = if !active && event_type == EventType::Idle {
            Some(user_ref(raw).name).filter(|n| !n.is_empty())
        } else {
            None
        };

        let since = usage.as_ref().map(|u| u.start_time).unwrap_or(observed_at);

        let category = if identity.category.is_empty() {
            text(raw, "category").unwrap_or_default()
        } else {
            identity.category.clone()
        };

        ToolStatus {
            backend_id: identity.backend_id.clone(),
            display_name: identity.display_name.clone(),
            category,
            event_type,
            event_label,
            operational: flag(raw, "operational").unwrap_or(event_type != EventType::Disabled),
            problematic: flag(raw, "problematic").unwrap_or(false),
            user,
            usage,
            last_user,
            since_formatted: format_short(since, self.offset),
            observed_at,
            source_timed: source_time.is_some(),
        }
    }

    fn usage(&self, raw: &Value, observed_at: OffsetDateTime) -> UsageSession {
        let nested = raw.get("usage").filter(|u| u.is_object());
        let field = |key: &str| nested.and_then(|u| text(u, key)).or_else(|| text(raw, key));

        let start_time = field("start_time")
            .and_then(|s| parse_timestamp(&s, self.offset))
            .unwrap_or(observed_at);
        UsageSession {
            start_time,
            start_time_formatted: format_long(start_time, self.offset),
            usage_id: field("usage_id").unwrap_or_default(),
        }
    }
}

/// Lower-cased event name with the native `tool_usage_` / `tool_` prefix removed.
fn event_label(raw: &Value) -> String {
    let label = ["event_type", "status", "event"]
        .iter()
        .find_map(|key| text(raw, key))
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    let label = label
        .strip_prefix("tool_usage_")
        .or_else(|| label.strip_prefix("tool_"))
        .unwrap_or(&label);
    label.to_string()
}

pub fn classify(label: &str) -> EventType {
    match label {
        "in_use" | "in use" | "inuse" | "active" | "start" | "started" | "busy" => EventType::InUse,
        "idle" | "end" | "ended" | "available" | "free" => EventType::Idle,
        "enabled" => EventType::Enabled,
        "disabled" | "offline" | "maintenance" | "shutdown" => EventType::Disabled,
        _ => EventType::Unknown,
    }
}

fn user_ref(raw: &Value) -> UserRef {
    let nested = raw.get("user").filter(|u| u.is_object());
    match nested {
        Some(u) => {
            let name = text(u, "name").unwrap_or_else(|| {
                let first = text(u, "first_name").unwrap_or_default();
                let last = text(u, "last_name").unwrap_or_default();
                format!("{first} {last}").trim().to_string()
            });
            UserRef {
                name,
                username: text(u, "username").unwrap_or_default(),
                id: text(u, "id").unwrap_or_default(),
            }
        }
        None => UserRef {
            name: text(raw, "user_name").unwrap_or_default(),
            username: text(raw, "username").unwrap_or_default(),
            id: text(raw, "user_id").unwrap_or_default(),
        },
    }
}

/// String or number field as text; empty strings count as missing.
fn text(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn flag(v: &Value, key: &str) -> Option<bool> {
    match v.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// RFC 3339 timestamps keep their offset; naive ones are local facility time.
pub fn parse_timestamp(s: &str, local: UtcOffset) -> Option<OffsetDateTime> {
    let s = s.trim();
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(dt);
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| PrimitiveDateTime::parse(s, fmt).ok())
        .map(|dt| dt.assume_offset(local))
}

/// `Jan 15, 2025 at 10:30 AM`
pub fn format_long(dt: OffsetDateTime, local: UtcOffset) -> String {
    dt.to_offset(local).format(LONG_FORMAT).unwrap_or_default()
}

/// `Jan 15, 10:30 AM`
pub fn format_short(dt: OffsetDateTime, local: UtcOffset) -> String {
    dt.to_offset(local).format(SHORT_FORMAT).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::{datetime, offset};

    fn identity() -> ToolIdentity {
        ToolIdentity {
            backend_id: "113".into(),
            display_name: "aja2-evap".into(),
            category: String::new(),
        }
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(offset!(-7))
    }

    fn received() -> OffsetDateTime {
        datetime!(2025-01-15 18:00:00 UTC)
    }

    fn active_event() -> Value {
        json!({
            "id": "113",
            "name": "woollam",
            "status": "active",
            "category": "Characterization",
            "operational": true,
            "problematic": false,
            "timestamp": "2025-01-15T10:31:00",
            "user": {"name": "John Doe", "username": "jdoe", "id": 42},
            "usage": {"start_time": "2025-01-15T10:30:00", "start_time_formatted": "ignored", "usage_id": "u-7"}
        })
    }

    #[test]
    fn test_active_canonical_event() {
        let status = normalizer().normalize(&identity(), &active_event(), received());
        assert_eq!(status.event_type, EventType::InUse);
        assert_eq!(status.event_label, "active");
        assert_eq!(status.display_name, "aja2-evap");
        assert_eq!(status.category, "Characterization");
        let user = status.user.as_ref().unwrap();
        assert_eq!(user.name, "John Doe");
        assert_eq!(user.id, "42");
        let usage = status.usage.as_ref().unwrap();
        assert_eq!(usage.start_time_formatted, "Jan 15, 2025 at 10:30 AM");
        assert_eq!(usage.usage_id, "u-7");
        assert_eq!(status.since_formatted, "Jan 15, 10:30 AM");
        assert_eq!(status.observed_at, datetime!(2025-01-15 10:31:00 -7));
        assert!(status.source_timed);
    }

    #[test]
    fn test_idle_event_has_no_user_or_usage() {
        let raw = json!({
            "status": "idle",
            "operational": true,
            "problematic": false,
            "user": {"name": "stale"},
            "usage": {"start_time": "2025-01-15T10:30:00"}
        });
        let status = normalizer().normalize(&identity(), &raw, received());
        assert_eq!(status.event_type, EventType::Idle);
        assert!(status.user.is_none());
        assert!(status.usage.is_none());
        assert_eq!(status.observed_at, received());
        assert!(!status.source_timed);
    }

    #[test]
    fn test_in_use_flag_alone_marks_active() {
        let raw = json!({"status": "enabled", "in_use": true});
        let status = normalizer().normalize(&identity(), &raw, received());
        assert_eq!(status.event_type, EventType::Enabled);
        assert!(status.user.is_some());
        assert!(status.usage.is_some());
        assert_eq!(status.usage.unwrap().start_time, received());
    }

    #[test]
    fn test_unrecognized_type_maps_to_unknown() {
        let raw = json!({"status": "exploded"});
        let status = normalizer().normalize(&identity(), &raw, received());
        assert_eq!(status.event_type, EventType::Unknown);
        assert_eq!(status.event_label, "exploded");

        let status = normalizer().normalize(&identity(), &json!({}), received());
        assert_eq!(status.event_type, EventType::Unknown);
        assert!(status.operational);
        assert!(!status.problematic);
    }

    #[test]
    fn test_native_start_and_end_events() {
        let start = json!({
            "event": "tool_usage_start",
            "usage_id": 235,
            "user_id": 1,
            "user_name": "Alex Denton (admin)",
            "tool_id": 1,
            "tool_name": "woollam",
            "start_time": "2025-10-14T19:15:14.691967+00:00",
            "end_time": null
        });
        let status = normalizer().normalize(&identity(), &start, received());
        assert_eq!(status.event_label, "start");
        assert_eq!(status.event_type, EventType::InUse);
        assert_eq!(status.user.as_ref().unwrap().name, "Alex Denton (admin)");
        assert_eq!(status.usage.as_ref().unwrap().usage_id, "235");
        assert_eq!(status.since_formatted, "Oct 14, 12:15 PM");

        let mut end = start.clone();
        end["event"] = json!("tool_usage_end");
        end["end_time"] = json!("2025-10-14T19:16:30.123456+00:00");
        let status = normalizer().normalize(&identity(), &end, received());
        assert_eq!(status.event_label, "end");
        assert_eq!(status.event_type, EventType::Idle);
        assert!(status.user.is_none());
        assert_eq!(status.last_user.as_deref(), Some("Alex Denton (admin)"));
        assert_eq!(status.since_formatted, "Oct 14, 12:16 PM");
    }

    #[test]
    fn test_native_enable_disable_labels() {
        let status = normalizer().normalize(&identity(), &json!({"event": "tool_disabled"}), received());
        assert_eq!(status.event_label, "disabled");
        assert_eq!(status.event_type, EventType::Disabled);
        assert!(!status.operational);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let n = normalizer();
        let a = n.normalize(&identity(), &active_event(), received());
        let b = n.normalize(&identity(), &active_event(), received());
        assert_eq!(a, b);
    }

    #[test]
    fn test_lenient_field_types() {
        let raw = json!({"status": "active", "problematic": "true", "operational": 0, "user": "not an object"});
        let status = normalizer().normalize(&identity(), &raw, received());
        assert!(status.problematic);
        assert!(!status.operational);
        assert_eq!(status.user, Some(UserRef::default()));
    }

    #[test]
    fn test_parse_timestamp_forms() {
        let local = offset!(-7);
        assert_eq!(
            parse_timestamp("2025-01-15T17:30:00Z", local),
            Some(datetime!(2025-01-15 17:30:00 UTC))
        );
        assert_eq!(
            parse_timestamp("2025-01-15 10:30:00", local),
            Some(datetime!(2025-01-15 10:30:00 -7))
        );
        assert_eq!(
            parse_timestamp("2025-01-15T10:30:00.250", local),
            Some(datetime!(2025-01-15 10:30:00.25 -7))
        );
        assert_eq!(parse_timestamp("yesterday", local), None);
    }

    #[test]
    fn test_pm_rendering() {
        let local = offset!(-7);
        let dt = datetime!(2025-03-02 04:05:00 UTC);
        assert_eq!(format_short(dt, local), "Mar 01, 09:05 PM");
        assert_eq!(format_long(dt, local), "Mar 01, 2025 at 09:05 PM");
    }
}
