//! Error types for the bridge.
//!
//! Only `ConfigError` (and a mapping load failure at startup) is fatal.
//! Everything else is handled where it happens: decode faults drop one
//! message, transport and publish faults fold into the reconnect path.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("cannot read mapping file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid mapping file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("mapping file {path} has the wrong shape: {reason}")]
    Shape { path: String, reason: String },
    #[error("mapping request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("display name '{name}' is used by both {first} and {second}")]
    DuplicateName {
        name: String,
        first: String,
        second: String,
    },
    #[error("display name '{name}' for tool {backend_id} is not a valid topic segment")]
    InvalidName { backend_id: String, name: String },
}

/// Per-message faults on the ingest side. Never fatal.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("topic {0} is not a backend tool topic")]
    UnknownTopic(String),
    #[error("undecodable payload on {topic}: {reason}")]
    Decode { topic: String, reason: String },
}

/// Transport and publish faults, recovered through reconnect/backoff.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("MQTT connection error: {0}")]
    Transport(#[from] rumqttc::ConnectionError),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("cannot encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}
