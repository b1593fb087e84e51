use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::UtcOffset;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BridgeConfig {
    pub ingest: MqttConf,
    pub display: MqttConf,
    pub topics: TopicsConfig,
    pub mapping: MappingConf,
    pub display_format: DisplayFormatConf,
    pub heartbeat_interval_secs: u64,
    pub aggregate_interval_secs: u64,
    pub reconnect: ReconnectConf,
    pub timeouts: TimeoutConf,
    pub queue_capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TopicsConfig {
    pub backend_prefix: String,
    pub display_prefix: String,
    pub bridge_status_prefix: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct MappingConf {
    pub file: Option<PathBuf>,
    pub url: Option<String>,
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DisplayFormatConf {
    pub timezone_offset_hours: i8,
    pub max_name_length: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReconnectConf {
    pub initial_secs: u64,
    pub max_secs: u64,
    pub stable_after_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TimeoutConf {
    pub connect_secs: u64,
    pub publish_secs: u64,
}

fn default_keep_alive() -> u64 {
    30
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ingest: MqttConf {
                host: "localhost".into(),
                port: 1886,
                client_id: "nemo-bridge-ingest".into(),
                keep_alive_secs: default_keep_alive(),
                username: None,
                password: None,
            },
            display: MqttConf {
                host: "localhost".into(),
                port: 1883,
                client_id: "nemo-bridge-display".into(),
                keep_alive_secs: default_keep_alive(),
                username: None,
                password: None,
            },
            topics: TopicsConfig::default(),
            mapping: MappingConf {
                file: Some(PathBuf::from("tool_mappings.yaml")),
                url: None,
                token: None,
            },
            display_format: DisplayFormatConf::default(),
            heartbeat_interval_secs: 30,
            aggregate_interval_secs: 60,
            reconnect: ReconnectConf::default(),
            timeouts: TimeoutConf::default(),
            queue_capacity: 256,
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            backend_prefix: "nemo/backend".into(),
            display_prefix: "nemo/esp32".into(),
            bridge_status_prefix: "nemo/bridge".into(),
        }
    }
}

impl Default for DisplayFormatConf {
    fn default() -> Self {
        Self {
            timezone_offset_hours: -7,
            max_name_length: 14,
        }
    }
}

impl Default for ReconnectConf {
    fn default() -> Self {
        Self {
            initial_secs: 2,
            max_secs: 60,
            stable_after_secs: 30,
        }
    }
}

impl Default for TimeoutConf {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            publish_secs: 5,
        }
    }
}

impl DisplayFormatConf {
    pub fn utc_offset(&self) -> UtcOffset {
        // validate() keeps the hours within range
        UtcOffset::from_hms(self.timezone_offset_hours, 0, 0).unwrap_or(UtcOffset::UTC)
    }
}

impl ReconnectConf {
    pub fn initial(&self) -> Duration {
        Duration::from_secs(self.initial_secs)
    }
    pub fn max(&self) -> Duration {
        Duration::from_secs(self.max_secs)
    }
    pub fn stable_after(&self) -> Duration {
        Duration::from_secs(self.stable_after_secs)
    }
}

impl TimeoutConf {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
    pub fn publish(&self) -> Duration {
        Duration::from_secs(self.publish_secs)
    }
}

impl BridgeConfig {
    /// Loads `NEMO_BRIDGE_CONFIG` (default `bridge.yaml`), applies environment
    /// overrides and validates. Any failure here is fatal.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("NEMO_BRIDGE_CONFIG").ok();
        let path = explicit.clone().unwrap_or_else(|| "bridge.yaml".into());

        let mut cfg = if Path::new(&path).exists() || explicit.is_some() {
            Self::from_file(&path)?
        } else {
            tracing::info!("no {path}, using default configuration");
            Self::default()
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let txt = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&txt).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Environment overrides, same names as the facility's `.env` files.
    pub fn apply_env<F>(&mut self, get: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        apply_mqtt_env(&mut self.ingest, "INGEST", &get)?;
        apply_mqtt_env(&mut self.display, "DISPLAY", &get)?;
        if let Some(file) = get("TOOL_MAPPINGS") {
            self.mapping.file = Some(PathBuf::from(file));
        }
        if let Some(url) = get("TOOL_MAPPINGS_URL") {
            self.mapping.url = Some(url);
        }
        if let Some(token) = get("NEMO_TOKEN") {
            self.mapping.token = Some(token);
        }
        if let Some(tz) = get("TIMEZONE_OFFSET_HOURS") {
            self.display_format.timezone_offset_hours = tz
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("TIMEZONE_OFFSET_HOURS", format!("'{tz}' is not an integer")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_mqtt(&self.ingest, "ingest")?;
        validate_mqtt(&self.display, "display")?;
        if self.ingest.client_id == self.display.client_id
            && self.ingest.host == self.display.host
            && self.ingest.port == self.display.port
        {
            return Err(ConfigError::invalid(
                "display.client_id",
                "both connections use the same client id on the same broker",
            ));
        }

        for (field, prefix) in [
            ("topics.backend_prefix", &self.topics.backend_prefix),
            ("topics.display_prefix", &self.topics.display_prefix),
            ("topics.bridge_status_prefix", &self.topics.bridge_status_prefix),
        ] {
            if prefix.trim_matches('/').is_empty() {
                return Err(ConfigError::invalid(field, "must not be empty"));
            }
            if prefix.contains('+') || prefix.contains('#') {
                return Err(ConfigError::invalid(field, "must not contain MQTT wildcards"));
            }
        }

        match (&self.mapping.file, &self.mapping.url) {
            (None, None) => {
                return Err(ConfigError::invalid("mapping", "either file or url is required"));
            }
            (_, Some(url)) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                return Err(ConfigError::invalid("mapping.url", format!("'{url}' is not an http(s) URL")));
            }
            (Some(file), None) if !file.exists() => {
                return Err(ConfigError::invalid(
                    "mapping.file",
                    format!("{} does not exist", file.display()),
                ));
            }
            _ => {}
        }

        if !(-14..=14).contains(&self.display_format.timezone_offset_hours) {
            return Err(ConfigError::invalid(
                "display_format.timezone_offset_hours",
                "must be within -14..=14",
            ));
        }
        if self.display_format.max_name_length == 0 {
            return Err(ConfigError::invalid("display_format.max_name_length", "must be positive"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::invalid("heartbeat_interval_secs", "must be positive"));
        }
        if self.aggregate_interval_secs == 0 {
            return Err(ConfigError::invalid("aggregate_interval_secs", "must be positive"));
        }
        if self.reconnect.initial_secs == 0 || self.reconnect.initial_secs > self.reconnect.max_secs {
            return Err(ConfigError::invalid(
                "reconnect",
                format!(
                    "need 0 < initial_secs ({}) <= max_secs ({})",
                    self.reconnect.initial_secs, self.reconnect.max_secs
                ),
            ));
        }
        if self.timeouts.connect_secs == 0 || self.timeouts.publish_secs == 0 {
            return Err(ConfigError::invalid("timeouts", "must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity", "must be positive"));
        }
        Ok(())
    }
}

fn apply_mqtt_env<F>(conf: &mut MqttConf, side: &str, get: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = get(&format!("{side}_MQTT_HOST")) {
        conf.host = host;
    }
    if let Some(port) = get(&format!("{side}_MQTT_PORT")) {
        conf.port = port
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid("MQTT_PORT", format!("{side}: '{port}' is not a port")))?;
    }
    if let Some(user) = get(&format!("{side}_MQTT_USERNAME")) {
        conf.username = Some(user);
    }
    if let Some(pass) = get(&format!("{side}_MQTT_PASSWORD")) {
        conf.password = Some(pass);
    }
    Ok(())
}

fn validate_mqtt(conf: &MqttConf, side: &'static str) -> Result<(), ConfigError> {
    if conf.host.trim().is_empty() {
        return Err(ConfigError::invalid(side, "broker host is empty"));
    }
    if conf.port == 0 {
        return Err(ConfigError::invalid(side, "broker port is 0"));
    }
    if conf.client_id.trim().is_empty() {
        return Err(ConfigError::invalid(side, "client_id is empty"));
    }
    if conf.keep_alive_secs < 5 {
        return Err(ConfigError::invalid(side, "keep_alive_secs must be at least 5"));
    }
    if conf.username.is_none() && conf.password.is_some() {
        return Err(ConfigError::invalid(side, "password given without username"));
    }
    Ok(())
}
