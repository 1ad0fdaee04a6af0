//! YAML configuration: MQTT/HTTP/storage settings plus the lighting groups.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::group::{SENSITIVITY_RANGE, TIMEOUT_RANGE};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    /// How long to collect retained MQTT messages before validating topics.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

fn default_settle_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "lightgroup".to_string()
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_port() -> u16 {
    8125
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("lightgroup.db")
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// One lighting group as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub title: String,
    pub id: String,
    #[serde(default)]
    pub buttons: StringOrVec,
    pub relays: StringOrVec,
    #[serde(default)]
    pub master: bool,
    #[serde(default)]
    pub motion: Option<StringOrVec>,
    /// Initial auto-off timeout in minutes.
    #[serde(default)]
    pub timeout: Option<u8>,
    /// Initial motion sensitivity threshold.
    #[serde(default)]
    pub sensitivity: Option<u16>,
    #[serde(default)]
    pub motion_light_on: bool,
}

/// Handles YAML values that can be a single string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrVec {
    Single(String),
    Multiple(Vec<String>),
}

impl StringOrVec {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrVec::Single(s) => vec![s.clone()],
            StringOrVec::Multiple(v) => v.clone(),
        }
    }
}

impl Default for StringOrVec {
    fn default() -> Self {
        StringOrVec::Multiple(Vec::new())
    }
}

// ── Loading ──────────────────────────────────────────────

/// Load, override from the environment, and validate.
pub fn load(path: &Path) -> Result<Settings, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut settings = parse(&contents)?;
    settings.apply_env_overrides();
    settings.validate()?;
    Ok(settings)
}

pub fn parse(contents: &str) -> Result<Settings, ConfigError> {
    Ok(serde_yaml::from_str(contents)?)
}

impl Settings {
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("LIGHTGROUP_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = env_parse("LIGHTGROUP_MQTT_PORT") {
            self.mqtt.port = port;
        }
        if let Some(port) = env_parse("LIGHTGROUP_HTTP_PORT") {
            self.http.port = port;
        }
        if let Ok(path) = std::env::var("LIGHTGROUP_DB_PATH") {
            self.storage.path = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for group in &self.groups {
            if group.id.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "group {:?} has an empty id",
                    group.title
                )));
            }
            if group.id.contains('/') || group.id.contains('+') || group.id.contains('#') {
                return Err(ConfigError::Invalid(format!(
                    "group id {:?} must not contain '/', '+' or '#'",
                    group.id
                )));
            }
            if !seen.insert(group.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate group id {:?}",
                    group.id
                )));
            }
            if let Some(timeout) = group.timeout {
                if !TIMEOUT_RANGE.contains(&timeout) {
                    return Err(ConfigError::Invalid(format!(
                        "group {:?}: timeout {} outside {}..={} minutes",
                        group.id,
                        timeout,
                        TIMEOUT_RANGE.start(),
                        TIMEOUT_RANGE.end()
                    )));
                }
            }
            if let Some(sensitivity) = group.sensitivity {
                if !SENSITIVITY_RANGE.contains(&sensitivity) {
                    return Err(ConfigError::Invalid(format!(
                        "group {:?}: sensitivity {} outside {}..={}",
                        group.id,
                        sensitivity,
                        SENSITIVITY_RANGE.start(),
                        SENSITIVITY_RANGE.end()
                    )));
                }
            }
            if group.relays.to_vec().is_empty() {
                tracing::warn!(group = %group.id, "Group has no relays configured");
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
