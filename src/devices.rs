//! Device-side collaborators: topic lookup at startup and the bus that
//! carries relay writes and virtual-control publications.
//!
//! Physical topics are written as `device/control`, the Wiren Board short
//! form. Existence is judged from what the MQTT bridge has seen: a device
//! exists once any of its controls published, a control once it published
//! a value or a `meta/type`.

use dashmap::{DashMap, DashSet};

use crate::control::{parse_number, parse_switch, ControlMeta, ControlName, ControlValue};
use crate::error::ConfigurationError;

/// Split `device/control`. The control part may itself contain spaces.
pub fn split_topic(topic: &str) -> Option<(&str, &str)> {
    let (device, control) = topic.split_once('/')?;
    if device.is_empty() || control.is_empty() {
        return None;
    }
    Some((device, control))
}

/// What is known about a physical control.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceInfo {
    /// Raw `meta/type`, when the device published one.
    pub control_type: Option<String>,
    pub value: Option<String>,
    pub error: Option<String>,
}

impl SourceInfo {
    pub fn switch_value(&self) -> bool {
        self.value.as_deref().and_then(parse_switch).unwrap_or(false)
    }

    pub fn number_value(&self) -> f64 {
        self.value.as_deref().and_then(parse_number).unwrap_or(0.0)
    }

    /// Initial mirrored value for a button: its variant follows the source
    /// type and never changes afterwards.
    pub fn button_value(&self) -> ControlValue {
        let is_switch = match self.control_type.as_deref() {
            Some("switch") | Some("pushbutton") | Some("alarm") => true,
            Some(_) => false,
            None => matches!(self.value.as_deref(), Some("true") | Some("false")),
        };
        if is_switch {
            ControlValue::Bool(self.switch_value())
        } else {
            ControlValue::Number(self.number_value())
        }
    }
}

/// Existence and metadata lookup for physical topics.
pub trait DeviceRegistry {
    fn device_exists(&self, device: &str) -> bool;

    fn source(&self, topic: &str) -> Option<SourceInfo>;

    /// Validate a configured topic and return what is known about it.
    fn resolve(&self, topic: &str) -> Result<SourceInfo, ConfigurationError> {
        let Some((device, control)) = split_topic(topic) else {
            return Err(ConfigurationError::MalformedTopic {
                topic: topic.to_string(),
            });
        };
        if !self.device_exists(device) {
            return Err(ConfigurationError::MissingDevice {
                device: device.to_string(),
                topic: topic.to_string(),
            });
        }
        self.source(topic)
            .ok_or_else(|| ConfigurationError::MissingControl {
                device: device.to_string(),
                control: control.to_string(),
                topic: topic.to_string(),
            })
    }
}

/// Registry filled from retained MQTT messages.
#[derive(Default)]
pub struct TopicCache {
    sources: DashMap<String, SourceInfo>,
    devices: DashSet<String>,
}

impl TopicCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_value(&self, topic: &str, payload: &str) {
        self.touch_device(topic);
        self.sources.entry(topic.to_string()).or_default().value = Some(payload.to_string());
    }

    /// Record a `meta/<key>` message. Only `type` and `error` matter here.
    pub fn record_meta(&self, topic: &str, key: &str, payload: &str) {
        match key {
            "type" => {
                self.touch_device(topic);
                self.sources.entry(topic.to_string()).or_default().control_type =
                    Some(payload.to_string());
            }
            "error" => {
                // Kept for when the value arrives; an error alone says nothing about existence.
                self.sources.entry(topic.to_string()).or_default().error =
                    error_from_payload(payload);
            }
            _ => {}
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    fn touch_device(&self, topic: &str) {
        if let Some((device, _)) = split_topic(topic) {
            if !self.devices.contains(device) {
                self.devices.insert(device.to_string());
            }
        }
    }
}

impl DeviceRegistry for TopicCache {
    fn device_exists(&self, device: &str) -> bool {
        self.devices.contains(device)
    }

    fn source(&self, topic: &str) -> Option<SourceInfo> {
        self.sources
            .get(topic)
            .map(|entry| entry.value().clone())
            .filter(|info| info.value.is_some() || info.control_type.is_some())
    }
}

/// Empty `meta/error` payloads clear the error.
pub fn error_from_payload(payload: &str) -> Option<String> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Outbound side effects. Every call is fire-and-forget.
pub trait DeviceBus: Send {
    /// Write a physical control (`device/control`).
    fn write(&mut self, topic: &str, value: &ControlValue);

    fn define_device(&mut self, group: &str, title: &str);

    fn define_control(&mut self, group: &str, meta: &ControlMeta);

    fn publish(&mut self, group: &str, control: ControlName, value: &ControlValue);

    fn publish_error(&mut self, group: &str, control: ControlName, error: Option<&str>);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_topic() {
        assert_eq!(split_topic("wb-mr6c_1/K3"), Some(("wb-mr6c_1", "K3")));
        assert_eq!(
            split_topic("wb-msw-v4_80/Current Motion"),
            Some(("wb-msw-v4_80", "Current Motion"))
        );
        assert_eq!(split_topic("nodevice"), None);
        assert_eq!(split_topic("/K3"), None);
        assert_eq!(split_topic("dev/"), None);
    }

    #[test]
    fn test_resolve_distinguishes_missing_device_and_control() {
        let cache = TopicCache::new();
        cache.record_value("wb-mr6c_1/K3", "1");

        assert!(cache.resolve("wb-mr6c_1/K3").is_ok());
        assert!(matches!(
            cache.resolve("wb-mr6c_1/K9"),
            Err(ConfigurationError::MissingControl { .. })
        ));
        assert!(matches!(
            cache.resolve("wb-mr6c_2/K3"),
            Err(ConfigurationError::MissingDevice { .. })
        ));
        assert!(matches!(
            cache.resolve("garbage"),
            Err(ConfigurationError::MalformedTopic { .. })
        ));
    }

    #[test]
    fn test_meta_type_alone_registers_control() {
        let cache = TopicCache::new();
        cache.record_meta("testButton/Input 1", "type", "switch");
        let info = cache.resolve("testButton/Input 1").unwrap();
        assert_eq!(info.control_type.as_deref(), Some("switch"));
        assert_eq!(info.value, None);
    }

    #[test]
    fn test_error_meta_set_and_cleared() {
        let cache = TopicCache::new();
        cache.record_value("wb-mr6c_1/K3", "0");
        cache.record_meta("wb-mr6c_1/K3", "error", "r");
        assert_eq!(cache.source("wb-mr6c_1/K3").unwrap().error.as_deref(), Some("r"));
        cache.record_meta("wb-mr6c_1/K3", "error", "");
        assert_eq!(cache.source("wb-mr6c_1/K3").unwrap().error, None);
    }

    #[test]
    fn test_error_before_value_kept_but_not_existence() {
        let cache = TopicCache::new();
        cache.record_value("wb-msw-v4_80/Temperature", "21");
        cache.record_meta("wb-msw-v4_80/Current Motion", "error", "r");
        assert!(cache.source("wb-msw-v4_80/Current Motion").is_none());
        assert!(matches!(
            cache.resolve("wb-msw-v4_80/Current Motion"),
            Err(ConfigurationError::MissingControl { .. })
        ));
        cache.record_meta("wb-gpio/Input 1", "error", "r");
        assert!(!cache.device_exists("wb-gpio"));

        cache.record_value("wb-msw-v4_80/Current Motion", "0");
        let info = cache.resolve("wb-msw-v4_80/Current Motion").unwrap();
        assert_eq!(info.error.as_deref(), Some("r"));
        assert_eq!(info.value.as_deref(), Some("0"));
    }

    #[test]
    fn test_button_value_follows_source_type() {
        let switch = SourceInfo {
            control_type: Some("switch".to_string()),
            value: Some("1".to_string()),
            error: None,
        };
        assert_eq!(switch.button_value(), ControlValue::Bool(true));

        let counter = SourceInfo {
            control_type: Some("value".to_string()),
            value: Some("42".to_string()),
            error: None,
        };
        assert_eq!(counter.button_value(), ControlValue::Number(42.0));

        let untyped = SourceInfo {
            control_type: None,
            value: Some("1".to_string()),
            error: None,
        };
        assert_eq!(untyped.button_value(), ControlValue::Number(1.0));
    }
}
