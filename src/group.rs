//! In-memory model of one lighting group.
//!
//! A group owns its relays, buttons and optional motion zone. `stateGroup`
//! is derived from the relays and only ever recomputed, never assigned.

use std::ops::RangeInclusive;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::GroupConfig;
use crate::control::ControlValue;
use crate::devices::DeviceRegistry;
use crate::error::ConfigurationError;

pub const DEFAULT_TIMEOUT_MINUTES: u8 = 10;
pub const TIMEOUT_RANGE: RangeInclusive<u8> = 1..=20;
pub const DEFAULT_SENSITIVITY: u16 = 35;
pub const SENSITIVITY_RANGE: RangeInclusive<u16> = 1..=500;

/// Quiet period after the last motion reading before presence drops.
pub const MOTION_CLEAR_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayRef {
    pub topic: String,
    pub last_known_value: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ButtonRef {
    pub topic: String,
    pub value: ControlValue,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotionRef {
    pub topic: String,
    pub last_reading: f64,
    pub error: Option<String>,
}

/// Runtime-adjustable motion settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotionSettings {
    pub light_on: bool,
    pub timeout_minutes: u8,
    pub sensitivity: u16,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            light_on: false,
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            sensitivity: DEFAULT_SENSITIVITY,
        }
    }
}

impl MotionSettings {
    pub fn auto_off_delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_minutes) * 60)
    }

    pub fn set_timeout(&mut self, minutes: f64) -> u8 {
        self.timeout_minutes = clamp_to(minutes, &TIMEOUT_RANGE);
        self.timeout_minutes
    }

    pub fn set_sensitivity(&mut self, value: f64) -> u16 {
        self.sensitivity = clamp_to(value, &SENSITIVITY_RANGE);
        self.sensitivity
    }
}

fn clamp_to<T>(value: f64, range: &RangeInclusive<T>) -> T
where
    T: Copy + Into<f64> + TryFrom<i64>,
{
    let lo: f64 = (*range.start()).into();
    let hi: f64 = (*range.end()).into();
    let clamped = if value.is_nan() { lo } else { value.round().clamp(lo, hi) };
    T::try_from(clamped as i64).unwrap_or(*range.start())
}

/// Motion sensors plus everything that only exists when they do.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionZone {
    pub sensors: Vec<MotionRef>,
    pub settings: MotionSettings,
    /// The latched `motion` control. Stays true until the clear delay runs out.
    pub motion: bool,
    pub auto_off_armed: bool,
    pub motion_clear_armed: bool,
}

impl MotionZone {
    pub fn new(sensors: Vec<MotionRef>, settings: MotionSettings) -> Self {
        Self {
            sensors,
            settings,
            motion: false,
            auto_off_armed: false,
            motion_clear_armed: false,
        }
    }

    /// Any healthy sensor strictly above the sensitivity threshold.
    pub fn motion_present(&self) -> bool {
        let threshold = f64::from(self.settings.sensitivity);
        self.sensors
            .iter()
            .any(|s| s.error.is_none() && s.last_reading > threshold)
    }
}

/// Which physical input of a group an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Relay(usize),
    Button(usize),
    Motion(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: String,
    pub title: String,
    pub is_master: bool,
    pub relays: Vec<RelayRef>,
    pub buttons: Vec<ButtonRef>,
    pub motion: Option<MotionZone>,
    /// Topics dropped at construction because they do not exist.
    pub dropped: Vec<ConfigurationError>,
    state_group: bool,
}

impl Group {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        is_master: bool,
        relays: Vec<RelayRef>,
        buttons: Vec<ButtonRef>,
        motion: Option<MotionZone>,
    ) -> Self {
        let mut group = Self {
            id: id.into(),
            title: title.into(),
            is_master,
            relays,
            buttons,
            motion,
            dropped: Vec::new(),
            state_group: false,
        };
        group.recompute_state();
        group
    }

    /// Build from configuration, keeping only topics the registry knows.
    pub fn build(config: &GroupConfig, registry: &dyn DeviceRegistry) -> Group {
        let mut dropped = Vec::new();

        let relays = resolve_all(&config.relays.to_vec(), registry, &mut dropped)
            .map(|(topic, info)| RelayRef {
                last_known_value: info.switch_value(),
                error: info.error,
                topic,
            })
            .collect::<Vec<_>>();

        let buttons = resolve_all(&config.buttons.to_vec(), registry, &mut dropped)
            .map(|(topic, info)| ButtonRef {
                value: info.button_value(),
                error: info.error,
                topic,
            })
            .collect::<Vec<_>>();

        let motion = config.motion.as_ref().map(|topics| {
            let sensors = resolve_all(&topics.to_vec(), registry, &mut dropped)
                .map(|(topic, info)| MotionRef {
                    last_reading: info.number_value(),
                    error: info.error,
                    topic,
                })
                .collect::<Vec<_>>();
            let settings = MotionSettings {
                light_on: config.motion_light_on,
                timeout_minutes: config.timeout.unwrap_or(DEFAULT_TIMEOUT_MINUTES),
                sensitivity: config.sensitivity.unwrap_or(DEFAULT_SENSITIVITY),
            };
            MotionZone::new(sensors, settings)
        });

        for err in &dropped {
            tracing::error!(group = %config.id, topic = %err.topic(), "Dropping topic: {}", err);
        }

        let mut group = Group::new(
            config.id.clone(),
            config.title.clone(),
            config.master,
            relays,
            buttons,
            motion,
        );
        group.dropped = dropped;
        group
    }

    pub fn state_group(&self) -> bool {
        self.state_group
    }

    /// Recompute `stateGroup` as the OR of all relays. Returns whether it changed.
    pub(crate) fn recompute_state(&mut self) -> bool {
        let next = self.relays.iter().any(|r| r.last_known_value);
        let changed = next != self.state_group;
        self.state_group = next;
        changed
    }

    #[cfg(test)]
    pub fn motion_present(&self) -> bool {
        self.motion.as_ref().is_some_and(MotionZone::motion_present)
    }

    #[cfg(test)]
    pub fn auto_off_timer_active(&self) -> bool {
        self.motion.as_ref().is_some_and(|m| m.auto_off_armed)
    }

    #[cfg(test)]
    pub fn motion_clear_timer_active(&self) -> bool {
        self.motion.as_ref().is_some_and(|m| m.motion_clear_armed)
    }

    /// No physical button survived validation.
    pub fn button_alarm(&self) -> bool {
        self.buttons.is_empty()
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            id: self.id.clone(),
            title: self.title.clone(),
            master: self.is_master,
            state_group: self.state_group,
            qty_light: self.relays.len(),
            qty_button: self.buttons.len(),
            button_alarm: self.button_alarm(),
            relays: self.relays.clone(),
            buttons: self.buttons.clone(),
            motion: self.motion.as_ref().map(|zone| MotionSnapshot {
                motion: zone.motion,
                motion_present: zone.motion_present(),
                settings: zone.settings,
                sensors: zone.sensors.clone(),
                auto_off_timer_active: zone.auto_off_armed,
                motion_clear_timer_active: zone.motion_clear_armed,
            }),
            dropped_topics: self.dropped.iter().map(|e| e.topic().to_string()).collect(),
            updated_at: Utc::now(),
        }
    }
}

fn resolve_all<'a>(
    topics: &'a [String],
    registry: &'a dyn DeviceRegistry,
    dropped: &'a mut Vec<ConfigurationError>,
) -> impl Iterator<Item = (String, crate::devices::SourceInfo)> + 'a {
    topics.iter().filter_map(move |topic| match registry.resolve(topic) {
        Ok(info) => Some((topic.clone(), info)),
        Err(err) => {
            dropped.push(err);
            None
        }
    })
}

/// Read-only view of a group, served by the API.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub id: String,
    pub title: String,
    pub master: bool,
    pub state_group: bool,
    pub qty_light: usize,
    pub qty_button: usize,
    pub button_alarm: bool,
    pub relays: Vec<RelayRef>,
    pub buttons: Vec<ButtonRef>,
    pub motion: Option<MotionSnapshot>,
    pub dropped_topics: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MotionSnapshot {
    pub motion: bool,
    pub motion_present: bool,
    pub settings: MotionSettings,
    pub sensors: Vec<MotionRef>,
    pub auto_off_timer_active: bool,
    pub motion_clear_timer_active: bool,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn relay(topic: &str, value: bool) -> RelayRef {
        RelayRef {
            topic: topic.to_string(),
            last_known_value: value,
            error: None,
        }
    }

    pub fn sensor(topic: &str, reading: f64) -> MotionRef {
        MotionRef {
            topic: topic.to_string(),
            last_reading: reading,
            error: None,
        }
    }

    pub fn button(topic: &str) -> ButtonRef {
        ButtonRef {
            topic: topic.to_string(),
            value: ControlValue::Bool(false),
            error: None,
        }
    }

    /// Plain group over the given relay values.
    pub fn plain(values: &[bool]) -> Group {
        let relays = values
            .iter()
            .enumerate()
            .map(|(i, v)| relay(&format!("relays/K{}", i + 1), *v))
            .collect();
        Group::new("plain", "Plain", false, relays, vec![button("buttons/Input 1")], None)
    }

    pub fn master(values: &[bool]) -> Group {
        let mut group = plain(values);
        group.id = "master".to_string();
        group.is_master = true;
        group
    }

    /// Group with one relay and two motion sensors.
    pub fn with_motion() -> Group {
        let zone = MotionZone::new(
            vec![sensor("msw/Motion 1", 0.0), sensor("msw/Motion 2", 0.0)],
            MotionSettings::default(),
        );
        Group::new(
            "hall",
            "Hall",
            false,
            vec![relay("relays/K1", false)],
            vec![button("buttons/Input 1")],
            Some(zone),
        )
    }
}
