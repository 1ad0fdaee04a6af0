//! Virtual control names, values and metadata.
//!
//! Every group is exposed as one virtual device whose controls follow the
//! Wiren Board naming: `stateGroup`, `button`, `light_<i>`, `Button_<i>`,
//! `motion_<i>` and friends. Switch payloads travel as `"1"` / `"0"`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A control value. Switch-like controls carry booleans, everything else a
/// number. The variant of a mirrored source is fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    Bool(bool),
    Number(f64),
}

impl ControlValue {
    pub fn as_bool(&self) -> bool {
        match self {
            ControlValue::Bool(b) => *b,
            ControlValue::Number(n) => *n != 0.0,
        }
    }

    pub fn as_number(&self) -> f64 {
        match self {
            ControlValue::Bool(true) => 1.0,
            ControlValue::Bool(false) => 0.0,
            ControlValue::Number(n) => *n,
        }
    }

    /// Encode as an MQTT payload.
    pub fn to_payload(&self) -> String {
        match self {
            ControlValue::Bool(true) => "1".to_string(),
            ControlValue::Bool(false) => "0".to_string(),
            ControlValue::Number(n) => format_number(*n),
        }
    }

    /// Parse a payload into the same variant as `self`.
    pub fn reparse(&self, payload: &str) -> Option<ControlValue> {
        match self {
            ControlValue::Bool(_) => parse_switch(payload).map(ControlValue::Bool),
            ControlValue::Number(_) => parse_number(payload).map(ControlValue::Number),
        }
    }

    /// Parse a payload of unknown type: numbers win, then boolean words.
    pub fn from_payload(payload: &str) -> Option<ControlValue> {
        let trimmed = payload.trim();
        if let Ok(n) = trimmed.parse::<f64>() {
            return Some(ControlValue::Number(n));
        }
        parse_switch(trimmed).map(ControlValue::Bool)
    }
}

/// Parse a switch payload (`1`/`0`, `true`/`false`, `ON`/`OFF`).
pub fn parse_switch(payload: &str) -> Option<bool> {
    match payload.trim() {
        "1" | "true" | "ON" | "on" => Some(true),
        "0" | "false" | "OFF" | "off" => Some(false),
        other => other.parse::<f64>().ok().map(|n| n != 0.0),
    }
}

/// Parse a numeric payload. Boolean words count as 1 / 0.
pub fn parse_number(payload: &str) -> Option<f64> {
    let trimmed = payload.trim();
    trimmed
        .parse::<f64>()
        .ok()
        .or_else(|| parse_switch(trimmed).map(|b| if b { 1.0 } else { 0.0 }))
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Wiren Board control type, published as `meta/type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlType {
    Switch,
    Pushbutton,
    Value,
    Range,
    Alarm,
}

impl ControlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlType::Switch => "switch",
            ControlType::Pushbutton => "pushbutton",
            ControlType::Value => "value",
            ControlType::Range => "range",
            ControlType::Alarm => "alarm",
        }
    }
}

/// Every control a group device can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlName {
    StateGroup,
    Button,
    QtyLight,
    QtyButton,
    ButtonAlarm,
    Light(usize),
    ButtonMirror(usize),
    Motion,
    MotionLightOn,
    Timeout,
    Sensitivity,
    MotionSensor(usize),
}

impl ControlName {
    pub fn parse(name: &str) -> Option<ControlName> {
        let fixed = match name {
            "stateGroup" => Some(ControlName::StateGroup),
            "button" => Some(ControlName::Button),
            "qtyLight" => Some(ControlName::QtyLight),
            "qtyButton" => Some(ControlName::QtyButton),
            "ButtonAlarm" => Some(ControlName::ButtonAlarm),
            "motion" => Some(ControlName::Motion),
            "motionLightON" => Some(ControlName::MotionLightOn),
            "timeout" => Some(ControlName::Timeout),
            "sensitivity" => Some(ControlName::Sensitivity),
            _ => None,
        };
        if fixed.is_some() {
            return fixed;
        }

        let indexed = |prefix: &str| -> Option<usize> {
            name.strip_prefix(prefix).and_then(|rest| rest.parse().ok())
        };
        if let Some(i) = indexed("light_") {
            return Some(ControlName::Light(i));
        }
        if let Some(i) = indexed("Button_") {
            return Some(ControlName::ButtonMirror(i));
        }
        if let Some(i) = indexed("motion_") {
            return Some(ControlName::MotionSensor(i));
        }
        None
    }

    /// Whether external writes to this control are accepted.
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            ControlName::Button
                | ControlName::Light(_)
                | ControlName::MotionLightOn
                | ControlName::Timeout
                | ControlName::Sensitivity
        )
    }

    /// Whether the control only exists on motion-enabled groups.
    pub fn needs_motion(&self) -> bool {
        matches!(
            self,
            ControlName::Motion
                | ControlName::MotionLightOn
                | ControlName::Timeout
                | ControlName::Sensitivity
                | ControlName::MotionSensor(_)
        )
    }
}

impl fmt::Display for ControlName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlName::StateGroup => f.write_str("stateGroup"),
            ControlName::Button => f.write_str("button"),
            ControlName::QtyLight => f.write_str("qtyLight"),
            ControlName::QtyButton => f.write_str("qtyButton"),
            ControlName::ButtonAlarm => f.write_str("ButtonAlarm"),
            ControlName::Light(i) => write!(f, "light_{}", i),
            ControlName::ButtonMirror(i) => write!(f, "Button_{}", i),
            ControlName::Motion => f.write_str("motion"),
            ControlName::MotionLightOn => f.write_str("motionLightON"),
            ControlName::Timeout => f.write_str("timeout"),
            ControlName::Sensitivity => f.write_str("sensitivity"),
            ControlName::MotionSensor(i) => write!(f, "motion_{}", i),
        }
    }
}

/// Control definition published once at initialization.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMeta {
    pub name: ControlName,
    pub title: String,
    pub kind: ControlType,
    pub readonly: bool,
    pub range: Option<(u16, u16)>,
    pub order: usize,
    pub value: Option<ControlValue>,
}
