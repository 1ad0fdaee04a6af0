//! Group reconciliation.
//!
//! One function per event kind. Each takes the group (and master memory
//! where the event needs it), updates the group in place and returns the
//! side effects as `Command`s for the engine to apply. Nothing here
//! touches the bus or the clock.

use std::time::Duration;

use crate::control::{ControlMeta, ControlName, ControlType, ControlValue};
use crate::group::{
    Group, MotionSettings, MotionZone, Source, MOTION_CLEAR_DELAY, SENSITIVITY_RANGE, TIMEOUT_RANGE,
};
use crate::memory::MasterMemory;
use crate::timer::TimerKind;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    DefineDevice { title: String },
    DefineControl(ControlMeta),
    /// Write a physical relay.
    SetRelay { topic: String, value: bool },
    /// Publish a virtual control value.
    SetControl {
        control: ControlName,
        value: ControlValue,
    },
    SetControlError {
        control: ControlName,
        error: Option<String>,
    },
    /// Press the group's virtual `button`, re-entering the toggle path.
    PressButton,
    ArmTimer { kind: TimerKind, duration: Duration },
    CancelTimer { kind: TimerKind },
    /// Persist motion settings adjusted at runtime.
    StoreSettings(MotionSettings),
}

// ── Initialization ───────────────────────────────────────

/// Define the virtual device and publish every control's starting value.
/// Runs once per group at startup. Motion groups start their auto-off
/// window right away, so lights left on across a restart still go off.
pub fn initialize(group: &mut Group) -> Vec<Command> {
    let mut defs = ControlDefs::default();

    defs.add(ControlName::StateGroup, "Group state", ControlType::Switch, true)
        .value(ControlValue::Bool(group.state_group()));
    defs.add(ControlName::Button, "Toggle group", ControlType::Pushbutton, false);
    defs.add(ControlName::QtyLight, "Light circuits", ControlType::Value, true)
        .value(ControlValue::Number(group.relays.len() as f64));
    defs.add(ControlName::QtyButton, "Physical switches", ControlType::Value, true)
        .value(ControlValue::Number(group.buttons.len() as f64));

    if group.button_alarm() {
        defs.add(ControlName::ButtonAlarm, "No physical control", ControlType::Alarm, true)
            .value(ControlValue::Bool(true));
    }

    for (i, button) in group.buttons.iter().enumerate() {
        let kind = match button.value {
            ControlValue::Bool(_) => ControlType::Switch,
            ControlValue::Number(_) => ControlType::Value,
        };
        defs.add(ControlName::ButtonMirror(i), &button.topic, kind, true)
            .value(button.value)
            .error(button.error.as_deref());
    }

    for (i, relay) in group.relays.iter().enumerate() {
        defs.add(ControlName::Light(i), &relay.topic, ControlType::Switch, false)
            .value(ControlValue::Bool(relay.last_known_value))
            .error(relay.error.as_deref());
    }

    if let Some(zone) = &group.motion {
        defs.add(ControlName::Motion, "Presence in zone", ControlType::Switch, true)
            .value(ControlValue::Bool(zone.motion));
        defs.add(
            ControlName::MotionLightOn,
            "Turn on light when motion starts",
            ControlType::Switch,
            false,
        )
        .value(ControlValue::Bool(zone.settings.light_on));
        defs.add(ControlName::Timeout, "Light-off timeout, min", ControlType::Range, false)
            .range(*TIMEOUT_RANGE.start() as u16, *TIMEOUT_RANGE.end() as u16)
            .value(ControlValue::Number(f64::from(zone.settings.timeout_minutes)));
        defs.add(ControlName::Sensitivity, "Sensor sensitivity", ControlType::Range, false)
            .range(*SENSITIVITY_RANGE.start(), *SENSITIVITY_RANGE.end())
            .value(ControlValue::Number(f64::from(zone.settings.sensitivity)));

        for (i, sensor) in zone.sensors.iter().enumerate() {
            defs.add(ControlName::MotionSensor(i), &sensor.topic, ControlType::Value, true)
                .value(ControlValue::Number(sensor.last_reading))
                .error(sensor.error.as_deref());
        }
    }

    let mut commands = vec![Command::DefineDevice {
        title: group.title.clone(),
    }];
    commands.extend(defs.into_commands());

    if let Some(zone) = group.motion.as_mut() {
        cancel_auto_off(zone, &mut commands);
        arm_auto_off(zone, &mut commands);
    }
    commands
}

#[derive(Default)]
struct ControlDefs {
    controls: Vec<(ControlMeta, Option<String>)>,
}

impl ControlDefs {
    fn add(&mut self, name: ControlName, title: &str, kind: ControlType, readonly: bool) -> &mut Self {
        let order = self.controls.len() + 1;
        self.controls.push((
            ControlMeta {
                name,
                title: title.to_string(),
                kind,
                readonly,
                range: None,
                order,
                value: None,
            },
            None,
        ));
        self
    }

    fn last(&mut self) -> &mut (ControlMeta, Option<String>) {
        let idx = self.controls.len() - 1;
        &mut self.controls[idx]
    }

    fn value(&mut self, value: ControlValue) -> &mut Self {
        self.last().0.value = Some(value);
        self
    }

    fn range(&mut self, min: u16, max: u16) -> &mut Self {
        self.last().0.range = Some((min, max));
        self
    }

    fn error(&mut self, error: Option<&str>) -> &mut Self {
        self.last().1 = error.map(str::to_string);
        self
    }

    fn into_commands(self) -> Vec<Command> {
        let mut commands = Vec::new();
        for (meta, error) in self.controls {
            let name = meta.name;
            commands.push(Command::DefineControl(meta));
            if error.is_some() {
                commands.push(Command::SetControlError {
                    control: name,
                    error,
                });
            }
        }
        commands
    }
}

// ── Relays ───────────────────────────────────────────────

/// A physical relay reported a new value.
pub fn on_relay_changed(group: &mut Group, index: usize, value: bool) -> Vec<Command> {
    let Some(relay) = group.relays.get_mut(index) else {
        return Vec::new();
    };
    if relay.last_known_value == value {
        return Vec::new();
    }
    relay.last_known_value = value;

    let mut commands = vec![Command::SetControl {
        control: ControlName::Light(index),
        value: ControlValue::Bool(value),
    }];
    if group.recompute_state() {
        commands.push(Command::SetControl {
            control: ControlName::StateGroup,
            value: ControlValue::Bool(group.state_group()),
        });
    }

    // The auto-off window always counts from the last relay change while on.
    let on = group.state_group();
    if let Some(zone) = group.motion.as_mut() {
        cancel_auto_off(zone, &mut commands);
        if on {
            arm_auto_off(zone, &mut commands);
        }
    }
    commands
}

/// The virtual `button` was pressed: switch the whole group.
pub fn on_virtual_toggle(group: &Group, memory: &mut dyn MasterMemory) -> Vec<Command> {
    let turning_off = group.state_group();
    tracing::info!(
        group = %group.id,
        master = group.is_master,
        "Switching group {}",
        if turning_off { "off" } else { "on" }
    );

    group
        .relays
        .iter()
        .map(|relay| {
            let value = if !group.is_master {
                !turning_off
            } else if turning_off {
                memory.set(&group.id, &relay.topic, relay.last_known_value);
                false
            } else {
                memory.get(&group.id, &relay.topic)
            };
            Command::SetRelay {
                topic: relay.topic.clone(),
                value,
            }
        })
        .collect()
}

// ── Buttons ──────────────────────────────────────────────

/// A physical button changed. Any change counts as a press.
pub fn on_physical_button_pressed(group: &mut Group, index: usize, value: ControlValue) -> Vec<Command> {
    let Some(button) = group.buttons.get_mut(index) else {
        return Vec::new();
    };
    if button.value == value {
        return Vec::new();
    }
    button.value = value;

    vec![
        Command::SetControl {
            control: ControlName::ButtonMirror(index),
            value,
        },
        Command::PressButton,
    ]
}

// ── Motion ───────────────────────────────────────────────

pub fn on_motion_changed(group: &mut Group, index: usize, reading: f64) -> Vec<Command> {
    let Some(zone) = group.motion.as_mut() else {
        return Vec::new();
    };
    let Some(sensor) = zone.sensors.get_mut(index) else {
        return Vec::new();
    };
    if sensor.last_reading == reading {
        return Vec::new();
    }
    sensor.last_reading = reading;
    // A sensor in error only shows its error; the reading is kept for later.
    if sensor.error.is_some() {
        return Vec::new();
    }

    let mut commands = vec![Command::SetControl {
        control: ControlName::MotionSensor(index),
        value: ControlValue::Number(reading),
    }];
    if !zone.motion_present() {
        return commands;
    }

    // Presence suppresses auto-off and restarts the quiet window.
    cancel_auto_off(zone, &mut commands);
    commands.push(Command::CancelTimer {
        kind: TimerKind::MotionClear,
    });
    commands.push(Command::ArmTimer {
        kind: TimerKind::MotionClear,
        duration: MOTION_CLEAR_DELAY,
    });
    zone.motion_clear_armed = true;

    let started = !zone.motion;
    if started {
        zone.motion = true;
        commands.push(Command::SetControl {
            control: ControlName::Motion,
            value: ControlValue::Bool(true),
        });
        commands.extend(on_motion_presence_changed(group, true));
    }
    commands
}

/// The latched `motion` control flipped.
pub fn on_motion_presence_changed(group: &mut Group, present: bool) -> Vec<Command> {
    let on = group.state_group();
    let Some(zone) = group.motion.as_mut() else {
        return Vec::new();
    };

    let mut commands = Vec::new();
    if present {
        if zone.settings.light_on && !on {
            commands.push(Command::PressButton);
        }
    } else {
        cancel_auto_off(zone, &mut commands);
        arm_auto_off(zone, &mut commands);
    }
    commands
}

pub fn on_motion_clear_fired(group: &mut Group) -> Vec<Command> {
    let Some(zone) = group.motion.as_mut() else {
        return Vec::new();
    };
    zone.motion_clear_armed = false;
    if !zone.motion {
        return Vec::new();
    }
    zone.motion = false;
    tracing::debug!(group = %group.id, "Motion stopped");

    let mut commands = vec![Command::SetControl {
        control: ControlName::Motion,
        value: ControlValue::Bool(false),
    }];
    commands.extend(on_motion_presence_changed(group, false));
    commands
}

pub fn on_auto_off_fired(group: &mut Group) -> Vec<Command> {
    let on = group.state_group();
    let Some(zone) = group.motion.as_mut() else {
        return Vec::new();
    };
    zone.auto_off_armed = false;

    if !on {
        return Vec::new();
    }
    tracing::debug!(
        group = %group.id,
        "Switching off after {} min timeout",
        zone.settings.timeout_minutes
    );
    vec![Command::PressButton]
}

fn arm_auto_off(zone: &mut MotionZone, commands: &mut Vec<Command>) {
    zone.auto_off_armed = true;
    commands.push(Command::ArmTimer {
        kind: TimerKind::AutoOff,
        duration: zone.settings.auto_off_delay(),
    });
}

fn cancel_auto_off(zone: &mut MotionZone, commands: &mut Vec<Command>) {
    zone.auto_off_armed = false;
    commands.push(Command::CancelTimer {
        kind: TimerKind::AutoOff,
    });
}

// ── Errors and control writes ────────────────────────────

/// A source's `meta/error` changed. `None` clears it.
pub fn on_source_error(group: &mut Group, source: Source, error: Option<String>) -> Vec<Command> {
    let (slot, control) = match source {
        Source::Relay(i) => (
            group.relays.get_mut(i).map(|r| &mut r.error),
            ControlName::Light(i),
        ),
        Source::Button(i) => (
            group.buttons.get_mut(i).map(|b| &mut b.error),
            ControlName::ButtonMirror(i),
        ),
        Source::Motion(i) => (
            group
                .motion
                .as_mut()
                .and_then(|zone| zone.sensors.get_mut(i))
                .map(|s| &mut s.error),
            ControlName::MotionSensor(i),
        ),
    };

    let Some(slot) = slot else {
        return Vec::new();
    };
    if *slot == error {
        return Vec::new();
    }
    *slot = error.clone();
    let cleared = error.is_none();
    let mut commands = vec![Command::SetControlError { control, error }];

    // Readings of a sensor in error were held back.
    if let (true, Source::Motion(i)) = (cleared, source) {
        if let Some(sensor) = group.motion.as_ref().and_then(|zone| zone.sensors.get(i)) {
            commands.push(Command::SetControl {
                control,
                value: ControlValue::Number(sensor.last_reading),
            });
        }
    }
    commands
}

/// Someone wrote one of the group's virtual controls.
pub fn on_control_written(
    group: &mut Group,
    control: ControlName,
    value: ControlValue,
    memory: &mut dyn MasterMemory,
) -> Vec<Command> {
    match control {
        ControlName::Button => on_virtual_toggle(group, memory),
        ControlName::Light(i) => match group.relays.get(i) {
            Some(relay) => vec![Command::SetRelay {
                topic: relay.topic.clone(),
                value: value.as_bool(),
            }],
            None => {
                tracing::warn!(group = %group.id, "No relay behind {}", control);
                Vec::new()
            }
        },
        ControlName::MotionLightOn | ControlName::Timeout | ControlName::Sensitivity => {
            let Some(zone) = group.motion.as_mut() else {
                tracing::warn!(group = %group.id, "{} written on a group without motion sensors", control);
                return Vec::new();
            };
            let stored = match control {
                ControlName::MotionLightOn => {
                    zone.settings.light_on = value.as_bool();
                    ControlValue::Bool(zone.settings.light_on)
                }
                ControlName::Timeout => {
                    ControlValue::Number(f64::from(zone.settings.set_timeout(value.as_number())))
                }
                _ => ControlValue::Number(f64::from(zone.settings.set_sensitivity(value.as_number()))),
            };
            vec![
                Command::SetControl {
                    control,
                    value: stored,
                },
                Command::StoreSettings(zone.settings),
            ]
        }
        _ => {
            tracing::warn!(group = %group.id, "Ignoring write to read-only control {}", control);
            Vec::new()
        }
    }
}
