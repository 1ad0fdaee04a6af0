//! The serialized event loop.
//!
//! Every external stimulus (device value, device error, virtual control
//! write, timer fire) travels through one unbounded queue and is handled
//! to completion before the next one is taken. Groups are owned by the
//! engine task, so no locking is needed around them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::GroupConfig;
use crate::control::{parse_number, parse_switch, ControlName, ControlValue};
use crate::devices::{DeviceBus, DeviceRegistry};
use crate::group::{Group, Source};
use crate::memory::{MasterMemory, SettingsMemory};
use crate::reconciler::{self, Command};
use crate::state::GroupStates;
use crate::timer::{TimerController, TimerKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A physical control published a value (`device/control`).
    DeviceValue { topic: String, payload: String },
    /// A physical control's `meta/error` changed.
    DeviceError { topic: String, error: Option<String> },
    /// A virtual control of a group was written.
    ControlWritten {
        group: String,
        control: ControlName,
        value: ControlValue,
    },
    TimerFired {
        group: String,
        kind: TimerKind,
        generation: u64,
    },
}

pub type EventSender = mpsc::UnboundedSender<Event>;

/// The queue, created before the producers so they can start early.
pub struct EventQueue {
    tx: EventSender,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> EventSender {
        self.tx.clone()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Engine<M, B> {
    groups: BTreeMap<String, Group>,
    /// Physical topic to every (group, source) that watches it.
    routes: HashMap<String, Vec<(String, Source)>>,
    memory: M,
    bus: B,
    timers: TimerController,
    tx: EventSender,
    rx: mpsc::UnboundedReceiver<Event>,
    states: Arc<GroupStates>,
}

impl<M: MasterMemory + SettingsMemory, B: DeviceBus> Engine<M, B> {
    /// Build every group against the registry and run its initialization.
    pub fn new(
        configs: &[GroupConfig],
        registry: &dyn DeviceRegistry,
        memory: M,
        bus: B,
        states: Arc<GroupStates>,
        queue: EventQueue,
    ) -> Self {
        let EventQueue { tx, mut rx } = queue;

        // The registry already holds whatever these events carried.
        let mut discarded = 0usize;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!("Discarded {} events queued before startup", discarded);
        }

        let mut groups = BTreeMap::new();
        let mut routes: HashMap<String, Vec<(String, Source)>> = HashMap::new();
        for config in configs {
            let mut group = Group::build(config, registry);
            if let Some(zone) = group.motion.as_mut() {
                // Values adjusted at runtime win over the configuration.
                if let Some(saved) = memory.load_settings(&group.id) {
                    tracing::info!(group = %group.id, ?saved, "Restored motion settings");
                    zone.settings = saved;
                }
            }
            let mut watch = |topic: &str, source: Source| {
                routes
                    .entry(topic.to_string())
                    .or_default()
                    .push((group.id.clone(), source));
            };
            for (i, relay) in group.relays.iter().enumerate() {
                watch(&relay.topic, Source::Relay(i));
            }
            for (i, button) in group.buttons.iter().enumerate() {
                watch(&button.topic, Source::Button(i));
            }
            if let Some(zone) = &group.motion {
                for (i, sensor) in zone.sensors.iter().enumerate() {
                    watch(&sensor.topic, Source::Motion(i));
                }
            }
            tracing::info!(
                group = %group.id,
                relays = group.relays.len(),
                buttons = group.buttons.len(),
                motion = group.motion.is_some(),
                master = group.is_master,
                "Lighting group built"
            );
            groups.insert(group.id.clone(), group);
        }

        let mut engine = Self {
            groups,
            routes,
            memory,
            bus,
            timers: TimerController::new(tx.clone()),
            tx,
            rx,
            states,
        };

        let ids: Vec<String> = engine.groups.keys().cloned().collect();
        for id in ids {
            let commands = match engine.groups.get_mut(&id) {
                Some(group) => reconciler::initialize(group),
                None => continue,
            };
            engine.apply(&id, commands);
        }
        engine
    }

    pub fn sender(&self) -> EventSender {
        self.tx.clone()
    }

    #[cfg(test)]
    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    /// Process events until the process exits.
    pub async fn run(mut self) {
        tracing::info!("Engine running with {} groups", self.groups.len());
        while self.step().await {}
    }

    /// Wait for one event and process it.
    pub async fn step(&mut self) -> bool {
        match self.rx.recv().await {
            Some(event) => {
                self.process(event);
                true
            }
            None => false,
        }
    }

    /// Process everything already queued, including events it enqueues.
    #[cfg(test)]
    pub fn process_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.process(event);
            count += 1;
        }
        count
    }

    pub fn process(&mut self, event: Event) {
        self.states.metrics.events.fetch_add(1, Ordering::Relaxed);

        match event {
            Event::DeviceValue { topic, payload } => {
                let Some(targets) = self.routes.get(&topic).cloned() else {
                    return;
                };
                for (group_id, source) in targets {
                    let Some(group) = self.groups.get_mut(&group_id) else {
                        continue;
                    };
                    let commands = match source_value(group, source, &payload) {
                        Some(SourceValue::Relay(i, value)) => {
                            reconciler::on_relay_changed(group, i, value)
                        }
                        Some(SourceValue::Button(i, value)) => {
                            reconciler::on_physical_button_pressed(group, i, value)
                        }
                        Some(SourceValue::Motion(i, reading)) => {
                            reconciler::on_motion_changed(group, i, reading)
                        }
                        None => {
                            tracing::warn!(group = %group_id, topic = %topic, "Unparseable payload {:?}", payload);
                            continue;
                        }
                    };
                    self.apply(&group_id, commands);
                }
            }
            Event::DeviceError { topic, error } => {
                let Some(targets) = self.routes.get(&topic).cloned() else {
                    return;
                };
                for (group_id, source) in targets {
                    let Some(group) = self.groups.get_mut(&group_id) else {
                        continue;
                    };
                    if let Some(err) = &error {
                        tracing::warn!(group = %group_id, topic = %topic, "Source reports error {:?}", err);
                    }
                    let commands = reconciler::on_source_error(group, source, error.clone());
                    self.apply(&group_id, commands);
                }
            }
            Event::ControlWritten {
                group: group_id,
                control,
                value,
            } => {
                let Some(group) = self.groups.get_mut(&group_id) else {
                    tracing::warn!(group = %group_id, "Write for unknown group");
                    return;
                };
                let commands =
                    reconciler::on_control_written(group, control, value, &mut self.memory);
                self.apply(&group_id, commands);
            }
            Event::TimerFired {
                group: group_id,
                kind,
                generation,
            } => {
                self.states.metrics.timer_fires.fetch_add(1, Ordering::Relaxed);
                if !self.timers.settle(&group_id, kind, generation) {
                    self.states
                        .metrics
                        .stale_timer_fires
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(group = %group_id, ?kind, generation, "Dropping stale timer fire");
                    return;
                }
                let Some(group) = self.groups.get_mut(&group_id) else {
                    return;
                };
                tracing::debug!(group = %group_id, ?kind, "Timer fired");
                let commands = match kind {
                    TimerKind::AutoOff => reconciler::on_auto_off_fired(group),
                    TimerKind::MotionClear => reconciler::on_motion_clear_fired(group),
                };
                self.apply(&group_id, commands);
            }
        }
    }

    fn apply(&mut self, group_id: &str, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::DefineDevice { title } => self.bus.define_device(group_id, &title),
                Command::DefineControl(meta) => self.bus.define_control(group_id, &meta),
                Command::SetRelay { topic, value } => {
                    self.bus.write(&topic, &ControlValue::Bool(value))
                }
                Command::SetControl { control, value } => {
                    self.bus.publish(group_id, control, &value)
                }
                Command::SetControlError { control, error } => {
                    self.bus.publish_error(group_id, control, error.as_deref())
                }
                Command::PressButton => {
                    // Handled on a later turn, exactly like an external press.
                    let _ = self.tx.send(Event::ControlWritten {
                        group: group_id.to_string(),
                        control: ControlName::Button,
                        value: ControlValue::Bool(true),
                    });
                }
                Command::ArmTimer { kind, duration } => {
                    self.timers.arm(group_id, kind, duration);
                }
                Command::CancelTimer { kind } => {
                    self.timers.cancel(group_id, kind);
                }
                Command::StoreSettings(settings) => {
                    self.memory.store_settings(group_id, &settings);
                }
            }
        }

        if let Some(group) = self.groups.get(group_id) {
            self.states.set(group.snapshot());
        }
    }
}

enum SourceValue {
    Relay(usize, bool),
    Button(usize, ControlValue),
    Motion(usize, f64),
}

fn source_value(group: &Group, source: Source, payload: &str) -> Option<SourceValue> {
    match source {
        Source::Relay(i) => parse_switch(payload).map(|v| SourceValue::Relay(i, v)),
        Source::Button(i) => group
            .buttons
            .get(i)?
            .value
            .reparse(payload)
            .map(|v| SourceValue::Button(i, v)),
        Source::Motion(i) => parse_number(payload).map(|v| SourceValue::Motion(i, v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::devices::testing::{BusOp, RecordingBus};
    use crate::devices::TopicCache;
    use crate::group::MotionSettings;
    use crate::memory::InMemoryMasterMemory;
    use std::time::Duration;
    use tokio::time::Instant;

    type TestEngine = Engine<InMemoryMasterMemory, RecordingBus>;

    fn registry() -> TopicCache {
        let cache = TopicCache::new();
        for (topic, value) in [
            ("wb-mr6c_1/K1", "1"),
            ("wb-mr6c_1/K2", "0"),
            ("wb-mr6c_1/K3", "1"),
        ] {
            cache.record_meta(topic, "type", "switch");
            cache.record_value(topic, value);
        }
        cache.record_meta("wb-gpio/Input 1", "type", "switch");
        cache.record_value("wb-gpio/Input 1", "0");
        cache.record_meta("wb-msw-v4_80/Current Motion", "type", "value");
        cache.record_value("wb-msw-v4_80/Current Motion", "0");
        cache
    }

    fn engine(yaml: &str, cache: &TopicCache) -> (TestEngine, Arc<GroupStates>) {
        engine_with_memory(yaml, cache, InMemoryMasterMemory::new())
    }

    fn engine_with_memory(
        yaml: &str,
        cache: &TopicCache,
        memory: InMemoryMasterMemory,
    ) -> (TestEngine, Arc<GroupStates>) {
        let settings = config::parse(yaml).unwrap();
        let states = Arc::new(GroupStates::new());
        let engine = Engine::new(
            &settings.groups,
            cache,
            memory,
            RecordingBus::default(),
            states.clone(),
            EventQueue::new(),
        );
        (engine, states)
    }

    fn device_value(topic: &str, payload: &str) -> Event {
        Event::DeviceValue {
            topic: topic.to_string(),
            payload: payload.to_string(),
        }
    }

    /// Report every relay write back as the device would.
    fn echo_writes(engine: &mut TestEngine) -> Vec<(String, bool)> {
        let writes: Vec<(String, bool)> = engine
            .bus
            .take_writes()
            .into_iter()
            .map(|(topic, value)| (topic, value.as_bool()))
            .collect();
        for (topic, value) in &writes {
            let payload = if *value { "1" } else { "0" };
            engine.process(device_value(topic, payload));
        }
        engine.process_pending();
        writes
    }

    fn relay_values(engine: &TestEngine, id: &str) -> Vec<bool> {
        engine
            .group(id)
            .unwrap()
            .relays
            .iter()
            .map(|r| r.last_known_value)
            .collect()
    }

    const MASTER: &str = r#"
groups:
  - title: Whole house
    id: house
    buttons: wb-gpio/Input 1
    relays: [wb-mr6c_1/K1, wb-mr6c_1/K2, wb-mr6c_1/K3]
    master: true
"#;

    const HALL: &str = r#"
groups:
  - title: Hall
    id: hall
    buttons: wb-gpio/Input 1
    relays: [wb-mr6c_1/K2]
    motion: wb-msw-v4_80/Current Motion
    timeout: 1
"#;

    #[tokio::test]
    async fn test_startup_defines_device_and_snapshot() {
        let cache = registry();
        let (engine, states) = engine(MASTER, &cache);

        assert!(engine.bus.ops.contains(&BusOp::DefineDevice {
            group: "house".to_string(),
            title: "Whole house".to_string(),
        }));
        let defined = engine.bus.defined("house");
        assert!(defined.iter().any(|m| m.name == ControlName::Light(2)));
        assert!(!defined.iter().any(|m| m.name == ControlName::ButtonAlarm));

        let snap = states.get("house").unwrap();
        assert!(snap.state_group);
        assert_eq!(snap.qty_light, 3);
        assert_eq!(snap.qty_button, 1);
    }

    #[tokio::test]
    async fn test_master_press_snapshots_and_restores() {
        let cache = registry();
        let (mut engine, states) = engine(MASTER, &cache);
        let tx = engine.sender();

        tx.send(Event::ControlWritten {
            group: "house".to_string(),
            control: ControlName::Button,
            value: ControlValue::Bool(true),
        })
        .unwrap();
        engine.process_pending();
        let writes = echo_writes(&mut engine);
        assert!(writes.iter().all(|(_, v)| !v));
        assert_eq!(relay_values(&engine, "house"), vec![false, false, false]);
        assert!(!states.get("house").unwrap().state_group);
        assert_eq!(
            engine.bus.published("house", ControlName::StateGroup),
            Some(ControlValue::Bool(false))
        );

        // Physical button change goes through the same toggle.
        engine.process(device_value("wb-gpio/Input 1", "1"));
        engine.process_pending();
        echo_writes(&mut engine);
        assert_eq!(relay_values(&engine, "house"), vec![true, false, true]);
        assert!(states.get("house").unwrap().state_group);
    }

    #[tokio::test]
    async fn test_unknown_topic_and_bad_payload_ignored() {
        let cache = registry();
        let (mut engine, states) = engine(MASTER, &cache);
        engine.bus.ops.clear();

        engine.process(device_value("wb-mr6c_9/K1", "1"));
        engine.process(device_value("wb-mr6c_1/K2", "garbage"));
        assert!(engine.bus.ops.is_empty());
        assert_eq!(relay_values(&engine, "house"), vec![true, false, true]);
        assert_eq!(states.metrics.snapshot().events, 2);
    }

    #[tokio::test]
    async fn test_device_error_mirrored() {
        let cache = registry();
        let (mut engine, _) = engine(HALL, &cache);
        engine.process(Event::DeviceError {
            topic: "wb-msw-v4_80/Current Motion".to_string(),
            error: Some("r".to_string()),
        });
        assert!(engine.bus.ops.contains(&BusOp::Error {
            group: "hall".to_string(),
            control: ControlName::MotionSensor(0),
            error: Some("r".to_string()),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_off_measured_from_latest_relay_change() {
        let cache = registry();
        let two_relays = HALL.replace("relays: [wb-mr6c_1/K2]", "relays: [wb-mr6c_1/K2, wb-mr6c_1/K1]");
        cache.record_value("wb-mr6c_1/K1", "0");
        let (mut engine, states) = engine(&two_relays, &cache);
        let start = Instant::now();

        engine.process(device_value("wb-mr6c_1/K2", "1"));
        assert!(states.get("hall").unwrap().motion.unwrap().auto_off_timer_active);

        tokio::time::sleep(Duration::from_secs(30)).await;
        engine.process(device_value("wb-mr6c_1/K1", "1"));

        // Next event is the re-armed fire; the first timer was cancelled.
        assert!(engine.step().await);
        assert_eq!(start.elapsed(), Duration::from_secs(90));
        assert_eq!(states.metrics.snapshot().stale_timer_fires, 0);

        engine.process_pending();
        let writes = echo_writes(&mut engine);
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|(_, v)| !v));
        assert!(!states.get("hall").unwrap().state_group);
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_clears_ten_seconds_after_last_reading() {
        let cache = registry();
        let (mut engine, states) = engine(HALL, &cache);
        let start = Instant::now();
        let sensor = "wb-msw-v4_80/Current Motion";

        engine.process(device_value(sensor, "50"));
        assert!(states.get("hall").unwrap().motion.unwrap().motion);

        tokio::time::sleep(Duration::from_secs(5)).await;
        engine.process(device_value(sensor, "60"));

        assert!(engine.step().await);
        assert_eq!(start.elapsed(), Duration::from_secs(15));

        let motion = states.get("hall").unwrap().motion.unwrap();
        assert!(!motion.motion);
        assert!(!motion.motion_clear_timer_active);
        assert!(motion.auto_off_timer_active);
        assert_eq!(
            engine.bus.published("hall", ControlName::Motion),
            Some(ControlValue::Bool(false))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_light_on_presses_button() {
        let cache = registry();
        let (mut engine, _) = engine(&format!("{}    motion_light_on: true\n", HALL), &cache);

        engine.process(device_value("wb-msw-v4_80/Current Motion", "80"));
        engine.process_pending();
        let writes = engine.bus.take_writes();
        assert_eq!(
            writes,
            vec![("wb-mr6c_1/K2".to_string(), ControlValue::Bool(true))]
        );
    }

    #[tokio::test]
    async fn test_stale_timer_fire_counted() {
        let cache = registry();
        let (mut engine, states) = engine(HALL, &cache);
        engine.process(Event::TimerFired {
            group: "hall".to_string(),
            kind: TimerKind::AutoOff,
            generation: 999,
        });
        let metrics = states.metrics.snapshot();
        assert_eq!(metrics.timer_fires, 1);
        assert_eq!(metrics.stale_timer_fires, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lights_left_on_at_startup_time_out() {
        let cache = registry();
        cache.record_value("wb-mr6c_1/K2", "1");
        let (mut engine, states) = engine(HALL, &cache);
        let start = Instant::now();

        let snap = states.get("hall").unwrap();
        assert!(snap.state_group);
        assert!(snap.motion.unwrap().auto_off_timer_active);

        assert!(engine.step().await);
        assert_eq!(start.elapsed(), Duration::from_secs(60));

        engine.process_pending();
        assert_eq!(
            engine.bus.take_writes(),
            vec![("wb-mr6c_1/K2".to_string(), ControlValue::Bool(false))]
        );
    }

    #[tokio::test]
    async fn test_runtime_settings_stored_and_restored() {
        let cache = registry();
        let mut memory = InMemoryMasterMemory::new();
        memory.store_settings(
            "hall",
            &MotionSettings {
                light_on: true,
                timeout_minutes: 5,
                sensitivity: 80,
            },
        );
        let (mut engine, states) = engine_with_memory(HALL, &cache, memory);

        let settings = states.get("hall").unwrap().motion.unwrap().settings;
        assert_eq!(settings.timeout_minutes, 5);
        assert_eq!(settings.sensitivity, 80);
        assert!(settings.light_on);
        let timeout = engine
            .bus
            .defined("hall")
            .into_iter()
            .find(|m| m.name == ControlName::Timeout)
            .unwrap();
        assert_eq!(timeout.value, Some(ControlValue::Number(5.0)));

        engine.process(Event::ControlWritten {
            group: "hall".to_string(),
            control: ControlName::Sensitivity,
            value: ControlValue::Number(150.0),
        });
        assert_eq!(
            engine.memory.load_settings("hall"),
            Some(MotionSettings {
                light_on: true,
                timeout_minutes: 5,
                sensitivity: 150,
            })
        );
    }
}
