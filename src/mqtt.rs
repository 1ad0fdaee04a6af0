use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;

use crate::config::{GroupConfig, MqttSettings};
use crate::control::{ControlMeta, ControlName, ControlValue};
use crate::devices::{error_from_payload, split_topic, DeviceBus, TopicCache};
use crate::engine::{Event, EventSender};

/// Wiren Board topic layout:
///   /devices/{device}/controls/{control}            value (retained)
///   /devices/{device}/controls/{control}/meta/{key} metadata (retained)
///   /devices/{device}/controls/{control}/on         write request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Value { topic: String },
    Meta { topic: String, key: String },
    Command { device: String, control: String },
}

pub fn parse_topic(topic: &str) -> Option<Inbound> {
    let rest = topic.strip_prefix("/devices/")?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() < 3 || parts[1] != "controls" || parts[0].is_empty() || parts[2].is_empty() {
        return None;
    }
    let short = format!("{}/{}", parts[0], parts[2]);
    match &parts[3..] {
        [] => Some(Inbound::Value { topic: short }),
        ["meta", key] => Some(Inbound::Meta {
            topic: short,
            key: key.to_string(),
        }),
        ["on"] => Some(Inbound::Command {
            device: parts[0].to_string(),
            control: parts[2].to_string(),
        }),
        _ => None,
    }
}

fn control_topic(device: &str, control: &str) -> String {
    format!("/devices/{}/controls/{}", device, control)
}

fn subscriptions(group_ids: &[String]) -> Vec<String> {
    let mut filters = vec![
        "/devices/+/controls/+".to_string(),
        "/devices/+/controls/+/meta/+".to_string(),
    ];
    for id in group_ids {
        filters.push(format!("/devices/{}/controls/+/on", id));
    }
    filters
}

/// Publishes a control definition takes at most: type, readonly, order,
/// title, min, max, value and error.
const MESSAGES_PER_CONTROL: usize = 8;
const MIN_REQUEST_CAPACITY: usize = 1024;

/// Client request queue size. Startup queues every control definition
/// before the event loop gets to send any of them.
pub fn request_capacity(groups: &[GroupConfig]) -> usize {
    let controls: usize = groups
        .iter()
        .map(|g| {
            let motion = g.motion.as_ref().map_or(0, |m| 4 + m.to_vec().len());
            4 + g.buttons.to_vec().len() + g.relays.to_vec().len() + motion
        })
        .sum();
    let device_meta = groups.len();
    let filters = 2 + groups.len();
    (controls * MESSAGES_PER_CONTROL + device_meta + filters).max(MIN_REQUEST_CAPACITY)
}

/// Turns inbound messages into registry updates and engine events.
struct Bridge {
    groups: HashSet<String>,
    cache: Arc<TopicCache>,
    events: EventSender,
}

impl Bridge {
    fn handle(&self, topic: &str, payload: &str) {
        let Some(inbound) = parse_topic(topic) else {
            return;
        };
        let event = match inbound {
            Inbound::Value { topic } => {
                self.cache.record_value(&topic, payload);
                Event::DeviceValue {
                    topic,
                    payload: payload.to_string(),
                }
            }
            Inbound::Meta { topic, key } => {
                self.cache.record_meta(&topic, &key, payload);
                if key != "error" {
                    return;
                }
                Event::DeviceError {
                    topic,
                    error: error_from_payload(payload),
                }
            }
            Inbound::Command { device, control } => {
                if !self.groups.contains(&device) {
                    return;
                }
                let Some(name) = ControlName::parse(&control) else {
                    tracing::warn!(group = %device, "Write to unknown control {}", control);
                    return;
                };
                let value = match name {
                    // Any payload is a press.
                    ControlName::Button => ControlValue::Bool(true),
                    _ => match ControlValue::from_payload(payload) {
                        Some(value) => value,
                        None => {
                            tracing::warn!(group = %device, "Bad payload {:?} for {}", payload, name);
                            return;
                        }
                    },
                };
                Event::ControlWritten {
                    group: device,
                    control: name,
                    value,
                }
            }
        };

        if self.events.send(event).is_err() {
            tracing::error!("Engine queue closed");
        }
    }
}

/// Connect to the broker and start bridging. Returned bus publishes through
/// the same connection.
pub fn start(
    settings: &MqttSettings,
    groups: &[GroupConfig],
    cache: Arc<TopicCache>,
    events: EventSender,
) -> (MqttBus, JoinHandle<()>) {
    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    options.set_keep_alive(Duration::from_secs(30));

    // Initialization publishes a burst of retained control metadata.
    let capacity = request_capacity(groups);
    tracing::debug!("MQTT request capacity {}", capacity);
    let (client, mut eventloop) = AsyncClient::new(options, capacity);

    let group_ids: Vec<String> = groups.iter().map(|g| g.id.clone()).collect();

    let filters = subscriptions(&group_ids);
    let bridge = Bridge {
        groups: group_ids.into_iter().collect(),
        cache,
        events,
    };
    let subscriber = client.clone();

    let handle = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                    // Re-subscribe on every (re)connect
                    tracing::info!("MQTT connected, subscribing to {} filters", filters.len());
                    for filter in &filters {
                        if let Err(e) = subscriber.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                            tracing::error!("MQTT subscribe {} failed: {}", filter, e);
                        }
                    }
                }
                Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload);
                    bridge.handle(&publish.topic, &payload);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("MQTT connection error: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    });

    (MqttBus { client }, handle)
}

/// `DeviceBus` over MQTT. Publishes never block; a full client queue drops
/// the message with a warning.
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    fn send(&self, topic: String, retain: bool, payload: String) {
        if let Err(e) = self
            .client
            .try_publish(topic.as_str(), QoS::AtLeastOnce, retain, payload.into_bytes())
        {
            tracing::warn!(topic = %topic, "MQTT publish failed: {}", e);
        }
    }
}

impl DeviceBus for MqttBus {
    fn write(&mut self, topic: &str, value: &ControlValue) {
        let Some((device, control)) = split_topic(topic) else {
            tracing::warn!(topic = %topic, "Cannot write malformed topic");
            return;
        };
        self.send(
            format!("{}/on", control_topic(device, control)),
            false,
            value.to_payload(),
        );
    }

    fn define_device(&mut self, group: &str, title: &str) {
        self.send(format!("/devices/{}/meta/name", group), true, title.to_string());
    }

    fn define_control(&mut self, group: &str, meta: &ControlMeta) {
        let base = control_topic(group, &meta.name.to_string());
        self.send(format!("{}/meta/type", base), true, meta.kind.as_str().to_string());
        self.send(
            format!("{}/meta/readonly", base),
            true,
            if meta.readonly { "1" } else { "0" }.to_string(),
        );
        self.send(format!("{}/meta/order", base), true, meta.order.to_string());
        self.send(format!("{}/meta/title", base), true, meta.title.clone());
        if let Some((min, max)) = meta.range {
            self.send(format!("{}/meta/min", base), true, min.to_string());
            self.send(format!("{}/meta/max", base), true, max.to_string());
        }
        if let Some(value) = &meta.value {
            self.send(base, true, value.to_payload());
        }
    }

    fn publish(&mut self, group: &str, control: ControlName, value: &ControlValue) {
        self.send(control_topic(group, &control.to_string()), true, value.to_payload());
    }

    fn publish_error(&mut self, group: &str, control: ControlName, error: Option<&str>) {
        self.send(
            format!("{}/meta/error", control_topic(group, &control.to_string())),
            true,
            error.unwrap_or_default().to_string(),
        );
    }
}
