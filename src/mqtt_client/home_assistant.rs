//! Home Assistant MQTT discovery configs for one printer.

use serde::Serialize;

use crate::config::{
    models::{MAX_CADENCE, MIN_CADENCE, TEMPLATES},
    PrinterConfig,
};

use super::commands::{ACTION_CADENCE_HOURS, ACTION_ENABLED, ACTION_POLL_NOW, ACTION_PRINT_NOW, ACTION_TEMPLATE};
use super::models::{
    HomeAssistantDevice, HomeAssistantDiscoveryBinarySensorPayload, HomeAssistantDiscoveryButtonPayload, HomeAssistantDiscoveryNumberPayload,
    HomeAssistantDiscoverySelectPayload, HomeAssistantDiscoverySensorPayload, HomeAssistantDiscoverySwitchPayload, Topics,
};

pub type DiscoveryMessage = (String, Vec<u8>);

/// Component and object id of every entity published per printer.
const ENTITIES: [(&str, &str); 14] = [
    ("sensor", "health"),
    ("sensor", "printer_state"),
    ("sensor", "last_keepalive_result"),
    ("sensor", "next_due"),
    ("sensor", "keepalive_count"),
    ("sensor", "queued_jobs"),
    ("sensor", "job_impressions"),
    ("sensor", "lowest_supply"),
    ("binary_sensor", "keepalive_needed"),
    ("switch", ACTION_ENABLED),
    ("select", ACTION_TEMPLATE),
    ("number", ACTION_CADENCE_HOURS),
    ("button", ACTION_PRINT_NOW),
    ("button", ACTION_POLL_NOW),
];

/// Config topics of every entity of `printer_id`, used to remove them again.
pub fn discovery_topics(topics: &Topics, printer_id: &str) -> Vec<String> {
    ENTITIES.iter().map(|(component, object)| topics.home_assistant_config(component, printer_id, object)).collect()
}

struct Entities<'a> {
    topics: &'a Topics,
    printer: &'a PrinterConfig,
    device: HomeAssistantDevice,
    messages: Vec<DiscoveryMessage>,
}

impl Entities<'_> {
    fn unique_id(&self, object: &str) -> String {
        format!("{}_{}_{}", self.topics.component_id, self.printer.id, object)
    }

    fn push<T: Serialize>(&mut self, component: &str, object: &str, payload: &T) -> Result<(), serde_json::Error> {
        let topic = self.topics.home_assistant_config(component, &self.printer.id, object);
        self.messages.push((topic, serde_json::to_vec(payload)?));
        Ok(())
    }

    fn sensor(&mut self, object: &str, name: &str, value_template: String, device_class: Option<&str>, unit: Option<&str>, icon: Option<&str>) -> Result<(), serde_json::Error> {
        let payload = HomeAssistantDiscoverySensorPayload {
            name: name.to_owned(),
            state_topic: self.topics.state(&self.printer.id),
            unique_id: self.unique_id(object),
            availability_topic: self.topics.availability(),
            device: self.device.clone(),
            value_template,
            device_class: device_class.map(str::to_owned),
            unit_of_measurement: unit.map(str::to_owned),
            icon: icon.map(str::to_owned),
        };
        self.push("sensor", object, &payload)
    }

    fn button(&mut self, action: &str, name: &str, icon: &str) -> Result<(), serde_json::Error> {
        let payload = HomeAssistantDiscoveryButtonPayload {
            name: name.to_owned(),
            command_topic: self.topics.command(&self.printer.id, action),
            unique_id: self.unique_id(action),
            availability_topic: self.topics.availability(),
            device: self.device.clone(),
            payload_press: "PRESS".to_owned(),
            icon: Some(icon.to_owned()),
        };
        self.push("button", action, &payload)
    }
}

/// Renders `value_json.telemetry.<field>`, or `unknown` while there is no telemetry.
fn telemetry_template(field: &str) -> String {
    format!("{{{{ value_json.telemetry.{field} if value_json.telemetry and value_json.telemetry.{field} is not none else 'unknown' }}}}")
}

/// Builds every discovery config for `printer`.
pub fn discovery_messages(topics: &Topics, printer: &PrinterConfig, model: Option<&str>) -> Result<Vec<DiscoveryMessage>, serde_json::Error> {
    let device = HomeAssistantDevice {
        identifiers: vec![format!("{}_{}", topics.component_id, printer.id)],
        model: model.map(str::to_owned).unwrap_or_else(|| format!("{} printer", printer.class)),
        name: printer.name.clone(),
        manufacturer: None,
        sw_version: Some(env!("CARGO_PKG_VERSION").to_owned()),
        via_device: None,
    };
    let mut entities = Entities { topics, printer, device, messages: Vec::new() };

    entities.sensor("health", "Health", "{{ value_json.health }}".to_owned(), None, None, Some("mdi:printer-check"))?;
    entities.sensor("printer_state", "Printer state", telemetry_template("state"), None, None, Some("mdi:printer"))?;
    entities.sensor("last_keepalive_result", "Last keepalive result", "{{ value_json.last_keepalive_result }}".to_owned(), None, None, None)?;
    entities.sensor("next_due", "Next keepalive due", "{{ value_json.next_keepalive_due_at }}".to_owned(), Some("timestamp"), None, None)?;
    entities.sensor("keepalive_count", "Keepalive count", "{{ value_json.keepalive_count }}".to_owned(), None, None, Some("mdi:counter"))?;
    entities.sensor("queued_jobs", "Queued jobs", telemetry_template("queued_jobs"), None, None, Some("mdi:tray-full"))?;
    entities.sensor("job_impressions", "Job impressions", telemetry_template("job_counter"), None, None, Some("mdi:file-document-multiple"))?;
    entities.sensor(
        "lowest_supply",
        "Lowest supply level",
        "{{ value_json.lowest_supply_level if value_json.lowest_supply_level is not none else 'unknown' }}".to_owned(),
        None,
        Some("%"),
        Some("mdi:water-percent"),
    )?;

    let needed = HomeAssistantDiscoveryBinarySensorPayload {
        name: "Keepalive needed".to_owned(),
        state_topic: topics.state(&printer.id),
        unique_id: entities.unique_id("keepalive_needed"),
        availability_topic: topics.availability(),
        device: entities.device.clone(),
        // Compared against Home Assistant's clock so the state payload itself stays time independent.
        value_template: "{{ 'ON' if value_json.enabled and as_timestamp(value_json.next_keepalive_due_at) <= as_timestamp(now()) else 'OFF' }}".to_owned(),
        payload_on: "ON".to_owned(),
        payload_off: "OFF".to_owned(),
        icon: Some("mdi:printer-alert".to_owned()),
    };
    entities.push("binary_sensor", "keepalive_needed", &needed)?;

    let enabled = HomeAssistantDiscoverySwitchPayload {
        name: "Keepalive enabled".to_owned(),
        state_topic: topics.state(&printer.id),
        command_topic: topics.command(&printer.id, ACTION_ENABLED),
        unique_id: entities.unique_id(ACTION_ENABLED),
        availability_topic: topics.availability(),
        device: entities.device.clone(),
        value_template: "{{ 'ON' if value_json.enabled else 'OFF' }}".to_owned(),
        payload_on: "ON".to_owned(),
        payload_off: "OFF".to_owned(),
    };
    entities.push("switch", ACTION_ENABLED, &enabled)?;

    let template = HomeAssistantDiscoverySelectPayload {
        name: "Keepalive template".to_owned(),
        state_topic: topics.state(&printer.id),
        command_topic: topics.command(&printer.id, ACTION_TEMPLATE),
        unique_id: entities.unique_id(ACTION_TEMPLATE),
        availability_topic: topics.availability(),
        device: entities.device.clone(),
        value_template: "{{ value_json.template }}".to_owned(),
        options: TEMPLATES.iter().map(|name| (*name).to_owned()).collect(),
    };
    entities.push("select", ACTION_TEMPLATE, &template)?;

    let cadence = HomeAssistantDiscoveryNumberPayload {
        name: "Keepalive cadence".to_owned(),
        state_topic: topics.state(&printer.id),
        command_topic: topics.command(&printer.id, ACTION_CADENCE_HOURS),
        unique_id: entities.unique_id(ACTION_CADENCE_HOURS),
        availability_topic: topics.availability(),
        device: entities.device.clone(),
        value_template: "{{ value_json.cadence_hours }}".to_owned(),
        min: (MIN_CADENCE.as_secs() / 3600) as f64,
        max: (MAX_CADENCE.as_secs() / 3600) as f64,
        step: 1.0,
        unit_of_measurement: "h".to_owned(),
        mode: "box".to_owned(),
    };
    entities.push("number", ACTION_CADENCE_HOURS, &cadence)?;

    entities.button(ACTION_PRINT_NOW, "Print keepalive now", "mdi:printer")?;
    entities.button(ACTION_POLL_NOW, "Poll printer now", "mdi:refresh")?;

    Ok(entities.messages)
}
