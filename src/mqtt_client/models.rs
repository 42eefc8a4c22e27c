use serde::{Deserialize, Serialize};

use crate::config::models::Mqtt;

// ////////// //
// Connection //
// ////////// //

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// MQTT is turned off in the settings.
    Disabled,
    Disconnected,
    Connecting,
    Connected,
}

/// Topic layout of the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub root: String,
    pub discovery_prefix: String,
    pub component_id: String,
}

impl Topics {
    pub fn new(settings: &Mqtt) -> Self {
        Self {
            root: settings.root_topic.trim_end_matches('/').to_owned(),
            discovery_prefix: settings.ha.discovery_topic_prefix.trim_end_matches('/').to_owned(),
            component_id: settings.ha.component_id.clone(),
        }
    }

    pub fn availability(&self) -> String {
        format!("{}/status", self.root)
    }

    pub fn state(&self, printer_id: &str) -> String {
        format!("{}/{}/state", self.root, printer_id)
    }

    pub fn command(&self, printer_id: &str, action: &str) -> String {
        format!("{}/{}/set/{}", self.root, printer_id, action)
    }

    pub fn command_filter(&self) -> String {
        format!("{}/+/set/+", self.root)
    }

    /// Home Assistant publishes `online` here when it (re)starts.
    pub fn home_assistant_status(&self) -> String {
        format!("{}/status", self.discovery_prefix)
    }

    pub fn home_assistant_config(&self, component: &str, printer_id: &str, object: &str) -> String {
        format!("{}/{}/{}/{}_{}/config", self.discovery_prefix, component, self.component_id, printer_id, object)
    }
}

// ////////////// //
// Home Assistant //
// ////////////// //

#[derive(Debug, Serialize, Deserialize)]
pub struct HomeAssistantDiscoverySensorPayload {
    pub name: String,
    pub state_topic: String,
    pub unique_id: String,
    pub availability_topic: String,
    pub device: HomeAssistantDevice,
    pub value_template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HomeAssistantDiscoveryBinarySensorPayload {
    pub name: String,
    pub state_topic: String,
    pub unique_id: String,
    pub availability_topic: String,
    pub device: HomeAssistantDevice,
    pub value_template: String,
    pub payload_on: String,
    pub payload_off: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HomeAssistantDiscoverySwitchPayload {
    pub name: String,
    pub state_topic: String,
    pub command_topic: String,
    pub unique_id: String,
    pub availability_topic: String,
    pub device: HomeAssistantDevice,
    pub value_template: String,
    pub payload_on: String,
    pub payload_off: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HomeAssistantDiscoverySelectPayload {
    pub name: String,
    pub state_topic: String,
    pub command_topic: String,
    pub unique_id: String,
    pub availability_topic: String,
    pub device: HomeAssistantDevice,
    pub value_template: String,
    pub options: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HomeAssistantDiscoveryNumberPayload {
    pub name: String,
    pub state_topic: String,
    pub command_topic: String,
    pub unique_id: String,
    pub availability_topic: String,
    pub device: HomeAssistantDevice,
    pub value_template: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub unit_of_measurement: String,
    pub mode: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HomeAssistantDiscoveryButtonPayload {
    pub name: String,
    pub command_topic: String,
    pub unique_id: String,
    pub availability_topic: String,
    pub device: HomeAssistantDevice,
    pub payload_press: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeAssistantDevice {
    pub identifiers: Vec<String>,
    pub model: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via_device: Option<String>,
}
