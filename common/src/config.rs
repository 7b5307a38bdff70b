use serde::{Deserialize, Serialize};

pub const DEFAULT_MQTT_HOST: &str = "192.168.1.100";
pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: DEFAULT_MQTT_HOST.to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        let host = self.mqtt_host.trim();
        self.mqtt_host = if host.is_empty() {
            DEFAULT_MQTT_HOST.to_string()
        } else {
            host.to_string()
        };

        if self.mqtt_port == 0 {
            self.mqtt_port = DEFAULT_MQTT_PORT;
        }
    }

    pub fn mqtt_url(&self) -> String {
        format!("mqtt://{}:{}", self.mqtt_host, self.mqtt_port)
    }

    pub fn has_mqtt_credentials(&self) -> bool {
        !self.mqtt_user.is_empty()
    }
}

/// Static values advertised in the discovery document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub name: String,
    pub device_name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
    pub serial_number: u32,
}

impl Default for DeviceMetadata {
    fn default() -> Self {
        Self {
            name: "REGEBELEEGHT".to_string(),
            device_name: "OngaroLight".to_string(),
            manufacturer: "Ongaro".to_string(),
            model: "blingbling".to_string(),
            sw_version: "alpha".to_string(),
            serial_number: 124_589,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub network: NetworkConfig,
    #[serde(default)]
    pub device: DeviceMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_restores_broker_defaults() {
        let mut network = NetworkConfig {
            mqtt_host: "   ".to_string(),
            mqtt_port: 0,
            ..NetworkConfig::default()
        };
        network.sanitize();

        assert_eq!(network.mqtt_host, DEFAULT_MQTT_HOST);
        assert_eq!(network.mqtt_port, DEFAULT_MQTT_PORT);
        assert_eq!(network.mqtt_url(), "mqtt://192.168.1.100:1883");
    }

    #[test]
    fn sanitize_trims_host() {
        let mut network = NetworkConfig {
            mqtt_host: " broker.lan ".to_string(),
            mqtt_port: 8883,
            ..NetworkConfig::default()
        };
        network.sanitize();

        assert_eq!(network.mqtt_url(), "mqtt://broker.lan:8883");
    }

    #[test]
    fn device_metadata_defaults_when_missing() {
        let raw = r#"{"network":{"wifi_ssid":"home","wifi_pass":"","mqtt_host":"10.0.0.2","mqtt_port":1883,"mqtt_user":"light","mqtt_pass":"secret"}}"#;
        let config: RuntimeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.device, DeviceMetadata::default());
        assert!(config.network.has_mqtt_credentials());
    }
}
