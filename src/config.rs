//! Service configuration.
//!
//! Loaded from a YAML file with environment-variable overrides for the
//! deployment-specific pieces. Everything has a default so the service
//! starts with no file at all.

use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::{NotifError, Result};

const CONFIG_PATHS: [&str; 2] = ["config/notifsrv.yaml", "notifsrv.yaml"];

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub mqtt: MqttConfig,
    pub store: StoreConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Inbound alarm feed topic
    pub alarm_topic: String,
    /// Outbound SMS gateway topic
    pub sms_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "notifsrv".to_string(),
            alarm_topic: "/modelPublish".to_string(),
            sms_topic: "jassi/sms".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://notifsrv.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub tick_interval_ms: u64,
    pub config_refresh_secs: u64,
    pub recovery_interval_secs: u64,
    pub io_timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            config_refresh_secs: 10,
            recovery_interval_secs: 60,
            io_timeout_ms: 3000,
        }
    }
}

impl ControlConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn config_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.config_refresh_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl ServiceConfig {
    /// Load from the first config file found, then apply env overrides.
    pub fn load() -> Result<Self> {
        let mut config = ServiceConfig::default();
        for path in CONFIG_PATHS {
            if let Ok(raw) = std::fs::read_to_string(path) {
                info!("loading configuration from {}", path);
                config = serde_yaml::from_str(&raw)
                    .map_err(|e| NotifError::Config(format!("{}: {}", path, e)))?;
                break;
            }
        }
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("NOTIFSRV_DATABASE_URL") {
            self.store.database_url = url;
        }
        if let Ok(host) = std::env::var("NOTIFSRV_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Ok(port) = std::env::var("NOTIFSRV_MQTT_PORT") {
            self.mqtt.port = port
                .parse()
                .map_err(|_| NotifError::Config(format!("invalid NOTIFSRV_MQTT_PORT: {}", port)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.mqtt.alarm_topic, "/modelPublish");
        assert_eq!(config.mqtt.sms_topic, "jassi/sms");
        assert_eq!(config.control.tick_interval(), Duration::from_millis(100));
        assert_eq!(config.control.recovery_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let raw = "mqtt:\n  host: broker.local\ncontrol:\n  tick_interval_ms: 250\n";
        let config: ServiceConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.control.tick_interval_ms, 250);
        assert_eq!(config.control.io_timeout_ms, 3000);
    }
}
