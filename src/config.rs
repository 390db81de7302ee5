use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub thing_name: String,
    /// MQTT client id, defaults to `<thing_name>-edge`
    pub client_id: Option<String>,
    #[serde(default = "default_num_pixels")]
    pub num_pixels: usize,
    /// Render tick budget in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    pub mqtt: MqttConfig,
    pub broadcast: BroadcastConfig,
    /// Hardware strip; when absent only TCP viewers are fed
    pub serial: Option<SerialConfig>,
    pub assets: AssetsConfig,
    #[serde(default)]
    pub modes: ModeSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqttConfig {
    pub endpoint: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Mutual TLS is used only when all three files are given
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// Topic for sensor readings, defaults to `lightstick/<thing_name>/telemetry`
    pub telemetry_topic: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BroadcastConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AssetsConfig {
    Directory { dir: String },
    Http { url: String },
}

/// Tunables for the rendering modes
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModeSettings {
    pub blink_threshold: u32,
    pub telemetry_interval_ms: u64,
    pub lightsaber_max: f64,
    pub heartbeat_period_ticks: u32,
    pub heartbeat_min_pixels: usize,
    pub image_columns_per_tick: usize,
}

impl Default for ModeSettings {
    fn default() -> Self {
        ModeSettings {
            blink_threshold: 3,
            telemetry_interval_ms: 1000,
            lightsaber_max: 1023.0,
            heartbeat_period_ticks: 30,
            heartbeat_min_pixels: 2,
            image_columns_per_tick: 1,
        }
    }
}

impl ModeSettings {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms.max(1))
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&data).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(data)?;
        if config.num_pixels == 0 {
            anyhow::bail!("num_pixels must be at least 1");
        }
        Ok(config)
    }

    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("{}-edge", self.thing_name))
    }

    pub fn telemetry_topic(&self) -> String {
        self.mqtt
            .telemetry_topic
            .clone()
            .unwrap_or_else(|| format!("lightstick/{}/telemetry", self.thing_name))
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

fn default_num_pixels() -> usize {
    144
}

fn default_tick_ms() -> u64 {
    33
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_keep_alive() -> u64 {
    6
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "thing_name": "stick-1",
        "mqtt": { "endpoint": "example.iot.local" },
        "broadcast": { "host": "0.0.0.0", "port": 5000 },
        "assets": { "dir": "/var/lib/lightstick" }
    }"#;

    #[test]
    fn test_defaults() {
        let config = Config::from_json(MINIMAL).unwrap();
        assert_eq!(config.num_pixels, 144);
        assert_eq!(config.tick(), Duration::from_millis(33));
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.client_id(), "stick-1-edge");
        assert_eq!(config.telemetry_topic(), "lightstick/stick-1/telemetry");
        assert_eq!(config.modes.blink_threshold, 3);
        assert!(config.serial.is_none());
        assert!(matches!(config.assets, AssetsConfig::Directory { .. }));
    }

    #[test]
    fn test_http_assets_and_serial() {
        let data = r#"{
            "thing_name": "stick-2",
            "num_pixels": 60,
            "mqtt": { "endpoint": "broker", "port": 1883 },
            "broadcast": { "host": "127.0.0.1", "port": 5001 },
            "serial": { "port": "/dev/ttyACM0", "baud_rate": 115200 },
            "assets": { "url": "https://assets.example.com" },
            "modes": { "blink_threshold": 5 }
        }"#;
        let config = Config::from_json(data).unwrap();
        assert_eq!(config.num_pixels, 60);
        assert_eq!(config.serial.unwrap().baud_rate, 115200);
        assert!(matches!(config.assets, AssetsConfig::Http { .. }));
        assert_eq!(config.modes.blink_threshold, 5);
        assert_eq!(config.modes.telemetry_interval_ms, 1000);
    }

    #[test]
    fn test_zero_pixels_rejected() {
        let data = MINIMAL.replace("\"thing_name\"", "\"num_pixels\": 0, \"thing_name\"");
        assert!(Config::from_json(&data).is_err());
    }
}
