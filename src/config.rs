use serde::Deserialize;
use std::env;
use std::time::Duration;
use url::Url;

use crate::engine::EngineConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub gateway: GatewayConfig,
    pub links: Vec<LinkConfig>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: Url,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
    pub failure_threshold: u32,
    pub backoff_min_secs: u64,
    pub backoff_max_secs: u64,
    pub push_events: bool,
}

/// Mirror a sensor's value onto an actuator. Both are device names as shown
/// by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LinkConfig {
    pub sensor: String,
    pub actuator: String,
}

/// Reads one variable. `std::env::var` in production, a map in tests.
struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn required(&self, key: &str) -> Result<String, String> {
        self.optional(key)
            .ok_or_else(|| format!("{key} environment variable is required"))
    }

    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.is_empty())
    }

    fn or_default<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, String> {
        match self.optional(key) {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| format!("{key} has an invalid value: {v:?}")),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str) -> Result<bool, String> {
        match self.optional(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(false),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(format!("{key} must be true or false, got {v:?}")),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let vars = Vars(lookup);

        let raw_url = vars.required("XS1_URL")?;
        let url = Url::parse(&raw_url).map_err(|e| format!("XS1_URL {raw_url:?} is invalid: {e}"))?;

        let links = match vars.optional("LINKS_FILE") {
            Some(path) => load_links(&path)?,
            None => Vec::new(),
        };

        let config = Self {
            mqtt: MqttConfig {
                broker_host: vars.required("MQTT_BROKER_HOST")?,
                broker_port: vars.or_default("MQTT_BROKER_PORT", 1883)?,
                username: vars.optional("MQTT_USERNAME"),
                password: vars.optional("MQTT_PASSWORD"),
                topic_prefix: vars.or_default("MQTT_TOPIC_PREFIX", "xs1".to_string())?,
                client_id: vars.or_default("MQTT_CLIENT_ID", "xs1-to-mqtt".to_string())?,
            },
            gateway: GatewayConfig {
                url,
                poll_interval_secs: vars.or_default("XS1_POLL_INTERVAL_SECS", 30)?,
                timeout_secs: vars.or_default("XS1_TIMEOUT_SECS", 5)?,
                failure_threshold: vars.or_default("XS1_FAILURE_THRESHOLD", 2)?,
                backoff_min_secs: vars.or_default("XS1_BACKOFF_MIN_SECS", 5)?,
                backoff_max_secs: vars.or_default("XS1_BACKOFF_MAX_SECS", 60)?,
                push_events: vars.flag("XS1_PUSH_EVENTS")?,
            },
            links,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.mqtt.broker_host.is_empty() {
            return Err("MQTT_BROKER_HOST must not be empty".into());
        }
        if !matches!(self.gateway.url.scheme(), "http" | "https") || self.gateway.url.host().is_none() {
            return Err(format!(
                "XS1_URL must be an http(s) URL with a host, got {}",
                self.gateway.url
            ));
        }
        if self.gateway.poll_interval_secs == 0 {
            return Err("XS1_POLL_INTERVAL_SECS must be > 0".into());
        }
        if self.gateway.timeout_secs == 0 {
            return Err("XS1_TIMEOUT_SECS must be > 0".into());
        }
        if self.gateway.backoff_min_secs == 0 {
            return Err("XS1_BACKOFF_MIN_SECS must be > 0".into());
        }
        if self.gateway.backoff_max_secs < self.gateway.backoff_min_secs {
            return Err("XS1_BACKOFF_MAX_SECS must be >= XS1_BACKOFF_MIN_SECS".into());
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.timeout_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_secs(self.gateway.poll_interval_secs),
            failure_threshold: self.gateway.failure_threshold,
            backoff_min: Duration::from_secs(self.gateway.backoff_min_secs),
            backoff_max: Duration::from_secs(self.gateway.backoff_max_secs),
            push_events: self.gateway.push_events,
        }
    }

    pub fn bridge_status_topic(&self) -> String {
        format!("{}/bridge_status", self.mqtt.topic_prefix)
    }

    pub fn command_subscription(&self) -> String {
        format!("{}/Actuators/+/state/set", self.mqtt.topic_prefix)
    }

    /// "Sensors.Temp.value" → "{prefix}/Sensors/Temp/value"
    pub fn topic_for_path(&self, path: &str) -> String {
        format!("{}/{}", self.mqtt.topic_prefix, path.replace('.', "/"))
    }
}

fn load_links(path: &str) -> Result<Vec<LinkConfig>, String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read {path}: {e}"))?;
    parse_links(&content).map_err(|e| format!("Failed to parse {path}: {e}"))
}

fn parse_links(content: &str) -> Result<Vec<LinkConfig>, serde_json::Error> {
    serde_json::from_str(content)
}
