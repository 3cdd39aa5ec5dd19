pub mod client;
pub mod events;
pub mod transport;

use std::fmt;

use crate::error::Error;

/// Which of the gateway's two device lists a device comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    Actuator,
    Sensor,
}

impl DeviceKind {
    /// Top-level segment of the state paths for this kind.
    pub fn path_root(self) -> &'static str {
        match self {
            Self::Actuator => "Actuators",
            Self::Sensor => "Sensors",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Actuator => f.write_str("actuator"),
            Self::Sensor => f.write_str("sensor"),
        }
    }
}

/// Accepted values for a writable subtype.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueRange {
    Discrete(&'static [f64]),
    Continuous { min: f64, max: f64 },
    Unbounded,
}

/// Device subtype as reported in the `type` field.
///
/// New subtypes get a variant here and a row in [`Subtype::range`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subtype {
    Switch,
    Dimmer,
    Shutter,
    Binary,
    Temperature,
    Humidity,
    Other(String),
}

impl Subtype {
    pub fn from_wire(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "switch" => Self::Switch,
            "dimmer" => Self::Dimmer,
            "shutter" => Self::Shutter,
            "binary" => Self::Binary,
            "temperature" => Self::Temperature,
            "hygrometer" | "humidity" => Self::Humidity,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Switch => "switch",
            Self::Dimmer => "dimmer",
            Self::Shutter => "shutter",
            Self::Binary => "binary",
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Other(raw) => raw,
        }
    }

    pub fn range(&self) -> ValueRange {
        match self {
            Self::Switch | Self::Binary => ValueRange::Discrete(&[0.0, 1.0]),
            Self::Dimmer | Self::Shutter => ValueRange::Continuous { min: 0.0, max: 100.0 },
            Self::Temperature | Self::Humidity | Self::Other(_) => ValueRange::Unbounded,
        }
    }

    /// Check a command value against this subtype's range.
    pub fn validate(&self, value: f64) -> Result<(), Error> {
        if !value.is_finite() {
            return Err(Error::Validation(format!("{value} is not a finite number")));
        }
        match self.range() {
            ValueRange::Discrete(allowed) if !allowed.contains(&value) => Err(Error::Validation(
                format!("{} accepts only {allowed:?}, got {value}", self.as_str()),
            )),
            ValueRange::Continuous { min, max } if !(min..=max).contains(&value) => {
                Err(Error::Validation(format!(
                    "{} accepts {min}..={max}, got {value}",
                    self.as_str()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Registry key: ids are only unique within one device list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub kind: DeviceKind,
    pub id: u32,
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.kind, self.id)
    }
}

/// One actuator or sensor as last seen on the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: u32,
    pub name: String,
    pub kind: DeviceKind,
    pub subtype: Subtype,
    pub value: f64,
    pub unit: Option<String>,
    /// Sensors only; `None` when the gateway does not report it.
    pub battery_low: Option<bool>,
}

impl Device {
    pub fn key(&self) -> DeviceKey {
        DeviceKey { kind: self.kind, id: self.id }
    }
}

/// Answer to the `get_protocol_info` handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolInfo {
    pub version: Option<i64>,
}

/// A single value change delivered by the gateway's event subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct PushUpdate {
    pub kind: DeviceKind,
    pub id: u32,
    pub name: String,
    pub subtype: Subtype,
    pub value: f64,
}

impl PushUpdate {
    pub fn key(&self) -> DeviceKey {
        DeviceKey { kind: self.kind, id: self.id }
    }
}
