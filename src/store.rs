// Host-side state tree.
//
// The engine only needs the `StateStore` trait. `MemoryStore` is the
// in-process implementation the bridge runs with: it keeps the latest record
// per path and broadcasts every declaration and write to subscribers (the
// MQTT mirror, the command pump, device links).

use std::fmt;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

/// Path of the reachability flag.
pub const CONNECTION_PATH: &str = "info.connection";

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Number(f64),
}

impl StateValue {
    /// Numeric view used for commands: booleans map to 1/0.
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Bool(true) => 1.0,
            Self::Bool(false) => 0.0,
            Self::Number(n) => n,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// One addressable value in the state tree.
///
/// `ack = true` is confirmed gateway status, `ack = false` a pending command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateRecord {
    pub path: String,
    pub value: StateValue,
    pub ack: bool,
}

impl StateRecord {
    pub fn confirmed(path: impl Into<String>, value: StateValue) -> Self {
        Self {
            path: path.into(),
            value,
            ack: true,
        }
    }

    pub fn command(path: impl Into<String>, value: StateValue) -> Self {
        Self {
            path: path.into(),
            value,
            ack: false,
        }
    }
}

/// Metadata declared once when a record first appears.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordDefinition {
    pub path: String,
    pub name: String,
    pub writable: bool,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// What the engine needs from its host.
pub trait StateStore: Send + Sync {
    fn declare(&self, definition: RecordDefinition);
    fn set_state(&self, record: StateRecord);
    fn get_state(&self, path: &str) -> Option<StateRecord>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Declared(RecordDefinition),
    Updated(StateRecord),
}

pub struct MemoryStore {
    records: DashMap<String, StateRecord>,
    definitions: DashMap<String, RecordDefinition>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            records: DashMap::new(),
            definitions: DashMap::new(),
            events,
        }
    }

    /// Receive every declaration and write from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Record a host write intent (`ack = false`) and notify subscribers.
    pub fn write(&self, path: &str, value: StateValue) -> StateRecord {
        let record = StateRecord::command(path, value);
        self.set_state(record.clone());
        record
    }

    pub fn definition(&self, path: &str) -> Option<RecordDefinition> {
        self.definitions.get(path).map(|entry| entry.value().clone())
    }

    /// All current records, sorted by path.
    pub fn records(&self) -> Vec<StateRecord> {
        let mut records: Vec<StateRecord> =
            self.records.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        records
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStore {
    fn declare(&self, definition: RecordDefinition) {
        self.definitions
            .insert(definition.path.clone(), definition.clone());
        // No subscribers is fine.
        let _ = self.events.send(StoreEvent::Declared(definition));
    }

    fn set_state(&self, record: StateRecord) {
        self.records.insert(record.path.clone(), record.clone());
        let _ = self.events.send(StoreEvent::Updated(record));
    }

    fn get_state(&self, path: &str) -> Option<StateRecord> {
        self.records.get(path).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_mqtt_payloads() {
        assert_eq!(StateValue::Number(40.0).to_string(), "40");
        assert_eq!(StateValue::Number(21.5).to_string(), "21.5");
        assert_eq!(StateValue::Bool(true).to_string(), "true");
    }

    #[test]
    fn booleans_map_to_one_and_zero() {
        assert_eq!(StateValue::Bool(true).as_f64(), 1.0);
        assert_eq!(StateValue::Bool(false).as_f64(), 0.0);
        assert_eq!(StateValue::Number(40.0).as_f64(), 40.0);
    }

    #[test]
    fn serializes_untagged_values() {
        let record = StateRecord::confirmed("Sensors.Temp.value", StateValue::Number(21.5));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"path": "Sensors.Temp.value", "value": 21.5, "ack": true})
        );
    }

    #[tokio::test]
    async fn write_records_pending_command_and_notifies() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        store.set_state(StateRecord::confirmed("Actuators.Lamp.state", StateValue::Number(0.0)));
        store.write("Actuators.Lamp.state", StateValue::Number(1.0));

        let current = store.get_state("Actuators.Lamp.state").unwrap();
        assert_eq!(current.value, StateValue::Number(1.0));
        assert!(!current.ack);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, StoreEvent::Updated(ref r) if r.ack));
        assert!(matches!(second, StoreEvent::Updated(ref r) if !r.ack));
    }

    #[test]
    fn declare_keeps_definition() {
        let store = MemoryStore::new();
        store.declare(RecordDefinition {
            path: "Sensors.Temp.value".into(),
            name: "Temp".into(),
            writable: false,
            role: "temperature".into(),
            unit: Some("°C".into()),
        });

        let definition = store.definition("Sensors.Temp.value").unwrap();
        assert!(!definition.writable);
        assert_eq!(definition.unit.as_deref(), Some("°C"));
        assert!(store.records().is_empty());
    }
}
