// ── Device registry ──
//
// In-memory mirror of every device seen on the gateway. Poll snapshots and
// push updates are diffed against it; command confirmations are written into
// it directly. No I/O happens here.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::error::Error;
use crate::store::{RecordDefinition, StateValue};
use crate::xs1::{Device, DeviceKey, DeviceKind, PushUpdate};

/// Which attribute of a device a record mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Value,
    BatteryLow,
}

impl Device {
    /// Deterministic host path for one attribute of this device.
    pub fn path(&self, attribute: Attribute) -> String {
        let segment = self.name.replace('.', "_");
        let leaf = match (self.kind, attribute) {
            (DeviceKind::Actuator, _) => "state",
            (DeviceKind::Sensor, Attribute::Value) => "value",
            (DeviceKind::Sensor, Attribute::BatteryLow) => "battery_low",
        };
        format!("{}.{segment}.{leaf}", self.kind.path_root())
    }

    pub fn attribute_value(&self, attribute: Attribute) -> StateValue {
        match attribute {
            Attribute::Value => StateValue::Number(self.value),
            Attribute::BatteryLow => StateValue::Bool(self.battery_low.unwrap_or(false)),
        }
    }

    pub fn definition(&self, attribute: Attribute) -> RecordDefinition {
        match attribute {
            Attribute::Value => RecordDefinition {
                path: self.path(attribute),
                name: self.name.clone(),
                writable: self.kind == DeviceKind::Actuator,
                role: self.subtype.as_str().to_string(),
                unit: self.unit.clone(),
            },
            Attribute::BatteryLow => RecordDefinition {
                path: self.path(attribute),
                name: format!("{} battery low", self.name),
                writable: false,
                role: "indicator.lowbat".into(),
                unit: None,
            },
        }
    }
}

/// A difference between the registry and the gateway, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    /// First sighting. Always followed by the initial value change(s).
    Created(Device),
    /// A known device started reporting another attribute.
    AttributeAdded { device: Device, attribute: Attribute },
    ValueChanged { device: Device, attribute: Attribute },
}

/// Registry epoch observed before a discovery request went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotTicket(u64);

/// All devices returned by one discovery round.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub ticket: SnapshotTicket,
    pub devices: Vec<Device>,
}

impl Snapshot {
    pub fn new(ticket: SnapshotTicket, devices: Vec<Device>) -> Self {
        Self { ticket, devices }
    }
}

#[derive(Debug)]
struct Entry {
    device: Device,
    /// Epoch of the last command confirmation, 0 if none.
    confirmed_at: u64,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: BTreeMap<DeviceKey, Entry>,
    by_path: HashMap<String, DeviceKey>,
    epoch: u64,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: DeviceKey) -> Option<&Device> {
        self.entries.get(&key).map(|entry| &entry.device)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.entries.values().map(|entry| &entry.device)
    }

    /// Find the device behind a host path (any of its attributes).
    pub fn resolve(&self, path: &str) -> Option<&Device> {
        self.by_path.get(path).and_then(|key| self.get(*key))
    }

    /// Take before starting discovery; pass into the resulting [`Snapshot`].
    pub fn ticket(&self) -> SnapshotTicket {
        SnapshotTicket(self.epoch)
    }

    /// Diff a discovery snapshot into the registry.
    ///
    /// Devices missing from the snapshot are left as they are. A device
    /// confirmed by a command after the snapshot's ticket was taken keeps
    /// the confirmed value; the next poll will observe it.
    pub fn reconcile(&mut self, snapshot: Snapshot) -> Vec<StateChange> {
        let mut changes = Vec::new();

        for device in snapshot.devices {
            let key = device.key();
            match self.entries.get_mut(&key) {
                None => self.insert(device, &mut changes),
                Some(entry) if entry.confirmed_at > snapshot.ticket.0 => {
                    debug!("Ignoring stale poll value for {} (command confirmed since)", key);
                }
                Some(entry) => {
                    let current = &mut entry.device;
                    if current.subtype != device.subtype {
                        current.subtype = device.subtype;
                    }
                    if current.unit != device.unit {
                        current.unit = device.unit;
                    }
                    if current.value != device.value {
                        current.value = device.value;
                        if owns(&self.by_path, key, &current.path(Attribute::Value)) {
                            changes.push(StateChange::ValueChanged {
                                device: current.clone(),
                                attribute: Attribute::Value,
                            });
                        }
                    }
                    if device.battery_low.is_some() && current.battery_low != device.battery_low {
                        let first_report = current.battery_low.is_none();
                        current.battery_low = device.battery_low;
                        let path = current.path(Attribute::BatteryLow);
                        if first_report && claim(&mut self.by_path, key, &path) {
                            changes.push(StateChange::AttributeAdded {
                                device: current.clone(),
                                attribute: Attribute::BatteryLow,
                            });
                        }
                        if owns(&self.by_path, key, &path) {
                            changes.push(StateChange::ValueChanged {
                                device: current.clone(),
                                attribute: Attribute::BatteryLow,
                            });
                        }
                    }
                }
            }
        }

        changes
    }

    /// Apply a confirmed command result.
    pub fn apply_command_result(&mut self, key: DeviceKey, value: f64) -> Result<Device, Error> {
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| Error::UnknownDevice(key.to_string()))?;

        self.epoch += 1;
        entry.confirmed_at = self.epoch;
        entry.device.value = value;
        Ok(entry.device.clone())
    }

    /// Apply one pushed value. Unknown devices wait for the next discovery.
    pub fn apply_update(&mut self, update: &PushUpdate) -> Vec<StateChange> {
        let Some(entry) = self.entries.get_mut(&update.key()) else {
            debug!("Push update for unknown {}, waiting for discovery", update.key());
            return Vec::new();
        };
        if entry.device.subtype != update.subtype {
            entry.device.subtype = update.subtype.clone();
        }
        if entry.device.value == update.value {
            return Vec::new();
        }
        entry.device.value = update.value;
        if !owns(&self.by_path, update.key(), &entry.device.path(Attribute::Value)) {
            return Vec::new();
        }
        vec![StateChange::ValueChanged {
            device: entry.device.clone(),
            attribute: Attribute::Value,
        }]
    }

    fn insert(&mut self, device: Device, changes: &mut Vec<StateChange>) {
        let key = device.key();
        let mut attributes = vec![Attribute::Value];
        if device.battery_low.is_some() {
            attributes.push(Attribute::BatteryLow);
        }

        // Only attributes whose path this device owns are ever emitted.
        attributes.retain(|attribute| claim(&mut self.by_path, key, &device.path(*attribute)));

        if attributes.first() == Some(&Attribute::Value) {
            changes.push(StateChange::Created(device.clone()));
        }
        for attribute in attributes {
            changes.push(StateChange::ValueChanged {
                device: device.clone(),
                attribute,
            });
        }
        self.entries.insert(
            key,
            Entry {
                device,
                confirmed_at: 0,
            },
        );
    }
}

fn owns(by_path: &HashMap<String, DeviceKey>, key: DeviceKey, path: &str) -> bool {
    by_path.get(path) == Some(&key)
}

/// Register `path` for `key` unless another device already holds it.
fn claim(by_path: &mut HashMap<String, DeviceKey>, key: DeviceKey, path: &str) -> bool {
    match by_path.get(path) {
        Some(existing) if *existing == key => true,
        Some(existing) => {
            warn!(
                "{} shares path {} with {}; commands and records stay with {}",
                key, path, existing, existing
            );
            false
        }
        None => {
            by_path.insert(path.to_string(), key);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xs1::Subtype;

    fn actuator(id: u32, name: &str, value: f64) -> Device {
        Device {
            id,
            name: name.into(),
            kind: DeviceKind::Actuator,
            subtype: Subtype::Dimmer,
            value,
            unit: None,
            battery_low: None,
        }
    }

    fn sensor(id: u32, name: &str, value: f64, battery_low: Option<bool>) -> Device {
        Device {
            id,
            name: name.into(),
            kind: DeviceKind::Sensor,
            subtype: Subtype::Temperature,
            value,
            unit: Some("°C".into()),
            battery_low,
        }
    }

    fn reconcile(registry: &mut DeviceRegistry, devices: Vec<Device>) -> Vec<StateChange> {
        let snapshot = Snapshot::new(registry.ticket(), devices);
        registry.reconcile(snapshot)
    }

    #[test]
    fn paths_follow_kind_and_name() {
        assert_eq!(
            actuator(1, "Living Room Light", 0.0).path(Attribute::Value),
            "Actuators.Living Room Light.state"
        );
        let temp = sensor(1, "Temperature Sensor", 21.5, None);
        assert_eq!(temp.path(Attribute::Value), "Sensors.Temperature Sensor.value");
        assert_eq!(temp.path(Attribute::BatteryLow), "Sensors.Temperature Sensor.battery_low");
        assert_eq!(actuator(2, "Lamp v1.2", 0.0).path(Attribute::Value), "Actuators.Lamp v1_2.state");
    }

    #[test]
    fn new_device_emits_created_then_value() {
        let mut registry = DeviceRegistry::new();
        let changes = reconcile(&mut registry, vec![actuator(1, "Lamp", 0.0)]);

        assert_eq!(changes.len(), 2);
        assert!(matches!(&changes[0], StateChange::Created(d) if d.id == 1));
        assert!(matches!(
            &changes[1],
            StateChange::ValueChanged { device, attribute: Attribute::Value } if device.value == 0.0
        ));
    }

    #[test]
    fn sensor_with_battery_flag_emits_both_attributes() {
        let mut registry = DeviceRegistry::new();
        let changes = reconcile(&mut registry, vec![sensor(4, "Window", 1.0, Some(false))]);

        assert_eq!(changes.len(), 3);
        assert!(matches!(
            &changes[2],
            StateChange::ValueChanged { attribute: Attribute::BatteryLow, .. }
        ));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut registry = DeviceRegistry::new();
        let devices = vec![
            actuator(1, "Lamp", 0.0),
            sensor(1, "Temperature Sensor", 21.5, Some(false)),
        ];

        assert!(!reconcile(&mut registry, devices.clone()).is_empty());
        assert!(reconcile(&mut registry, devices).is_empty());
    }

    #[test]
    fn actuator_and_sensor_may_share_an_id() {
        let mut registry = DeviceRegistry::new();
        reconcile(
            &mut registry,
            vec![actuator(1, "Lamp", 0.0), sensor(1, "Temp", 20.0, None)],
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn value_change_is_emitted_once() {
        let mut registry = DeviceRegistry::new();
        reconcile(&mut registry, vec![actuator(1, "Lamp", 0.0)]);

        let changes = reconcile(&mut registry, vec![actuator(1, "Lamp", 60.0)]);
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            &changes[0],
            StateChange::ValueChanged { device, attribute: Attribute::Value } if device.value == 60.0
        ));
        assert!(reconcile(&mut registry, vec![actuator(1, "Lamp", 60.0)]).is_empty());
    }

    #[test]
    fn battery_edge_is_a_change() {
        let mut registry = DeviceRegistry::new();
        reconcile(&mut registry, vec![sensor(2, "Door", 0.0, Some(false))]);

        let changes = reconcile(&mut registry, vec![sensor(2, "Door", 0.0, Some(true))]);
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            &changes[0],
            StateChange::ValueChanged { device, attribute: Attribute::BatteryLow }
                if device.battery_low == Some(true)
        ));
    }

    #[test]
    fn vanished_devices_are_left_untouched() {
        let mut registry = DeviceRegistry::new();
        reconcile(&mut registry, vec![actuator(1, "Lamp", 30.0), actuator(2, "Fan", 1.0)]);

        let changes = reconcile(&mut registry, vec![actuator(1, "Lamp", 30.0)]);
        assert!(changes.is_empty());
        assert_eq!(registry.len(), 2);
        let fan = registry.resolve("Actuators.Fan.state").unwrap();
        assert_eq!(fan.value, 1.0);
    }

    #[test]
    fn resolve_maps_paths_to_devices() {
        let mut registry = DeviceRegistry::new();
        reconcile(
            &mut registry,
            vec![actuator(7, "Hall Dimmer", 0.0), sensor(3, "Door", 0.0, Some(false))],
        );

        assert_eq!(registry.resolve("Actuators.Hall Dimmer.state").unwrap().id, 7);
        assert_eq!(registry.resolve("Sensors.Door.battery_low").unwrap().id, 3);
        assert!(registry.resolve("Actuators.Missing.state").is_none());
    }

    #[test]
    fn command_result_updates_value() {
        let mut registry = DeviceRegistry::new();
        reconcile(&mut registry, vec![actuator(1, "Dimmer", 0.0)]);

        let key = DeviceKey { kind: DeviceKind::Actuator, id: 1 };
        let device = registry.apply_command_result(key, 40.0).unwrap();
        assert_eq!(device.value, 40.0);
        assert_eq!(registry.get(key).unwrap().value, 40.0);
    }

    #[test]
    fn command_result_for_unknown_device_fails() {
        let mut registry = DeviceRegistry::new();
        let key = DeviceKey { kind: DeviceKind::Actuator, id: 9 };
        assert!(matches!(
            registry.apply_command_result(key, 1.0),
            Err(Error::UnknownDevice(_))
        ));
    }

    #[test]
    fn stale_snapshot_does_not_revert_confirmation() {
        let mut registry = DeviceRegistry::new();
        reconcile(&mut registry, vec![actuator(1, "Dimmer", 0.0)]);
        let key = DeviceKey { kind: DeviceKind::Actuator, id: 1 };

        // Poll starts, then a command is confirmed before the poll answers.
        let ticket = registry.ticket();
        registry.apply_command_result(key, 40.0).unwrap();
        let changes = registry.reconcile(Snapshot::new(ticket, vec![actuator(1, "Dimmer", 0.0)]));

        assert!(changes.is_empty());
        assert_eq!(registry.get(key).unwrap().value, 40.0);

        // A poll started after the confirmation is authoritative again.
        let changes = reconcile(&mut registry, vec![actuator(1, "Dimmer", 10.0)]);
        assert_eq!(changes.len(), 1);
        assert_eq!(registry.get(key).unwrap().value, 10.0);
    }

    #[test]
    fn push_updates_known_devices_only() {
        let mut registry = DeviceRegistry::new();
        reconcile(&mut registry, vec![actuator(1, "Lamp", 0.0)]);

        let update = PushUpdate {
            kind: DeviceKind::Actuator,
            id: 1,
            name: "Lamp".into(),
            subtype: Subtype::Dimmer,
            value: 75.0,
        };
        assert_eq!(registry.apply_update(&update).len(), 1);
        assert!(registry.apply_update(&update).is_empty());

        let unknown = PushUpdate { id: 2, ..update };
        assert!(registry.apply_update(&unknown).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_names_resolve_to_first_device() {
        let mut registry = DeviceRegistry::new();
        reconcile(&mut registry, vec![actuator(1, "Lamp", 0.0), actuator(2, "Lamp", 0.0)]);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("Actuators.Lamp.state").unwrap().id, 1);
    }

    #[test]
    fn shared_path_only_carries_the_first_device() {
        let mut registry = DeviceRegistry::new();
        let changes = reconcile(
            &mut registry,
            vec![actuator(1, "Lamp", 0.0), actuator(2, "Lamp", 100.0)],
        );

        let created: Vec<u32> = changes
            .iter()
            .filter_map(|c| match c {
                StateChange::Created(d) => Some(d.id),
                _ => None,
            })
            .collect();
        assert_eq!(created, vec![1]);
        let values: Vec<f64> = changes
            .iter()
            .filter_map(|c| match c {
                StateChange::ValueChanged { device, .. } => Some(device.value),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![0.0]);
        assert_eq!(registry.resolve("Actuators.Lamp.state").unwrap().id, 1);

        // The second device is still tracked but never reaches the record.
        let changes = reconcile(
            &mut registry,
            vec![actuator(1, "Lamp", 0.0), actuator(2, "Lamp", 50.0)],
        );
        assert!(changes.is_empty());
        let key = DeviceKey { kind: DeviceKind::Actuator, id: 2 };
        assert_eq!(registry.get(key).unwrap().value, 50.0);

        let update = PushUpdate {
            kind: DeviceKind::Actuator,
            id: 2,
            name: "Lamp".into(),
            subtype: Subtype::Dimmer,
            value: 75.0,
        };
        assert!(registry.apply_update(&update).is_empty());
    }

    #[test]
    fn late_battery_flag_is_declared_and_resolvable() {
        let mut registry = DeviceRegistry::new();
        reconcile(&mut registry, vec![sensor(2, "Door", 0.0, None)]);
        assert!(registry.resolve("Sensors.Door.battery_low").is_none());

        let changes = reconcile(&mut registry, vec![sensor(2, "Door", 0.0, Some(false))]);
        assert_eq!(changes.len(), 2);
        assert!(matches!(
            &changes[0],
            StateChange::AttributeAdded { attribute: Attribute::BatteryLow, .. }
        ));
        assert!(matches!(
            &changes[1],
            StateChange::ValueChanged { device, attribute: Attribute::BatteryLow }
                if device.battery_low == Some(false)
        ));
        assert_eq!(registry.resolve("Sensors.Door.battery_low").unwrap().id, 2);

        // Later edges are plain value changes.
        let changes = reconcile(&mut registry, vec![sensor(2, "Door", 0.0, Some(true))]);
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], StateChange::ValueChanged { .. }));
    }
}
