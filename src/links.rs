// Device links: a sensor's confirmed value is copied onto one or more
// actuators as a pending command, which the engine then dispatches like any
// other host write.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::store::{MemoryStore, StateRecord, StateValue, StoreEvent};

pub struct LinkTable {
    /// Sensor value path → actuator state paths.
    targets: HashMap<String, Vec<String>>,
    /// Sensor paths whose first value has been observed.
    seen: HashSet<String>,
}

impl LinkTable {
    pub fn new(links: &[LinkConfig]) -> Self {
        let mut targets: HashMap<String, Vec<String>> = HashMap::new();
        for link in links {
            targets
                .entry(format!("Sensors.{}.value", segment(&link.sensor)))
                .or_default()
                .push(format!("Actuators.{}.state", segment(&link.actuator)));
        }
        Self {
            targets,
            seen: HashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Writes to issue for one store update. The first value seen for a
    /// sensor is its initial state, not a change, and triggers nothing.
    pub fn on_update(&mut self, record: &StateRecord) -> Vec<(String, StateValue)> {
        if !record.ack {
            return Vec::new();
        }
        let Some(targets) = self.targets.get(&record.path) else {
            return Vec::new();
        };
        if self.seen.insert(record.path.clone()) {
            return Vec::new();
        }
        targets
            .iter()
            .map(|target| (target.clone(), record.value))
            .collect()
    }
}

/// Device names become one path segment.
fn segment(name: &str) -> String {
    name.trim().replace('.', "_")
}

/// Takes a receiver subscribed before the engine starts, so the first
/// sensor values are seen.
pub async fn run(
    store: Arc<MemoryStore>,
    mut table: LinkTable,
    mut events: broadcast::Receiver<StoreEvent>,
) {
    if table.is_empty() {
        return;
    }
    info!("Device links active for {} sensors", table.targets.len());

    loop {
        match events.recv().await {
            Ok(StoreEvent::Updated(record)) => {
                for (target, value) in table.on_update(&record) {
                    debug!("Link {} -> {} = {}", record.path, target, value);
                    store.write(&target, value);
                }
            }
            Ok(StoreEvent::Declared(_)) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Link handler lagged by {} store events", skipped);
            }
            Err(RecvError::Closed) => return,
        }
    }
}
