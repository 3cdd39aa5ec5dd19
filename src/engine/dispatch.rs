// ── Command dispatcher ──
//
// Turns a pending host write into one gateway call. Commands for the same
// device queue behind a per-device lock; different devices proceed in
// parallel. The confirmation goes through the registry so a poll that was
// already in flight cannot revert it.

use std::sync::Arc;

use tracing::debug;

use super::Shared;
use super::registry::{Attribute, StateChange};
use crate::error::Error;
use crate::store::StateValue;
use crate::xs1::{Device, DeviceKind};

pub(crate) async fn dispatch(shared: &Shared, path: &str, value: StateValue) -> Result<Device, Error> {
    let key = {
        let registry = shared.registry.lock().await;
        let device = registry
            .resolve(path)
            .ok_or_else(|| Error::UnknownDevice(path.to_string()))?;
        if device.kind == DeviceKind::Sensor {
            return Err(Error::Validation(format!("{path} is read-only")));
        }
        device.key()
    };

    let lock = Arc::clone(shared.device_locks.entry(key).or_default().value());
    let _serial = lock.lock().await;

    // Subtype may have changed while we queued.
    let subtype = shared
        .registry
        .lock()
        .await
        .get(key)
        .map(|device| device.subtype.clone())
        .ok_or_else(|| Error::UnknownDevice(path.to_string()))?;

    debug!("Sending {} = {} to {}", path, value, key);
    let applied = shared
        .client
        .set_actuator(key.id, &subtype, value.as_f64())
        .await?;

    let mut registry = shared.registry.lock().await;
    let device = registry.apply_command_result(key, applied)?;
    shared.emit(&StateChange::ValueChanged {
        device: device.clone(),
        attribute: Attribute::Value,
    });
    Ok(device)
}
