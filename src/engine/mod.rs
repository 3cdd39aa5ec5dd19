//! Gateway synchronization engine.
//!
//! [`Engine`] is the explicit context object the host drives: `start()`
//! launches the sync loop (and the push listener when enabled),
//! `handle_command()` turns a pending write into a gateway call, `stop()`
//! tears everything down again. All mutable state lives in [`Shared`],
//! which the background tasks hold through an `Arc`.

pub mod connection;
mod dispatch;
mod push;
pub mod registry;
mod sync;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::store::{CONNECTION_PATH, RecordDefinition, StateRecord, StateStore, StateValue};
use crate::xs1::client::GatewayClient;
use crate::xs1::{Device, DeviceKey};

use self::connection::{Backoff, ConnectionManager, ConnectionState, Transition};
use self::registry::{Attribute, DeviceRegistry, StateChange};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    /// Consecutive failed polls tolerated in Degraded before disconnecting.
    pub failure_threshold: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub push_events: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            failure_threshold: 2,
            backoff_min: Duration::from_secs(5),
            backoff_max: Duration::from_secs(60),
            push_events: false,
        }
    }
}

/// What happened to a record handed to [`Engine::handle_command`].
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// `ack = true` records are status echoes, not commands.
    Ignored,
    /// The gateway applied the command; carries the updated device.
    Confirmed(Device),
}

/// State shared between the engine handle and its background tasks.
pub(crate) struct Shared {
    pub(crate) client: GatewayClient,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) registry: Mutex<DeviceRegistry>,
    pub(crate) connection: Mutex<ConnectionManager>,
    pub(crate) state_tx: watch::Sender<ConnectionState>,
    pub(crate) in_flight: Arc<AtomicBool>,
    pub(crate) device_locks: DashMap<DeviceKey, Arc<Mutex<()>>>,
    pub(crate) config: EngineConfig,
}

impl Shared {
    /// Feed one event into the connection manager and publish the result.
    ///
    /// The connection flag is written while the manager is still locked so
    /// concurrent transitions reach the store in the order they happened.
    pub(crate) async fn transition(
        &self,
        event: impl FnOnce(&mut ConnectionManager) -> Transition,
    ) -> Transition {
        let mut connection = self.connection.lock().await;
        let transition = event(&mut *connection);

        if transition.changed() {
            info!("Gateway connection {} -> {}", transition.from, transition.to);
            self.state_tx.send_replace(transition.to);
        } else if connection.state() == ConnectionState::Degraded {
            debug!(
                "Gateway still degraded, {} consecutive failures",
                connection.consecutive_failures()
            );
        }
        if let Some(online) = transition.online {
            self.store
                .set_state(StateRecord::confirmed(CONNECTION_PATH, StateValue::Bool(online)));
        }
        transition
    }

    /// Mirror registry changes into the host store. Callers hold the
    /// registry lock.
    pub(crate) fn emit_all(&self, changes: &[StateChange]) {
        for change in changes {
            self.emit(change);
        }
    }

    pub(crate) fn emit(&self, change: &StateChange) {
        match change {
            StateChange::Created(device) => {
                info!("Discovered {} \"{}\" ({})", device.key(), device.name, device.subtype.as_str());
                self.store.declare(device.definition(Attribute::Value));
                if device.battery_low.is_some() {
                    self.store.declare(device.definition(Attribute::BatteryLow));
                }
            }
            StateChange::AttributeAdded { device, attribute } => {
                self.store.declare(device.definition(*attribute));
            }
            StateChange::ValueChanged { device, attribute } => {
                let record = StateRecord::confirmed(
                    device.path(*attribute),
                    device.attribute_value(*attribute),
                );
                debug!("{} = {}", record.path, record.value);
                self.store.set_state(record);
            }
        }
    }
}

struct Running {
    poll_cancel: CancellationToken,
    push_cancel: CancellationToken,
    command_cancel: CancellationToken,
    sync_handle: JoinHandle<()>,
    push_handle: Option<JoinHandle<()>>,
}

pub struct Engine {
    shared: Arc<Shared>,
    lifecycle: Mutex<Option<Running>>,
}

impl Engine {
    pub fn new(client: GatewayClient, store: Arc<dyn StateStore>, config: EngineConfig) -> Self {
        let backoff = Backoff::new(config.backoff_min, config.backoff_max);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            shared: Arc::new(Shared {
                client,
                store,
                registry: Mutex::new(DeviceRegistry::new()),
                connection: Mutex::new(ConnectionManager::new(config.failure_threshold, backoff)),
                state_tx,
                in_flight: Arc::new(AtomicBool::new(false)),
                device_locks: DashMap::new(),
                config,
            }),
            lifecycle: Mutex::new(None),
        }
    }

    /// Launch the background tasks. Calling it on a running engine does
    /// nothing.
    pub async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            warn!("Engine already running");
            return;
        }

        self.shared.store.declare(RecordDefinition {
            path: CONNECTION_PATH.into(),
            name: "Gateway connected".into(),
            writable: false,
            role: "indicator.connected".into(),
            unit: None,
        });
        let offline = StateValue::Bool(false);
        if self.shared.store.get_state(CONNECTION_PATH).map(|r| r.value) != Some(offline) {
            self.shared
                .store
                .set_state(StateRecord::confirmed(CONNECTION_PATH, offline));
        }

        let poll_cancel = CancellationToken::new();
        let push_cancel = CancellationToken::new();
        let command_cancel = CancellationToken::new();

        let sync_handle = tokio::spawn(sync::run(Arc::clone(&self.shared), poll_cancel.clone()));
        let push_handle = self
            .shared
            .config
            .push_events
            .then(|| tokio::spawn(push::run(Arc::clone(&self.shared), push_cancel.clone())));

        info!(
            "Engine started (poll every {:?}, push events {})",
            self.shared.config.poll_interval,
            if push_handle.is_some() { "on" } else { "off" },
        );

        *lifecycle = Some(Running {
            poll_cancel,
            push_cancel,
            command_cancel,
            sync_handle,
            push_handle,
        });
    }

    /// Act on a record the host wrote.
    ///
    /// Only `ack = false` records are commands. On success the confirmed
    /// value has already been written back to the store with `ack = true`
    /// by the time this returns.
    pub async fn handle_command(&self, record: &StateRecord) -> Result<CommandOutcome, Error> {
        if record.ack {
            return Ok(CommandOutcome::Ignored);
        }

        let cancel = match self.lifecycle.lock().await.as_ref() {
            Some(running) => running.command_cancel.clone(),
            None => return Err(Error::NotRunning),
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::NotRunning),
            result = dispatch::dispatch(&self.shared, &record.path, record.value) => result,
        };

        match result {
            Ok(device) => {
                info!("Command {} = {} confirmed", record.path, device.value);
                Ok(CommandOutcome::Confirmed(device))
            }
            Err(e) => {
                warn!("Command {} = {} failed: {}", record.path, record.value, e);
                Err(e)
            }
        }
    }

    /// Cancel the sync loop, then the push listener, then any pending
    /// commands, and drop the connection flag.
    pub async fn stop(&self) {
        let Some(running) = self.lifecycle.lock().await.take() else {
            return;
        };

        running.poll_cancel.cancel();
        if let Err(e) = running.sync_handle.await {
            warn!("Sync loop ended abnormally: {}", e);
        }

        running.push_cancel.cancel();
        if let Some(handle) = running.push_handle
            && let Err(e) = handle.await
        {
            warn!("Push listener ended abnormally: {}", e);
        }

        running.command_cancel.cancel();
        self.shared.transition(ConnectionManager::shutdown).await;
        info!("Engine stopped");
    }

    /// Watch connection state changes.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.shared.registry.lock().await.devices().cloned().collect()
    }
}
