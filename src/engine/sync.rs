// ── Sync loop ──
//
// One supervisor task per running engine. While disconnected it performs the
// handshake plus initial discovery, backing off between attempts. Once
// connected it ticks at the poll interval and spawns at most one poll cycle
// at a time; a tick that finds a cycle still running is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Shared;
use super::connection::{ConnectionManager, ConnectionState};
use super::registry::Snapshot;
use crate::error::Error;

/// Held for the duration of one discovery cycle.
pub(crate) struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl InFlightGuard {
    /// `None` if a cycle already holds the flag.
    pub(crate) fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Supervisor: connect, poll until the connection drops, repeat.
pub(crate) async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        if !connect(&shared, &cancel).await {
            break;
        }
        poll_until_disconnected(&shared, &cancel).await;
        if cancel.is_cancelled() {
            break;
        }

        let delay = shared.connection.lock().await.next_retry_delay();
        info!("Gateway lost, reconnecting in {:?}", delay);
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
    debug!("sync loop stopped");
}

/// Handshake + initial discovery until it works. Returns `false` if
/// cancelled first.
async fn connect(shared: &Arc<Shared>, cancel: &CancellationToken) -> bool {
    loop {
        shared.transition(ConnectionManager::begin_connect).await;

        let attempt = async {
            shared.client.get_protocol_info().await?;
            discover(shared).await
        };
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return false,
            result = attempt => result,
        };

        match result {
            Ok(changes) => {
                shared.transition(ConnectionManager::connected).await;
                let registry = shared.registry.lock().await;
                if registry.is_empty() {
                    warn!("Gateway reports no usable devices");
                }
                info!(
                    "Connected to gateway, {} devices known, {} state changes",
                    registry.len(),
                    changes
                );
                return true;
            }
            Err(e) => {
                shared.transition(ConnectionManager::connect_failed).await;
                let delay = shared.connection.lock().await.next_retry_delay();
                warn!("Gateway connect failed: {}. Retrying in {:?}", e, delay);
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return false,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn poll_until_disconnected(shared: &Arc<Shared>, cancel: &CancellationToken) {
    let period = shared.config.poll_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut state_rx = shared.state_tx.subscribe();

    loop {
        if *state_rx.borrow_and_update() == ConnectionState::Disconnected {
            return;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = ticker.tick() => spawn_poll(shared, cancel),
        }
    }
}

fn spawn_poll(shared: &Arc<Shared>, cancel: &CancellationToken) {
    let Some(guard) = InFlightGuard::try_acquire(&shared.in_flight) else {
        debug!("Previous poll still in flight, skipping tick");
        return;
    };

    let shared = Arc::clone(shared);
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let _guard = guard;
        tokio::select! {
            biased;
            () = cancel.cancelled() => {}
            () = poll_cycle(&shared) => {}
        }
    });
}

async fn poll_cycle(shared: &Shared) {
    match discover(shared).await {
        Ok(changes) => {
            debug!("Poll cycle complete, {} state changes", changes);
            shared.transition(ConnectionManager::poll_succeeded).await;
        }
        Err(e) => {
            warn!("Poll cycle failed: {}", e);
            record_failure(shared).await;
        }
    }
}

/// Fetch both device lists, reconcile them and emit the changes.
/// Returns how many changes were emitted.
pub(crate) async fn discover(shared: &Shared) -> Result<usize, Error> {
    let ticket = shared.registry.lock().await.ticket();
    let (actuators, sensors) = tokio::try_join!(
        shared.client.list_actuators(),
        shared.client.list_sensors()
    )?;

    let snapshot = Snapshot::new(ticket, actuators.into_iter().chain(sensors).collect());
    let mut registry = shared.registry.lock().await;
    let changes = registry.reconcile(snapshot);
    shared.emit_all(&changes);
    Ok(changes.len())
}

/// Count a failed refresh (poll or push) against the connection.
pub(crate) async fn record_failure(shared: &Shared) {
    shared.transition(ConnectionManager::poll_failed).await;
}
