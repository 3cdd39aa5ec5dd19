// ── Push listener ──
//
// Optional low-latency path. While the connection is online, keep the
// gateway's event subscription open and feed every update into the registry.
// Failures count against the connection like a failed poll, but the poll loop
// keeps running either way.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Shared;
use super::connection::Backoff;
use super::sync;
use crate::error::Error;

pub(crate) async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut backoff = Backoff::new(shared.config.backoff_min, shared.config.backoff_max);
    let mut state_rx = shared.state_tx.subscribe();

    loop {
        // Only subscribe while the gateway is known to answer.
        while !state_rx.borrow_and_update().is_online() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            result = listen(&shared, &mut backoff) => result,
        };

        let delay = match result {
            Ok(()) => {
                info!("Gateway closed the event stream, reopening");
                backoff.next_delay()
            }
            Err(e) => {
                warn!("Event stream failed: {}", e);
                if e.is_connection_failure() {
                    sync::record_failure(&shared).await;
                }
                backoff.next_delay()
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn listen(shared: &Shared, backoff: &mut Backoff) -> Result<(), Error> {
    let mut stream = shared.client.subscribe_events().await?;
    info!("Subscribed to gateway events");
    backoff.reset();

    while let Some(update) = stream.next_update().await? {
        debug!("Push update {} \"{}\" = {}", update.key(), update.name, update.value);
        let mut registry = shared.registry.lock().await;
        let changes = registry.apply_update(&update);
        shared.emit_all(&changes);
    }
    Ok(())
}
