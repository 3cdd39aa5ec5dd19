mod config;
mod engine;
mod error;
mod links;
mod mqtt;
mod store;
mod xs1;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineConfig};
use crate::store::{MemoryStore, StoreEvent};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting xs1-to-mqtt bridge (gateway={}, mqtt={}:{}, links={})",
        config.gateway.url,
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.links.len(),
    );

    for link in &config.links {
        info!("  Link: {} -> {}", link.sensor, link.actuator);
    }

    let transport = match xs1::transport::Transport::new(&config.gateway.url, config.request_timeout()) {
        Ok(t) => t,
        Err(e) => {
            error!("Gateway client setup failed: {}", e);
            std::process::exit(1);
        }
    };

    let store = Arc::new(MemoryStore::new());
    let engine_config: EngineConfig = config.engine_config();
    let engine = Arc::new(Engine::new(
        xs1::client::GatewayClient::new(transport),
        store.clone(),
        engine_config,
    ));

    // Subscribe before anything can write so no command is missed.
    let mut store_events = store.subscribe();

    let mqtt_client = mqtt::client::MqttClient::new(&config, store.clone());
    let mqtt_handle = tokio::spawn(async move {
        mqtt_client.run().await;
    });

    let links_handle = tokio::spawn(links::run(
        store.clone(),
        links::LinkTable::new(&config.links),
        store.subscribe(),
    ));

    engine.start().await;

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::process::exit(1);
        }
    };

    // Main loop: hand pending writes to the engine + handle shutdown
    loop {
        tokio::select! {
            received = store_events.recv() => {
                match received {
                    Ok(StoreEvent::Updated(record)) if !record.ack => {
                        let engine = Arc::clone(&engine);
                        tokio::spawn(async move {
                            // Failures are logged by the engine.
                            if let Ok(outcome) = engine.handle_command(&record).await {
                                debug!("{} -> {:?}", record.path, outcome);
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Command pump lagged, {} store events dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Cleanup
    info!(
        "Stopping engine ({} devices known, gateway {})",
        engine.devices().await.len(),
        *engine.connection_state().borrow()
    );
    engine.stop().await;
    links_handle.abort();
    mqtt_handle.abort();
    info!("xs1-to-mqtt bridge stopped");
}
