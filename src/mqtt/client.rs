use std::collections::HashMap;
use std::sync::Arc;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::store::{MemoryStore, RecordDefinition, StateRecord, StateValue, StoreEvent};

pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    config: Config,
    store: Arc<MemoryStore>,
    /// Last payload published per topic.
    last_values: HashMap<String, String>,
}

impl MqttClient {
    pub fn new(config: &Config, store: Arc<MemoryStore>) -> Self {
        let mut mqttopts = MqttOptions::new(
            &config.mqtt.client_id,
            &config.mqtt.broker_host,
            config.mqtt.broker_port,
        );
        mqttopts.set_keep_alive(std::time::Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
            mqttopts.set_credentials(user, pass);
        }

        // LWT: broker publishes "offline" if we drop off.
        let lwt = rumqttc::LastWill::new(
            config.bridge_status_topic(),
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        );
        mqttopts.set_last_will(lwt);

        let (client, eventloop) = AsyncClient::new(mqttopts, 100);

        Self {
            client,
            eventloop,
            config: config.clone(),
            store,
            last_values: HashMap::new(),
        }
    }

    /// Run the MQTT event loop. Mirrors acknowledged store records to
    /// retained topics and turns messages on command topics into pending
    /// writes on the store.
    pub async fn run(mut self) {
        let mut events = self.store.subscribe();

        loop {
            tokio::select! {
                event = self.eventloop.poll() => {
                    match event {
                        Ok(event) => self.handle_event(event).await,
                        Err(e) => {
                            error!("MQTT connection error: {}. Reconnecting...", e);
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        }
                    }
                }
                received = events.recv() => {
                    match received {
                        Ok(StoreEvent::Updated(record)) if record.ack => {
                            if self.publish_record(&record).await {
                                self.flush().await;
                            }
                        }
                        Ok(StoreEvent::Updated(_)) => {}
                        Ok(StoreEvent::Declared(definition)) => {
                            self.publish_definition(&definition).await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("MQTT mirror lagged by {} store events, republishing", skipped);
                            self.republish_all();
                        }
                        Err(RecvError::Closed) => {
                            info!("State store closed, stopping MQTT mirror");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        let Event::Incoming(incoming) = event else {
            return;
        };
        match incoming {
            Incoming::ConnAck(_) => {
                info!("Connected to MQTT broker");

                let status_topic = self.config.bridge_status_topic();
                if let Err(e) = self
                    .client
                    .publish(&status_topic, QoS::AtLeastOnce, true, "online")
                    .await
                {
                    error!("Failed to publish online status: {}", e);
                }

                let command_topic = self.config.command_subscription();
                if let Err(e) = self
                    .client
                    .subscribe(&command_topic, QoS::AtLeastOnce)
                    .await
                {
                    error!("Failed to subscribe to {}: {}", command_topic, e);
                }

                // Broker may have lost retained state while we were away.
                self.last_values.clear();
                self.republish_all();
            }
            Incoming::Publish(publish) => {
                let payload = String::from_utf8_lossy(&publish.payload);
                let Some(path) = parse_command_topic(&publish.topic, &self.config.mqtt.topic_prefix)
                else {
                    debug!("Ignoring message on {}", publish.topic);
                    return;
                };
                match parse_payload(&payload) {
                    Some(value) => {
                        info!("Command {} = {}", path, value);
                        self.store.write(&path, value);
                    }
                    None => warn!("Could not parse command for {}: {:?}", path, payload),
                }
            }
            _ => {}
        }
    }

    /// Returns whether anything was sent.
    async fn publish_record(&mut self, record: &StateRecord) -> bool {
        let (topic, payload) = self.state_message(record);
        if self.last_values.get(&topic) == Some(&payload) {
            return false;
        }

        info!("Publishing {}: {}", topic, payload);
        if let Err(e) = self
            .client
            .publish(&topic, QoS::AtMostOnce, true, payload.as_bytes())
            .await
        {
            warn!("Failed to publish {}: {}", topic, e);
            return false;
        }
        self.last_values.insert(topic, payload);
        true
    }

    async fn publish_definition(&mut self, definition: &RecordDefinition) {
        let Some((topic, payload)) = self.meta_message(definition) else {
            return;
        };
        if let Err(e) = self
            .client
            .publish(&topic, QoS::AtLeastOnce, true, payload)
            .await
        {
            warn!("Failed to publish {}: {}", topic, e);
        }
    }

    /// Queue every known record again. Runs on its own task so the event
    /// loop keeps draining the request channel meanwhile.
    fn republish_all(&mut self) {
        let mut messages = Vec::new();
        for record in self.store.records() {
            if let Some(definition) = self.store.definition(&record.path)
                && let Some((topic, payload)) = self.meta_message(&definition)
            {
                messages.push((topic, QoS::AtLeastOnce, payload));
            }
            if record.ack {
                let (topic, payload) = self.state_message(&record);
                self.last_values.insert(topic.clone(), payload.clone());
                messages.push((topic, QoS::AtMostOnce, payload));
            }
        }

        info!("Republishing {} retained messages", messages.len());
        let client = self.client.clone();
        tokio::spawn(async move {
            for (topic, qos, payload) in messages {
                if let Err(e) = client.publish(&topic, qos, true, payload).await {
                    warn!("Failed to publish {}: {}", topic, e);
                }
            }
        });
    }

    fn state_message(&self, record: &StateRecord) -> (String, String) {
        (self.config.topic_for_path(&record.path), record.value.to_string())
    }

    fn meta_message(&self, definition: &RecordDefinition) -> Option<(String, String)> {
        let topic = format!("{}/meta", self.config.topic_for_path(&definition.path));
        match serde_json::to_string(definition) {
            Ok(payload) => Some((topic, payload)),
            Err(e) => {
                warn!("Failed to encode metadata for {}: {}", definition.path, e);
                None
            }
        }
    }

    /// Drive the event loop once so the publish reaches the socket now.
    async fn flush(&mut self) {
        match self.eventloop.poll().await {
            Ok(event) => self.handle_event(event).await,
            Err(e) => error!("MQTT error after publish flush: {}", e),
        }
    }
}

/// Map a command topic to the record path it targets.
/// Expected format: {prefix}/Actuators/{name}/state/set
fn parse_command_topic(topic: &str, prefix: &str) -> Option<String> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix("/Actuators/")?;
    let name = rest.strip_suffix("/state/set")?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some(format!("Actuators.{name}.state"))
}

fn parse_payload(payload: &str) -> Option<StateValue> {
    match payload.trim().to_ascii_lowercase().as_str() {
        "on" | "true" => Some(StateValue::Bool(true)),
        "off" | "false" => Some(StateValue::Bool(false)),
        other => other
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(StateValue::Number),
    }
}
