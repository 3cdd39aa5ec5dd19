use serde_json::Value;
use tracing::{debug, info, warn};

use super::events::EventStream;
use super::transport::Transport;
use super::{Device, DeviceKind, ProtocolInfo, Subtype};
use crate::error::{Error, ParseError};

/// Typed operations over the XS1 control API.
///
/// Owns command names and parameter construction. Transport errors are
/// passed through unchanged and nothing here retries.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    transport: Transport,
}

impl GatewayClient {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// Confirm the configured address answers like an XS1 gateway.
    pub async fn get_protocol_info(&self) -> Result<ProtocolInfo, Error> {
        let payload = self.transport.send("get_protocol_info", &[]).await?;

        if let Some(code) = gateway_error(&payload) {
            return Err(Error::HandshakeRejected(format!(
                "gateway answered error code {code}"
            )));
        }
        match payload.get("type").and_then(Value::as_str) {
            Some("get_protocol_info") => {
                let info = ProtocolInfo {
                    version: payload.get("version").and_then(Value::as_i64),
                };
                info!("Gateway protocol version {:?}", info.version);
                Ok(info)
            }
            other => Err(Error::HandshakeRejected(format!(
                "unexpected answer type {other:?}"
            ))),
        }
    }

    pub async fn list_actuators(&self) -> Result<Vec<Device>, Error> {
        self.list_devices("get_list_actuators", "actuator", DeviceKind::Actuator)
            .await
    }

    pub async fn list_sensors(&self) -> Result<Vec<Device>, Error> {
        self.list_devices("get_list_sensors", "sensor", DeviceKind::Sensor)
            .await
    }

    /// Validate and send a new actuator value. Returns the value the gateway
    /// reports as applied.
    pub async fn set_actuator(&self, id: u32, subtype: &Subtype, value: f64) -> Result<f64, Error> {
        if id == 0 {
            return Err(Error::Validation("actuator id must be positive".into()));
        }
        subtype.validate(value)?;

        let payload = self
            .transport
            .send(
                "set_state",
                &[("number", id.to_string()), ("value", value.to_string())],
            )
            .await?;

        if let Some(code) = gateway_error(&payload) {
            return Err(Error::Gateway { code });
        }

        let echoed = payload
            .get("actuator")
            .and_then(|actuator| actuator.get("value"))
            .and_then(Value::as_f64);
        Ok(echoed.unwrap_or_else(|| {
            debug!("set_state for actuator {} returned no value echo", id);
            value
        }))
    }

    /// Open the gateway's push subscription.
    pub async fn subscribe_events(&self) -> Result<EventStream, Error> {
        let response = self
            .transport
            .open_stream("subscribe", &[("format", "tsv".to_string())])
            .await?;
        Ok(EventStream::new(response, self.transport.clone()))
    }

    async fn list_devices(
        &self,
        command: &str,
        key: &str,
        kind: DeviceKind,
    ) -> Result<Vec<Device>, Error> {
        let payload = self.transport.send(command, &[]).await?;

        if let Some(code) = gateway_error(&payload) {
            return Err(Error::Gateway { code });
        }

        let entries = payload
            .get(key)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ParseError::UnexpectedShape(format!("{command} answer has no `{key}` array"))
            })?;

        let devices: Vec<Device> = entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match parse_entry(entry, kind) {
                Ok(device) => device,
                Err(reason) => {
                    warn!("Skipping {} entry #{}: {}", kind, index, reason);
                    None
                }
            })
            .collect();

        debug!("{} returned {} usable {}s", command, devices.len(), kind);
        Ok(devices)
    }
}

/// The gateway signals failures as `{"error": <code>}` with HTTP 200.
fn gateway_error(payload: &Value) -> Option<i64> {
    payload.get("error").and_then(Value::as_i64)
}

/// Map one list entry to a [`Device`].
///
/// `Ok(None)` marks an unused gateway slot; `Err` describes why a real entry
/// could not be used.
fn parse_entry(entry: &Value, kind: DeviceKind) -> Result<Option<Device>, String> {
    let raw_type = entry.get("type").and_then(Value::as_str).unwrap_or("unknown");
    if raw_type.eq_ignore_ascii_case("disabled") {
        return Ok(None);
    }

    let id = entry
        .get("id")
        .or_else(|| entry.get("number"))
        .and_then(Value::as_u64)
        .ok_or("missing numeric `id`")?;
    let id = u32::try_from(id)
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| format!("id {id} is not a positive 32-bit integer"))?;

    let name = entry
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| format!("id {id}: missing `name`"))?;

    let value = entry
        .get("value")
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("id {id}: missing numeric `value`"))?;

    let unit = entry
        .get("unit")
        .and_then(Value::as_str)
        .filter(|unit| !unit.is_empty())
        .map(String::from);

    let battery_low = match kind {
        DeviceKind::Actuator => None,
        DeviceKind::Sensor => battery_flag(entry),
    };

    Ok(Some(Device {
        id,
        name: name.to_string(),
        kind,
        subtype: Subtype::from_wire(raw_type),
        value,
        unit,
        battery_low,
    }))
}

/// Sensors report battery state either as a boolean or as a `state` list
/// containing `"batterylow"`.
fn battery_flag(entry: &Value) -> Option<bool> {
    if let Some(flag) = entry.get("battery_low").and_then(Value::as_bool) {
        return Some(flag);
    }
    entry.get("state").and_then(Value::as_array).map(|states| {
        states
            .iter()
            .filter_map(Value::as_str)
            .any(|state| state.eq_ignore_ascii_case("batterylow"))
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    // ── Helpers ─────────────────────────────────────────────────────

    async fn setup() -> (MockServer, GatewayClient) {
        let server = MockServer::start().await;
        let base = Url::parse(&server.uri()).unwrap();
        let transport = Transport::new(&base, Duration::from_secs(2)).unwrap();
        (server, GatewayClient::new(transport))
    }

    fn jsonp(payload: &Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_string(format!("x({payload})"))
    }

    async fn answer(server: &MockServer, cmd: &str, payload: Value) {
        Mock::given(method("GET"))
            .and(path("/control"))
            .and(query_param("cmd", cmd))
            .respond_with(jsonp(&payload))
            .mount(server)
            .await;
    }

    // ── Handshake ───────────────────────────────────────────────────

    #[tokio::test]
    async fn protocol_info_accepts_gateway_answer() {
        let (server, client) = setup().await;
        answer(&server, "get_protocol_info", json!({"type": "get_protocol_info", "version": 18})).await;

        let info = client.get_protocol_info().await.unwrap();
        assert_eq!(info.version, Some(18));
    }

    #[tokio::test]
    async fn protocol_info_rejects_foreign_answer() {
        let (server, client) = setup().await;
        answer(&server, "get_protocol_info", json!({"status": "ok"})).await;

        let result = client.get_protocol_info().await;
        assert!(
            matches!(result, Err(Error::HandshakeRejected(_))),
            "expected HandshakeRejected, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn protocol_info_passes_transport_errors_through() {
        let (server, client) = setup().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = client.get_protocol_info().await;
        assert!(matches!(result, Err(Error::HttpStatus { status: 404 })));
    }

    // ── Discovery ───────────────────────────────────────────────────

    #[tokio::test]
    async fn lists_actuators() {
        let (server, client) = setup().await;
        answer(
            &server,
            "get_list_actuators",
            json!({
                "type": "get_list_actuators",
                "actuator": [
                    {"id": 1, "name": "Living Room Light", "value": 0, "type": "switch"},
                    {"number": 2, "name": "Hall Dimmer", "value": 35.0, "type": "dimmer", "unit": "%"}
                ]
            }),
        )
        .await;

        let devices = client.list_actuators().await.unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, 1);
        assert_eq!(devices[0].name, "Living Room Light");
        assert_eq!(devices[0].kind, DeviceKind::Actuator);
        assert_eq!(devices[0].subtype, Subtype::Switch);
        assert_eq!(devices[0].value, 0.0);
        assert_eq!(devices[0].battery_low, None);
        assert_eq!(devices[1].id, 2);
        assert_eq!(devices[1].subtype, Subtype::Dimmer);
        assert_eq!(devices[1].unit.as_deref(), Some("%"));
    }

    #[tokio::test]
    async fn lists_sensors_with_battery_state() {
        let (server, client) = setup().await;
        answer(
            &server,
            "get_list_sensors",
            json!({
                "sensor": [
                    {"id": 1, "name": "Temperature Sensor", "value": 21.5, "unit": "°C"},
                    {"id": 2, "name": "Window", "value": 1, "type": "binary", "state": ["batterylow"]},
                    {"id": 3, "name": "Rain", "value": 0, "type": "rainfall", "battery_low": false}
                ]
            }),
        )
        .await;

        let devices = client.list_sensors().await.unwrap();

        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].value, 21.5);
        assert_eq!(devices[0].unit.as_deref(), Some("°C"));
        assert_eq!(devices[0].battery_low, None);
        assert_eq!(devices[1].battery_low, Some(true));
        assert_eq!(devices[2].battery_low, Some(false));
        assert_eq!(devices[2].subtype, Subtype::Other("rainfall".into()));
    }

    #[tokio::test]
    async fn skips_malformed_and_disabled_entries() {
        let (server, client) = setup().await;
        answer(
            &server,
            "get_list_actuators",
            json!({
                "actuator": [
                    {"id": 1, "name": "Good", "value": 1, "type": "switch"},
                    {"name": "No id", "value": 1},
                    {"id": 3, "value": 1},
                    {"id": 4, "name": "No value"},
                    {"id": 5, "name": "Text value", "value": "on"},
                    {"id": 0, "name": "Zero id", "value": 1},
                    {"id": 7, "name": "", "value": 0, "type": "disabled"}
                ]
            }),
        )
        .await;

        let devices = client.list_actuators().await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Good");
    }

    #[tokio::test]
    async fn missing_list_is_parse_error() {
        let (server, client) = setup().await;
        answer(&server, "get_list_sensors", json!({"type": "get_list_sensors"})).await;

        let result = client.list_sensors().await;
        assert!(
            matches!(result, Err(Error::Parse(ParseError::UnexpectedShape(_)))),
            "expected UnexpectedShape, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn gateway_error_object_is_reported() {
        let (server, client) = setup().await;
        answer(&server, "get_list_actuators", json!({"error": 3})).await;

        let result = client.list_actuators().await;
        assert!(matches!(result, Err(Error::Gateway { code: 3 })));
    }

    // ── Commands ────────────────────────────────────────────────────

    #[tokio::test]
    async fn set_actuator_sends_number_and_value() {
        let (server, client) = setup().await;
        Mock::given(method("GET"))
            .and(path("/control"))
            .and(query_param("cmd", "set_state"))
            .and(query_param("number", "2"))
            .and(query_param("value", "40"))
            .respond_with(jsonp(&json!({
                "type": "set_state",
                "actuator": {"number": 2, "name": "Hall Dimmer", "value": 40.0}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let applied = client.set_actuator(2, &Subtype::Dimmer, 40.0).await.unwrap();
        assert_eq!(applied, 40.0);
    }

    #[tokio::test]
    async fn set_actuator_falls_back_to_requested_value() {
        let (server, client) = setup().await;
        answer(&server, "set_state", json!({"type": "set_state"})).await;

        let applied = client.set_actuator(1, &Subtype::Switch, 1.0).await.unwrap();
        assert_eq!(applied, 1.0);
    }

    #[tokio::test]
    async fn out_of_range_value_never_reaches_gateway() {
        let (server, client) = setup().await;
        Mock::given(method("GET"))
            .respond_with(jsonp(&json!({})))
            .expect(0)
            .mount(&server)
            .await;

        let result = client.set_actuator(2, &Subtype::Dimmer, 150.0).await;
        assert!(matches!(result, Err(Error::Validation(_))));

        let result = client.set_actuator(0, &Subtype::Switch, 1.0).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
