use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Packet, QoS};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::state::{FeederStatus, PumpStatus, StatusUpdate};

/// Back-off after a transport error before polling the event loop again.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Inbound status record. Every field is optional; unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub(crate) struct StatusMsg {
    #[serde(default, deserialize_with = "lenient_int")]
    pub(crate) sensor_value: Option<i64>,
    #[serde(default)]
    pub(crate) pump_status: Option<String>,
    #[serde(default)]
    pub(crate) feeder_status: Option<String>,
}

/// Accept `123`, `123.7` (truncated) or `"123"`.
fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("sensor_value out of range: {n}"))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("sensor_value is not an integer: '{s}'"))),
        Some(other) => Err(de::Error::custom(format!(
            "sensor_value has unsupported type: {other}"
        ))),
    }
}

/// What the channel adapter tells the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Connected,
    ConnectFailed,
    Disconnected,
    Status {
        update: StatusUpdate,
        at: OffsetDateTime,
    },
    Malformed {
        at: OffsetDateTime,
    },
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Parse a status payload into the fields it carries.
pub(crate) fn parse_status(payload: &[u8]) -> Result<StatusUpdate, serde_json::Error> {
    let msg: StatusMsg = serde_json::from_slice(payload)?;
    Ok(StatusUpdate {
        sensor_value: msg.sensor_value,
        pump_status: msg.pump_status.as_deref().map(PumpStatus::from_wire),
        feeder_status: msg.feeder_status.as_deref().map(FeederStatus::from_wire),
    })
}

/// Turn a raw status payload received at `at` into an event. Malformed
/// payloads are logged and reported as such, never as errors.
pub(crate) fn classify(payload: &[u8], at: OffsetDateTime) -> TelemetryEvent {
    match parse_status(payload) {
        Ok(update) => TelemetryEvent::Status { update, at },
        Err(e) => {
            warn!(
                payload = %String::from_utf8_lossy(payload),
                "discarding malformed status payload: {e}"
            );
            TelemetryEvent::Malformed { at }
        }
    }
}

// ---------------------------------------------------------------------------
// Channel loop
// ---------------------------------------------------------------------------

/// Drive the MQTT event loop forever, forwarding connectivity changes and
/// status messages to the controller. Returns once the controller is gone.
pub async fn run(
    client: AsyncClient,
    mut eventloop: EventLoop,
    status_topic: String,
    tx: mpsc::Sender<TelemetryEvent>,
) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    // Subscriptions do not survive a clean-session reconnect.
                    if let Err(e) = client.try_subscribe(status_topic.as_str(), QoS::AtLeastOnce) {
                        error!(topic = %status_topic, "failed to subscribe: {e}");
                    }
                    info!(topic = %status_topic, "mqtt connected, subscribed to status topic");
                    Some(TelemetryEvent::Connected)
                } else {
                    warn!(code = ?ack.code, "mqtt connection refused");
                    Some(TelemetryEvent::ConnectFailed)
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if p.topic == status_topic {
                    Some(classify(&p.payload, OffsetDateTime::now_utc()))
                } else {
                    debug!(topic = %p.topic, "ignoring publish on unexpected topic");
                    None
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected by broker");
                Some(TelemetryEvent::Disconnected)
            }
            Ok(_) => None,
            Err(e) => {
                let event = if matches!(e, ConnectionError::ConnectionRefused(_)) {
                    warn!("mqtt connection refused: {e}");
                    TelemetryEvent::ConnectFailed
                } else {
                    warn!("mqtt error: {e}. reconnecting...");
                    TelemetryEvent::Disconnected
                };
                if tx.send(event).await.is_err() {
                    break;
                }
                sleep(RECONNECT_DELAY).await;
                None
            }
        };

        if let Some(event) = event {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    }
    info!("controller gone, telemetry loop exiting");
}

// ===========================================================================
// Tests
// ===========================================================================
