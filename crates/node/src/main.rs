mod sim;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::TankSim;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Hand a command to the sim loop without waiting; the event loop must keep
/// polling or the sim loop's own publish never completes. Returns `false`
/// once the sim loop is gone.
fn forward_command(tx: &mpsc::Sender<String>, command: String) -> bool {
    match tx.try_send(command) {
        Ok(()) => true,
        Err(TrySendError::Full(command)) => {
            warn!(%command, "command queue full, dropping command");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

async fn publish_status(client: &AsyncClient, topic: &str, sim: &TankSim) -> Result<()> {
    let msg = sim.status();
    let payload = serde_json::to_vec(&msg).context("failed to encode status")?;
    client
        .publish(topic, QoS::AtLeastOnce, false, payload)
        .await
        .with_context(|| format!("failed to publish to {topic}"))?;
    debug!(
        sensor = msg.sensor_value,
        pump = msg.pump_status,
        feeder = msg.feeder_status,
        "status published"
    );
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let broker = env_or("MQTT_HOST", "127.0.0.1");
    let port: u16 = env_parse("MQTT_PORT", 1883);
    let status_topic = env_or("STATUS_TOPIC", "aquarium/tank/status");
    let command_topic = env_or("COMMAND_TOPIC", "aquarium/tank/command");
    let sample_every_s: u64 = env_parse("SAMPLE_EVERY_S", 5).max(1);
    let baseline: f64 = env_parse("TDS_BASELINE", 180.0);

    let mut mqttoptions = MqttOptions::new("aquarium-node", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(10));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // Commands arrive on the event loop task and are applied here.
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<String>(16);
    let sub_client = client.clone();
    let sub_topic = command_topic.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(topic = %sub_topic, "node connected to mqtt");
                    if let Err(e) = sub_client.try_subscribe(sub_topic.as_str(), QoS::AtLeastOnce) {
                        warn!("failed to subscribe: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == sub_topic => {
                    let body = String::from_utf8_lossy(&p.payload).into_owned();
                    if !forward_command(&cmd_tx, body) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let mut sim = TankSim::new(baseline);
    let mut ticker = interval(Duration::from_secs(sample_every_s));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(topic = %status_topic, sample_every_s, "publishing tank status");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sim.step();
            }
            Some(command) = cmd_rx.recv() => {
                if sim.apply_command(&command) {
                    info!(%command, "command applied");
                } else {
                    warn!(%command, "ignoring unknown command");
                    continue;
                }
            }
            else => break,
        }

        if let Err(e) = publish_status(&client, &status_topic, &sim).await {
            warn!("{e:#}");
        }
    }

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
