mod clock;
mod config;
mod controller;
mod emitter;
mod schedule;
mod scheduler;
mod state;
mod store;
mod telemetry;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use controller::{Controller, ControllerHandle};
use emitter::MqttEmitter;
use scheduler::Scheduler;
use store::ScheduleStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let offset = cfg.scheduler.offset()?;

    // ── Schedule state ──────────────────────────────────────────────
    let store = ScheduleStore::new(&cfg.storage.state_path);
    let scheduler = Scheduler::new(store, cfg.scheduler.grace_window());
    info!(
        path = %cfg.storage.state_path.display(),
        enabled = scheduler.config().auto_feed_enabled,
        slots = %scheduler::join_slots(&scheduler.config().feed_times),
        "schedule loaded"
    );

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(
        cfg.mqtt.client_id.as_str(),
        cfg.mqtt.broker_host.as_str(),
        cfg.mqtt.broker_port,
    );
    mqttoptions.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_secs));

    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);
    let emitter = MqttEmitter::new(client.clone(), cfg.mqtt.command_topic.as_str());

    // ── Controller ──────────────────────────────────────────────────
    let (tele_tx, tele_rx) = mpsc::channel(256);
    let (req_tx, req_rx) = mpsc::channel(32);

    let (controller, snapshots) = Controller::new(
        scheduler,
        emitter,
        offset,
        cfg.scheduler.offline_timeout(),
    );
    let handle = ControllerHandle::new(req_tx, snapshots);

    tokio::spawn(telemetry::run(
        client,
        eventloop,
        cfg.mqtt.status_topic.clone(),
        tele_tx,
    ));

    // ── Web server ──────────────────────────────────────────────────
    let web_port = cfg.web.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(handle, web_port).await {
            error!("{e:#}");
        }
    });

    info!(
        broker = %cfg.mqtt.broker_host,
        port = cfg.mqtt.broker_port,
        status_topic = %cfg.mqtt.status_topic,
        command_topic = %cfg.mqtt.command_topic,
        "hub started"
    );

    tokio::select! {
        _ = controller.run(cfg.scheduler.tick_interval(), tele_rx, req_rx) => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("shutting down");
        }
    }

    Ok(())
}
