// src/main.rs
use anyhow::{Context, Result};
use rf_protocol::GROUND_STATION_ID;
use rf_sensor::commands::{SettingsReceiver, SettingsStore, spawn_settings_receiver};
use rf_sensor::config::{Cli, Settings};
use rf_sensor::logging::{init_tracing, packets::PacketLog};
use rf_sensor::sensor::{FixedLocation, launch};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // -------- config + logging ----------
    let cfg = Cli::parse_and_build_config()?;
    let _log_guard = init_tracing(
        "rf_sensor",
        &["rf_sensor=info", "rf_protocol=info", "tokio=warn"],
        cfg.log_dir.as_deref(),
    );
    let settings = &cfg.settings;
    info!(
        id = settings.rf_sensor_id,
        vehicles = settings.number_of_sensors,
        transport = settings.transport.as_str(),
        slot = settings.slot_duration,
        "RF sensor starting"
    );

    let packet_log = match &settings.packet_log {
        Some(path) => Some(Arc::new(
            PacketLog::open(path)
                .await
                .with_context(|| format!("opening packet log {}", path.display()))?,
        )),
        None => None,
    };

    // -------- node ----------
    // A ground station run from here has no buffer consumer, so measurements
    // go to the receive callback and are only logged.
    let callbacks = Box::new(FixedLocation::from_settings(settings));
    let (node, task) = launch(settings, callbacks, None, packet_log)?;

    // -------- settings protocol ----------
    let receiver = if settings.rf_sensor_id != GROUND_STATION_ID {
        let store = SettingsStore::new(&cfg.settings_file, Settings::defaults_map());
        let receiver = SettingsReceiver::new(settings.rf_sensor_id, store);
        Some(spawn_settings_receiver(node.clone(), receiver).await?)
    } else {
        None
    };

    if cfg.measure {
        node.start().await?;
        info!("measurements started");
    }

    // -------- graceful shutdown ----------
    let shutdown = node.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(?e, "failed to install Ctrl+C handler");
            return;
        }
        info!("shutdown signal received");
        shutdown.deactivate();
    });
    info!("node running. Press Ctrl+C to stop");

    let outcome = task.await.context("node task panicked")?;
    if let Some(receiver) = receiver {
        let _ = receiver.await;
    }
    outcome?;
    info!("node stopped");
    Ok(())
}
