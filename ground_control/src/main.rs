// Ground station operator: runs node 0 to collect measurements or push settings
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rf_protocol::{GROUND_STATION_ID, NodeId, Value};
use rf_sensor::commands::{
    LocalEffect, Session, SessionConfig, SettingsStore, route_acks, run_session,
};
use rf_sensor::config::{Overrides, Settings, TransportKind, load_settings};
use rf_sensor::logging::{init_tracing, packets::PacketLog};
use rf_sensor::sensor::{FixedLocation, NodeHandle, NodeTask, launch};
use rf_sensor::telemetry::Buffer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(about = "RF sensor ground station")]
struct Args {
    #[arg(long, default_value = "settings.json")]
    settings: PathBuf,
    #[arg(long, value_enum)]
    transport: Option<TransportKind>,
    /// Also write logs to daily rotated files in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the ground station and log buffered link measurements
    Listen {
        /// Seconds between buffer drains
        #[arg(long, default_value_t = 0.5)]
        drain_interval: f64,
    },
    /// Reliably send the settings in FILE to vehicles
    PushSettings {
        /// Flat JSON object of setting -> value
        #[arg(long)]
        file: PathBuf,
        /// Target vehicles; every vehicle when omitted
        #[arg(long, value_delimiter = ',')]
        vehicles: Vec<NodeId>,
        /// Also merge the settings into our own settings file
        #[arg(long, default_value_t = false)]
        ground: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(
        "ground_control",
        &["ground_control=info", "rf_sensor=info", "rf_protocol=info", "tokio=warn"],
        args.log_dir.as_deref(),
    );

    let overrides = Overrides { id: Some(GROUND_STATION_ID), transport: args.transport };
    let settings = load_settings(&args.settings, &overrides)?;
    info!(
        vehicles = settings.number_of_sensors,
        transport = settings.transport.as_str(),
        "ground control starting"
    );
    let packet_log = match &settings.packet_log {
        Some(path) => Some(Arc::new(
            PacketLog::open(path)
                .await
                .with_context(|| format!("opening packet log {}", path.display()))?,
        )),
        None => None,
    };

    match args.command {
        Command::Listen { drain_interval } => listen(&settings, packet_log, drain_interval).await,
        Command::PushSettings { file, vehicles, ground } => {
            let items = read_items(&file)?;
            let targets = select_targets(&settings, &vehicles)?;
            let store = ground.then(|| SettingsStore::new(&args.settings, Settings::defaults_map()));
            push_settings(&settings, packet_log, items, targets, store).await
        }
    }
}

async fn listen(settings: &Settings, packet_log: Option<Arc<PacketLog>>, drain_interval: f64) -> Result<()> {
    let buffer = Buffer::from_settings(settings);
    let callbacks = Box::new(FixedLocation::from_settings(settings));
    let (node, mut task) = launch(settings, callbacks, Some(buffer.clone()), packet_log)?;
    info!(
        origin = ?buffer.origin(),
        size = ?buffer.size(),
        "listening for measurements. Press Ctrl+C to stop"
    );

    let mut ticker = interval(Duration::from_secs_f64(drain_interval.max(0.01)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut drained = 0usize;
    loop {
        tokio::select! {
            _ = ticker.tick() => drained += drain(&buffer),
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(?e, "failed to install Ctrl+C handler");
                }
                info!("shutdown signal received");
                node.deactivate();
                break;
            }
            finished = &mut task => {
                finished.context("node task panicked")??;
                bail!("ground station node stopped unexpectedly");
            }
        }
    }
    task.await.context("node task panicked")??;
    drained += drain(&buffer);
    info!(drained, "ground control stopped");
    Ok(())
}

/// Logs and removes everything currently buffered.
fn drain(buffer: &Buffer) -> usize {
    let mut n = 0;
    while let Some(entry) = buffer.get() {
        n += 1;
        let packet = &entry.packet;
        match (packet.get_node_id("from_id"), packet.get_node_id("sensor_id")) {
            (Ok(from), Ok(to)) => info!(
                from,
                to,
                rssi = packet.get_f64("rssi").ok(),
                calibrated = entry.calibrated_rssi,
                valid = packet.get_bool("from_valid").unwrap_or(false)
                    && packet.get_bool("to_valid").unwrap_or(false),
                "link measurement"
            ),
            _ => info!(contents = ?packet.get_all(), "buffered packet"),
        }
    }
    n
}

async fn push_settings(
    settings: &Settings,
    packet_log: Option<Arc<PacketLog>>,
    items: Vec<(String, Value)>,
    targets: Vec<NodeId>,
    mut store: Option<SettingsStore>,
) -> Result<()> {
    let callbacks = Box::new(FixedLocation::from_settings(settings));
    let (node, task) = launch(settings, callbacks, None, packet_log)?;
    let mut acks = route_acks(&node).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            on_signal.cancel();
        }
    });

    let session = Session::new(items, targets, SessionConfig::from_settings(settings), Instant::now());
    info!(session = %session.id(), items = session.items().len(), "pushing settings");
    let local = store.as_mut().map(|s| s as &mut dyn LocalEffect);
    let outcome = run_session(session, &node, &mut acks, &cancel, local).await;

    shut_down(node, task).await;
    let report = outcome?;
    for id in &report.succeeded {
        info!(vehicle = id, "settings applied");
    }
    for (id, failure) in &report.failed {
        warn!(vehicle = id, ?failure, "settings not applied");
    }
    if let Some(e) = &report.local_error {
        warn!(error = %e, "local settings not written");
    }
    if !report.is_success() {
        let total = report.failed.len() + report.succeeded.len();
        bail!("settings push incomplete: {} of {total} targets failed", report.failed.len());
    }
    Ok(())
}

async fn shut_down(node: NodeHandle, task: NodeTask) {
    node.deactivate();
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "node stopped with error"),
        Err(e) => warn!(error = %e, "node task panicked"),
    }
}

/// Items of a flat JSON settings file, in file order.
fn read_items(path: &Path) -> Result<Vec<(String, Value)>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    match serde_json::from_str::<Value>(&text).with_context(|| format!("parsing {}", path.display()))? {
        Value::Object(map) if !map.is_empty() => Ok(map.into_iter().collect()),
        Value::Object(_) => bail!("{} holds no settings", path.display()),
        _ => bail!("{} is not a JSON object", path.display()),
    }
}

fn select_targets(settings: &Settings, requested: &[NodeId]) -> Result<Vec<NodeId>> {
    if requested.is_empty() {
        return Ok((1..=settings.number_of_sensors).collect());
    }
    let mut targets = requested.to_vec();
    targets.sort_unstable();
    targets.dedup();
    if let Some(bad) = targets
        .iter()
        .find(|id| **id == GROUND_STATION_ID || **id > settings.number_of_sensors)
    {
        bail!("{bad} is not a vehicle id (1..={})", settings.number_of_sensors);
    }
    Ok(targets)
}
