//Command line interface
// runtime configuration (node id, transport, TDMA timing, retry policy)
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use rf_protocol::NodeId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Simulator,
    Physical,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Simulator => "simulator",
            TransportKind::Physical => "physical",
        }
    }
}

/// Calibration RSSI of one link, subtracted from buffered measurements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationEntry {
    pub from: NodeId,
    pub to: NodeId,
    pub rssi: f64,
}

/// Node settings. Loaded from the flat JSON settings file, `RF_*` environment
/// variables and command line overrides, in increasing precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub rf_sensor_id: NodeId,
    #[serde(default = "defaults::number_of_sensors")]
    pub number_of_sensors: u8,
    #[serde(default = "defaults::slot_duration")]
    pub slot_duration: f64,
    #[serde(default = "defaults::loop_delay")]
    pub loop_delay: f64,
    #[serde(default = "defaults::custom_packet_limit")]
    pub custom_packet_limit: usize,
    #[serde(default = "defaults::transport")]
    pub transport: TransportKind,
    /// Index is the node id: socket addresses for the simulator, 64-bit hex addresses for XBee radios.
    #[serde(default = "defaults::peers")]
    pub peers: Vec<String>,
    #[serde(default = "defaults::serial_port")]
    pub serial_port: String,
    #[serde(default = "defaults::baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "defaults::settings_max_retries")]
    pub settings_max_retries: u32,
    #[serde(default = "defaults::settings_retry_interval")]
    pub settings_retry_interval: f64,
    #[serde(default)]
    pub packet_log: Option<PathBuf>,
    /// Reported `(latitude, longitude)` of a node without a position source.
    #[serde(default)]
    pub home_location: [f64; 2],
    #[serde(default)]
    pub buffer_origin: [f64; 2],
    #[serde(default = "defaults::buffer_size")]
    pub buffer_size: [f64; 2],
    #[serde(default)]
    pub calibration: Vec<CalibrationEntry>,
}

mod defaults {
    use super::TransportKind;

    pub fn number_of_sensors() -> u8 { 2 }
    pub fn slot_duration() -> f64 { 0.1 }
    pub fn loop_delay() -> f64 { 0.01 }
    pub fn custom_packet_limit() -> usize { 5 }
    pub fn transport() -> TransportKind { TransportKind::Simulator }
    pub fn peers() -> Vec<String> {
        (0..=2).map(|id| format!("127.0.0.1:{}", 7900 + id)).collect()
    }
    pub fn serial_port() -> String { "/dev/ttyUSB0".into() }
    pub fn baud_rate() -> u32 { 57_600 }
    pub fn settings_max_retries() -> u32 { 5 }
    pub fn settings_retry_interval() -> f64 { 1.0 }
    pub fn buffer_size() -> [f64; 2] { [10.0, 10.0] }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rf_sensor_id: 0,
            number_of_sensors: defaults::number_of_sensors(),
            slot_duration: defaults::slot_duration(),
            loop_delay: defaults::loop_delay(),
            custom_packet_limit: defaults::custom_packet_limit(),
            transport: defaults::transport(),
            peers: defaults::peers(),
            serial_port: defaults::serial_port(),
            baud_rate: defaults::baud_rate(),
            settings_max_retries: defaults::settings_max_retries(),
            settings_retry_interval: defaults::settings_retry_interval(),
            packet_log: None,
            home_location: [0.0, 0.0],
            buffer_origin: [0.0, 0.0],
            buffer_size: defaults::buffer_size(),
            calibration: Vec::new(),
        }
    }
}

impl Settings {
    /// Ground station plus vehicles.
    pub fn node_count(&self) -> u8 {
        self.number_of_sensors.saturating_add(1)
    }

    pub fn loop_delay(&self) -> Duration {
        Duration::from_secs_f64(self.loop_delay)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs_f64(self.settings_retry_interval)
    }

    /// Every accepted settings key with its default value.
    pub fn defaults_map() -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(Settings::default()) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.number_of_sensors == 0 {
            bail!("number_of_sensors must be at least 1");
        }
        if self.rf_sensor_id > self.number_of_sensors {
            bail!(
                "rf_sensor_id {} is outside the network of {} vehicles",
                self.rf_sensor_id,
                self.number_of_sensors
            );
        }
        if !(self.slot_duration > 0.0) {
            bail!("slot_duration must be positive");
        }
        if !(self.loop_delay > 0.0) || !(self.settings_retry_interval > 0.0) {
            bail!("loop_delay and settings_retry_interval must be positive");
        }
        if self.peers.len() < usize::from(self.node_count()) {
            bail!(
                "peers lists {} addresses, need one per node ({})",
                self.peers.len(),
                self.node_count()
            );
        }
        Ok(())
    }
}

/// Overrides applied on top of the settings file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub id: Option<NodeId>,
    pub transport: Option<TransportKind>,
}

pub fn load_settings(path: &Path, overrides: &Overrides) -> Result<Settings> {
    let settings = config::Config::builder()
        .add_source(
            config::File::from(path)
                .format(config::FileFormat::Json)
                .required(false),
        )
        .add_source(config::Environment::with_prefix("RF").try_parsing(true))
        .set_override_option("rf_sensor_id", overrides.id.map(i64::from))?
        .set_override_option("transport", overrides.transport.map(|t| t.as_str()))?
        .build()
        .with_context(|| format!("reading settings from {}", path.display()))?
        .try_deserialize::<Settings>()?;
    settings.validate()?;
    Ok(settings)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub settings_file: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub measure: bool,
    pub settings: Settings,
}

#[derive(Parser, Debug, Clone)]
pub struct Cli {
    #[arg(long, default_value = "settings.json")] pub settings: PathBuf,
    #[arg(long)]                                  pub id: Option<NodeId>,
    #[arg(long, value_enum)]                      pub transport: Option<TransportKind>,
    /// Also write logs to daily rotated files in this directory
    #[arg(long)]                                  pub log_dir: Option<PathBuf>,
    /// Start RSSI measurements right after activation
    #[arg(long, default_value_t = false)]         pub measure: bool,
}

impl Cli {
    pub fn parse_and_build_config() -> Result<Config> {
        let c = <Cli as Parser>::parse();
        let overrides = Overrides { id: c.id, transport: c.transport };
        Ok(Config {
            settings: load_settings(&c.settings, &overrides)?,
            settings_file: c.settings,
            log_dir: c.log_dir,
            measure: c.measure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_uses_defaults_and_overrides() {
        let path = std::env::temp_dir().join("rf_sensor_missing_settings.json");
        let _ = std::fs::remove_file(&path);
        let s = load_settings(
            &path,
            &Overrides { id: Some(2), transport: Some(TransportKind::Simulator) },
        )
        .unwrap();
        assert_eq!(s.rf_sensor_id, 2);
        assert_eq!(s.number_of_sensors, 2);
        assert_eq!(s.node_count(), 3);
        assert_eq!(s.peers.len(), 3);
    }

    #[test]
    fn file_values_are_read() {
        let path = std::env::temp_dir().join(format!("rf_sensor_settings_{}.json", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"number_of_sensors": 3, "slot_duration": 0.5, "peers": ["a","b","c","d"],
                "calibration": [{{"from": 1, "to": 2, "rssi": -36.0}}], "unrelated": true}}"#
        )
        .unwrap();
        drop(f);

        let s = load_settings(&path, &Overrides::default()).unwrap();
        assert_eq!(s.number_of_sensors, 3);
        assert_eq!(s.slot_duration, 0.5);
        assert_eq!(s.calibration, vec![CalibrationEntry { from: 1, to: 2, rssi: -36.0 }]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn defaults_map_names_every_key() {
        let map = Settings::defaults_map();
        assert_eq!(map["transport"], serde_json::json!("simulator"));
        assert_eq!(map["packet_log"], serde_json::Value::Null);
        assert_eq!(map["slot_duration"], serde_json::json!(0.1));
    }

    #[test]
    fn rejects_id_outside_network() {
        let s = Settings { rf_sensor_id: 9, ..Settings::default() };
        assert!(s.validate().is_err());
    }
}
