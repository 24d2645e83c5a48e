use crate::config::Settings;
use crate::errors::BufferError;
use parking_lot::Mutex;
use rf_protocol::{NodeId, Packet};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// One buffered packet. Measurements also carry their calibrated RSSI.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferEntry {
    pub packet: Packet,
    pub calibrated_rssi: Option<f64>,
}

#[derive(Debug)]
struct Meta {
    origin: (f64, f64),
    size: (f64, f64),
    number_of_sensors: u8,
    // (from_id, sensor_id) -> rssi measured on that link at calibration time
    calibration: HashMap<(NodeId, NodeId), f64>,
}

/// Unbounded FIFO between the ground station node and the reconstruction consumer.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone, Debug)]
pub struct Buffer {
    queue: Arc<Mutex<VecDeque<BufferEntry>>>,
    meta: Arc<Meta>,
}

impl Buffer {
    pub fn new(origin: (f64, f64), size: (f64, f64), number_of_sensors: u8) -> Self {
        Self::with_calibration(origin, size, number_of_sensors, HashMap::new())
    }

    pub fn with_calibration(
        origin: (f64, f64),
        size: (f64, f64),
        number_of_sensors: u8,
        calibration: HashMap<(NodeId, NodeId), f64>,
    ) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            meta: Arc::new(Meta { origin, size, number_of_sensors, calibration }),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let calibration = settings
            .calibration
            .iter()
            .map(|c| ((c.from, c.to), c.rssi))
            .collect();
        Self::with_calibration(
            (settings.buffer_origin[0], settings.buffer_origin[1]),
            (settings.buffer_size[0], settings.buffer_size[1]),
            settings.number_of_sensors,
            calibration,
        )
    }

    pub fn origin(&self) -> (f64, f64) {
        self.meta.origin
    }

    pub fn size(&self) -> (f64, f64) {
        self.meta.size
    }

    pub fn number_of_sensors(&self) -> u8 {
        self.meta.number_of_sensors
    }

    /// Appends `packet`. Private packets and malformed measurements are refused.
    pub fn put(&self, packet: Packet) -> Result<(), BufferError> {
        let calibrated_rssi = match packet.specification() {
            Some(spec) if spec.is_private() => {
                return Err(BufferError::PrivateSpecification(spec.as_str().to_string()));
            }
            Some(spec) if spec.is_measurement() => Some(self.calibrate(&packet)?),
            _ => None,
        };
        trace!(calibrated_rssi, "buffering packet");
        self.queue.lock().push_back(BufferEntry { packet, calibrated_rssi });
        Ok(())
    }

    /// Oldest entry, or `None` when empty.
    pub fn get(&self) -> Option<BufferEntry> {
        self.queue.lock().pop_front()
    }

    pub fn count(&self) -> usize {
        self.queue.lock().len()
    }

    fn calibrate(&self, packet: &Packet) -> Result<f64, BufferError> {
        // every field of a link measurement must be present and typed
        let sensor_id = packet.get_node_id("sensor_id")?;
        let from_id = packet.get_node_id("from_id")?;
        for key in ["from_latitude", "from_longitude", "to_latitude", "to_longitude"] {
            packet.get_f64(key)?;
        }
        packet.get_bool("from_valid")?;
        packet.get_bool("to_valid")?;
        let rssi = packet.get_f64("rssi")?;

        let offset = self.meta.calibration.get(&(from_id, sensor_id)).copied().unwrap_or(0.0);
        Ok(rssi - offset)
    }
}
