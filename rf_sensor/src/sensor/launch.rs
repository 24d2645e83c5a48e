// Builds the configured transport and puts a node on its own task
use super::handle::{NodeHandle, spawn};
use super::node::{NodeCallbacks, SensorNode};
use crate::config::{Settings, TransportKind};
use crate::errors::{NodeError, TransportError};
use crate::logging::packets::PacketLog;
use crate::net::{Transport, UdpTransport, XBeeTransport};
use crate::scheduler::SystemClock;
use crate::telemetry::Buffer;
use rf_protocol::Packet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Callbacks for a node without a position source: it always reports the
/// `home_location` setting and logs unclaimed packets.
#[derive(Debug, Clone)]
pub struct FixedLocation {
    location: (f64, f64),
    valid: bool,
}

impl FixedLocation {
    pub fn new(location: (f64, f64)) -> Self {
        Self { location, valid: true }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new((settings.home_location[0], settings.home_location[1]))
    }

    pub fn invalid(mut self) -> Self {
        self.valid = false;
        self
    }
}

impl NodeCallbacks for FixedLocation {
    fn location(&self) -> (f64, f64) {
        self.location
    }

    fn receive(&mut self, packet: Packet) {
        info!(specification = ?packet.specification().map(|s| s.to_string()), contents = ?packet.get_all(), "packet received");
    }

    fn location_valid(&self, other_valid: Option<bool>) -> bool {
        self.valid && other_valid.unwrap_or(true)
    }
}

pub type NodeTask = JoinHandle<Result<(), NodeError>>;

/// Spawns the node described by `settings` over its configured transport.
pub fn launch(
    settings: &Settings,
    callbacks: Box<dyn NodeCallbacks>,
    buffer: Option<Buffer>,
    packet_log: Option<Arc<PacketLog>>,
) -> Result<(NodeHandle, NodeTask), TransportError> {
    info!(id = settings.rf_sensor_id, transport = settings.transport.as_str(), "launching node");
    Ok(match settings.transport {
        TransportKind::Simulator => spawn_with(
            settings,
            UdpTransport::from_settings(settings)?,
            callbacks,
            buffer,
            packet_log,
        ),
        TransportKind::Physical => spawn_with(
            settings,
            XBeeTransport::from_settings(settings)?,
            callbacks,
            buffer,
            packet_log,
        ),
    })
}

fn spawn_with<T: Transport + 'static>(
    settings: &Settings,
    transport: T,
    callbacks: Box<dyn NodeCallbacks>,
    buffer: Option<Buffer>,
    packet_log: Option<Arc<PacketLog>>,
) -> (NodeHandle, NodeTask) {
    let mut node = SensorNode::new(settings, transport, callbacks, Arc::new(SystemClock));
    if let Some(buffer) = buffer {
        node.set_buffer(buffer);
    }
    if let Some(log) = packet_log {
        node = node.with_packet_log(log);
    }
    spawn(node, settings.loop_delay())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    #[test]
    fn validity_combines_both_ends() {
        let cb = FixedLocation::new((52.0, 4.5));
        assert_eq!(cb.location(), (52.0, 4.5));
        assert!(cb.location_valid(None));
        assert!(!cb.location_valid(Some(false)));
        assert!(!cb.clone().invalid().location_valid(Some(true)));
    }

    #[tokio::test]
    async fn simulator_node_launches_and_stops() {
        let peers: Vec<String> = (0..3)
            .map(|_| {
                let s = UdpSocket::bind("127.0.0.1:0").unwrap();
                s.local_addr().unwrap().to_string()
            })
            .collect();
        let settings = Settings { rf_sensor_id: 1, peers, ..Settings::default() };
        let buffer = Buffer::from_settings(&settings);

        let (handle, task) = launch(
            &settings,
            Box::new(FixedLocation::from_settings(&settings)),
            Some(buffer),
            None,
        )
        .unwrap();
        assert_eq!(handle.id(), 1);
        assert!(handle.buffer().is_some());
        let identity = handle.identity().await.unwrap();
        assert!(identity.joined);

        handle.deactivate();
        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    fn bad_peer_table_fails_before_spawning() {
        let settings = Settings { peers: vec!["not an address".into(); 3], ..Settings::default() };
        assert!(launch(&settings, Box::new(FixedLocation::new((0.0, 0.0))), None, None).is_err());
    }
}
