use super::measurement::{Beacon, Position, broadcast_packet, ground_station_packet};
use crate::config::Settings;
use crate::errors::{NodeError, TransportError};
use crate::logging::packets::{Direction, PacketLog};
use crate::net::{Inbound, NodeIdentity, Transport};
use crate::scheduler::{Clock, TdmaScheduler, timing::lateness_ms};
use crate::telemetry::Buffer;
use rf_protocol::{GROUND_STATION_ID, KEY_SPECIFICATION, NodeId, Packet, PacketError, Specification};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Handler for packets of one registered specification.
pub type PacketAction = Box<dyn FnMut(Packet) + Send>;

/// Hooks into the vehicle (or ground station) the node runs on.
pub trait NodeCallbacks: Send {
    /// Current `(latitude, longitude)`.
    fn location(&self) -> (f64, f64);

    /// Packets with no registered action and no buffer to go to.
    fn receive(&mut self, packet: Packet);

    /// Whether our location is usable for a measurement. `other_valid` is the
    /// peer's validity when answering a beacon.
    fn location_valid(&self, other_valid: Option<bool>) -> bool;
}

/// A radio node: owns its scheduler and transport and runs one TDMA slot per cycle.
pub struct SensorNode<T: Transport> {
    id: NodeId,
    number_of_sensors: u8,
    custom_packet_limit: usize,
    scheduler: TdmaScheduler,
    transport: T,
    clock: Arc<dyn Clock>,
    callbacks: Box<dyn NodeCallbacks>,
    actions: HashMap<String, PacketAction>,
    buffer: Option<Buffer>,
    custom: VecDeque<(Packet, NodeId)>,
    // rssi_ground_station reports waiting for our next slot
    measurements: Vec<Packet>,
    measuring: bool,
    active: bool,
    packet_log: Option<Arc<PacketLog>>,
}

impl<T: Transport> SensorNode<T> {
    pub fn new(
        settings: &Settings,
        transport: T,
        callbacks: Box<dyn NodeCallbacks>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id: settings.rf_sensor_id,
            number_of_sensors: settings.number_of_sensors,
            custom_packet_limit: settings.custom_packet_limit,
            scheduler: TdmaScheduler::new(
                settings.rf_sensor_id,
                settings.node_count(),
                settings.slot_duration,
            ),
            transport,
            clock,
            callbacks,
            actions: HashMap::new(),
            buffer: None,
            custom: VecDeque::new(),
            measurements: Vec::new(),
            measuring: false,
            active: false,
            packet_log: None,
        }
    }

    pub fn with_packet_log(mut self, log: Arc<PacketLog>) -> Self {
        self.packet_log = Some(log);
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn number_of_sensors(&self) -> u8 {
        self.number_of_sensors
    }

    pub fn scheduler(&self) -> &TdmaScheduler {
        &self.scheduler
    }

    pub fn identity(&self) -> NodeIdentity {
        self.transport.identity()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_measuring(&self) -> bool {
        self.measuring
    }

    pub fn set_buffer(&mut self, buffer: Buffer) {
        self.buffer = Some(buffer);
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    /// Custom packets waiting for a slot.
    pub fn queued(&self) -> usize {
        self.custom.len()
    }

    pub async fn activate(&mut self) -> Result<(), NodeError> {
        if self.active {
            return Ok(());
        }
        self.transport.open().await?;
        self.active = true;
        info!(identity = %self.transport.identity(), "node activated");
        Ok(())
    }

    pub async fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.measuring = false;
        self.transport.close().await;
        info!(id = self.id, "node deactivated");
    }

    /// Starts RSSI measurements. The ground station never measures.
    pub fn start(&mut self) {
        if self.id == GROUND_STATION_ID {
            debug!("ground station ignores measurement start");
            return;
        }
        self.measuring = true;
    }

    pub fn stop(&mut self) {
        self.measuring = false;
    }

    pub fn add_packet_action(
        &mut self,
        specification: impl Into<Specification>,
        action: PacketAction,
    ) -> Result<(), NodeError> {
        let specification = specification.into();
        if specification.is_private() {
            return Err(NodeError::PrivatePacket);
        }
        let key = specification.as_str().to_string();
        if self.actions.contains_key(&key) {
            return Err(NodeError::DuplicateAction(key));
        }
        self.actions.insert(key, action);
        Ok(())
    }

    /// Queues an application packet for our next slots. Without `to` one copy
    /// goes to every vehicle except ourselves.
    pub fn enqueue(&mut self, packet: Packet, to: Option<NodeId>) -> Result<(), NodeError> {
        let specification = packet
            .specification()
            .ok_or_else(|| PacketError::Missing(KEY_SPECIFICATION.to_string()))?;
        if specification.is_private() {
            return Err(NodeError::PrivatePacket);
        }
        match to {
            Some(to) => self.custom.push_back((packet, to)),
            None => {
                for vehicle in self.other_vehicles() {
                    self.custom.push_back((packet.clone(), vehicle));
                }
            }
        }
        Ok(())
    }

    /// Vehicle ids other than our own.
    fn other_vehicles(&self) -> Vec<NodeId> {
        (1..=self.number_of_sensors).filter(|v| *v != self.id).collect()
    }

    /// Sends our traffic when our slot has come, then commits the next slot.
    pub async fn periodic_tick(&mut self) -> Result<(), NodeError> {
        if !self.active {
            return Ok(());
        }
        let now = self.clock.now();
        let slot_start = self.scheduler.committed();
        if now < slot_start {
            return Ok(());
        }

        if now - slot_start < self.scheduler.slot_duration() {
            trace!(id = self.id, late_ms = lateness_ms(slot_start, now), "slot start");
            self.send_slot(now).await?;
        } else {
            debug!(id = self.id, slot_start, now, "slot missed");
        }
        self.scheduler.advance(now);
        Ok(())
    }

    async fn send_slot(&mut self, timestamp: f64) -> Result<(), NodeError> {
        if self.id != GROUND_STATION_ID && self.measuring {
            let (latitude, longitude) = self.callbacks.location();
            let valid = self.callbacks.location_valid(None);
            let beacon = broadcast_packet(self.id, Position { latitude, longitude, valid })?;
            for vehicle in self.other_vehicles() {
                self.transmit(&beacon, vehicle, timestamp).await?;
            }
            for report in std::mem::take(&mut self.measurements) {
                self.transmit(&report, GROUND_STATION_ID, timestamp).await?;
            }
        }

        // custom packets go out whether or not measurements are running;
        // measuring adds the beacons and reports in front of them
        for _ in 0..self.custom_packet_limit {
            let Some((packet, to)) = self.custom.pop_front() else {
                break;
            };
            self.transmit(&packet, to, timestamp).await?;
        }
        Ok(())
    }

    async fn transmit(&mut self, packet: &Packet, to: NodeId, timestamp: f64) -> Result<(), NodeError> {
        match self.transport.send(packet, Some(to), timestamp).await {
            Ok(()) => {
                if let Some(log) = &self.packet_log {
                    log.record(Direction::Tx, packet, Some(to)).await;
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!(id = self.id, to, error = %e, "dropping outgoing packet");
                Ok(())
            }
        }
    }

    pub async fn next_inbound(&mut self) -> Result<Inbound, TransportError> {
        self.transport.recv().await
    }

    /// Handles one packet straight from the transport.
    pub async fn receive(&mut self, inbound: Inbound) -> Result<(), NodeError> {
        let Inbound { mut packet, rssi } = inbound;
        let Some(routing) = packet.routing() else {
            warn!(id = self.id, "dropping packet without routing metadata");
            return Ok(());
        };
        // every overheard packet times the schedule, addressed to us or not
        if routing.from != self.id {
            self.scheduler.synchronize(routing.timestamp, routing.from);
        }
        if let Some(to) = routing.to {
            if to != self.id && self.id != GROUND_STATION_ID {
                trace!(id = self.id, to, from = routing.from, "not addressed to us");
                return Ok(());
            }
        }
        packet.strip_reserved();
        if let Some(log) = &self.packet_log {
            log.record(Direction::Rx, &packet, Some(routing.from)).await;
        }

        let Some(specification) = packet.specification() else {
            warn!(id = self.id, from = routing.from, "dropping packet without specification");
            return Ok(());
        };
        if specification == Specification::RssiBroadcast {
            self.answer_beacon(&packet, rssi);
            return Ok(());
        }
        if let Some(action) = self.actions.get_mut(specification.as_str()) {
            action(packet);
            return Ok(());
        }
        if specification.is_measurement() {
            if let Some(buffer) = &self.buffer {
                if let Err(e) = buffer.put(packet) {
                    warn!(id = self.id, from = routing.from, error = %e, "measurement rejected by buffer");
                }
                return Ok(());
            }
        }
        self.callbacks.receive(packet);
        Ok(())
    }

    fn answer_beacon(&mut self, packet: &Packet, rssi: Option<f64>) {
        // reports only leave in a measuring slot
        if !self.measuring {
            return;
        }
        let beacon = match Beacon::from_packet(packet) {
            Ok(b) => b,
            Err(e) => {
                warn!(id = self.id, error = %e, "malformed beacon");
                return;
            }
        };
        let Some(rssi) = rssi else {
            debug!(id = self.id, from = beacon.sensor_id, "beacon without signal strength");
            return;
        };
        let (latitude, longitude) = self.callbacks.location();
        let valid = self.callbacks.location_valid(Some(beacon.position.valid));
        let to = Position { latitude, longitude, valid };
        match ground_station_packet(self.id, beacon.sensor_id, beacon.position, to, rssi) {
            Ok(report) => self.measurements.push(report),
            Err(e) => warn!(id = self.id, error = %e, "could not build measurement"),
        }
    }

    /// Reports collected and not yet sent.
    pub fn pending_measurements(&self) -> usize {
        self.measurements.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scheduler::timing::MockClock;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rf_protocol::Routing;
    use tokio::sync::mpsc;

    pub(crate) type Sent = Arc<Mutex<Vec<(Packet, Option<NodeId>, f64)>>>;

    /// In-memory transport: records sends, replays injected inbound packets.
    pub(crate) struct FakeTransport {
        pub id: NodeId,
        pub sent: Sent,
        pub inbound: mpsc::UnboundedReceiver<Inbound>,
        pub open: bool,
    }

    impl FakeTransport {
        pub fn new(id: NodeId) -> (Self, Sent, mpsc::UnboundedSender<Inbound>) {
            let sent: Sent = Arc::default();
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { id, sent: sent.clone(), inbound: rx, open: false }, sent, tx)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open(&mut self) -> Result<(), TransportError> {
            self.open = true;
            Ok(())
        }
        async fn close(&mut self) {
            self.open = false;
        }
        async fn send(&mut self, packet: &Packet, to: Option<NodeId>, ts: f64) -> Result<(), TransportError> {
            if !self.open {
                return Err(TransportError::Closed);
            }
            self.sent.lock().push((packet.clone(), to, ts));
            Ok(())
        }
        async fn recv(&mut self) -> Result<Inbound, TransportError> {
            self.inbound.recv().await.ok_or(TransportError::Closed)
        }
        fn identity(&self) -> NodeIdentity {
            NodeIdentity { id: self.id, address: vec![self.id], joined: self.open }
        }
        fn peer_ids(&self) -> Vec<NodeId> {
            (0..=3).collect()
        }
    }

    pub(crate) struct Recorder {
        pub received: Arc<Mutex<Vec<Packet>>>,
    }

    impl NodeCallbacks for Recorder {
        fn location(&self) -> (f64, f64) {
            (52.0, 4.5)
        }
        fn receive(&mut self, packet: Packet) {
            self.received.lock().push(packet);
        }
        fn location_valid(&self, _other_valid: Option<bool>) -> bool {
            true
        }
    }

    pub(crate) fn clock_at(time: Arc<Mutex<f64>>) -> Arc<dyn Clock> {
        let mut clock = MockClock::new();
        clock.expect_now().returning(move || *time.lock());
        Arc::new(clock)
    }

    pub(crate) fn settings(id: NodeId, number_of_sensors: u8) -> Settings {
        Settings {
            rf_sensor_id: id,
            number_of_sensors,
            slot_duration: 1.0,
            ..Settings::default()
        }
    }

    struct Harness {
        node: SensorNode<FakeTransport>,
        sent: Sent,
        received: Arc<Mutex<Vec<Packet>>>,
        time: Arc<Mutex<f64>>,
    }

    fn harness(id: NodeId, number_of_sensors: u8) -> Harness {
        let (transport, sent, _inbound) = FakeTransport::new(id);
        let received = Arc::new(Mutex::new(Vec::new()));
        let time = Arc::new(Mutex::new(0.0));
        let node = SensorNode::new(
            &settings(id, number_of_sensors),
            transport,
            Box::new(Recorder { received: received.clone() }),
            clock_at(time.clone()),
        );
        Harness { node, sent, received, time }
    }

    fn stamped(mut packet: Packet, from: NodeId, to: Option<NodeId>, timestamp: f64) -> Inbound {
        packet.stamp_routing(Routing { from, to, timestamp });
        Inbound { packet, rssi: Some(-48.0) }
    }

    fn specs(sent: &Sent) -> Vec<(String, Option<NodeId>)> {
        sent.lock()
            .iter()
            .map(|(p, to, _)| (p.specification().unwrap().to_string(), *to))
            .collect()
    }

    #[test]
    fn duplicate_action_is_rejected() {
        let mut h = harness(1, 2);
        h.node.add_packet_action("waypoint", Box::new(|_| {})).unwrap();
        assert!(matches!(
            h.node.add_packet_action("waypoint", Box::new(|_| {})),
            Err(NodeError::DuplicateAction(s)) if s == "waypoint"
        ));
    }

    #[test]
    fn enqueue_broadcast_expands_to_other_vehicles() {
        let mut h = harness(2, 3);
        h.node.enqueue(Packet::with_specification("memory_map_chunk"), None).unwrap();
        assert_eq!(h.node.queued(), 2);
        let to: Vec<_> = h.node.custom.iter().map(|(_, to)| *to).collect();
        assert_eq!(to, vec![1, 3]);
    }

    #[test]
    fn private_packets_cannot_be_enqueued() {
        let mut h = harness(1, 2);
        assert!(matches!(
            h.node.enqueue(Packet::with_specification(Specification::RssiBroadcast), Some(2)),
            Err(NodeError::PrivatePacket)
        ));
        assert!(matches!(
            h.node.enqueue(Packet::new(), Some(2)),
            Err(NodeError::Packet(PacketError::Missing(_)))
        ));
        assert_eq!(h.node.queued(), 0);
    }

    #[tokio::test]
    async fn unknown_specification_goes_to_receive_callback() {
        let mut h = harness(1, 2);
        h.node.activate().await.unwrap();
        let mut p = Packet::with_specification("unknown_thing");
        p.set("value", 7).unwrap();
        h.node.receive(stamped(p, 2, Some(1), 0.5)).await.unwrap();

        let received = h.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].get_i64("value").unwrap(), 7);
        assert!(!received[0].contains("_from_id"));
    }

    #[tokio::test]
    async fn misaddressed_unicast_is_dropped_but_still_synchronizes() {
        // 3 nodes, 1s slots; node 1 overhears node 2 talking to the ground station
        let mut h = harness(1, 2);
        h.node.activate().await.unwrap();
        h.node
            .receive(stamped(Packet::with_specification("x"), 2, Some(0), 50.0))
            .await
            .unwrap();
        assert!(h.received.lock().is_empty());
        assert!((h.node.scheduler().committed() - 52.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn ground_station_accepts_everything() {
        let mut h = harness(0, 2);
        h.node.activate().await.unwrap();
        h.node
            .receive(stamped(Packet::with_specification("x"), 2, Some(1), 5.0))
            .await
            .unwrap();
        assert_eq!(h.received.lock().len(), 1);
    }

    #[tokio::test]
    async fn registered_action_takes_precedence() {
        let mut h = harness(1, 2);
        h.node.activate().await.unwrap();
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        h.node
            .add_packet_action("setting_ack", Box::new(move |_| *counter.lock() += 1))
            .unwrap();
        h.node
            .receive(stamped(Packet::with_specification("setting_ack"), 0, Some(1), 0.1))
            .await
            .unwrap();
        assert_eq!(*seen.lock(), 1);
        assert!(h.received.lock().is_empty());
    }

    #[tokio::test]
    async fn measurements_go_to_the_buffer() {
        let mut h = harness(0, 2);
        let buffer = Buffer::new((0.0, 0.0), (10.0, 10.0), 2);
        h.node.set_buffer(buffer.clone());
        h.node.activate().await.unwrap();

        let position = Position { latitude: 1.0, longitude: 2.0, valid: true };
        let report = ground_station_packet(2, 1, position, position, -44.0).unwrap();
        h.node.receive(stamped(report, 2, Some(0), 3.0)).await.unwrap();
        assert_eq!(buffer.count(), 1);
        assert!(h.received.lock().is_empty());
    }

    #[tokio::test]
    async fn receive_synchronizes_schedule() {
        // 3 nodes, 1s slots; node 2 hears node 1 at 1.2s
        let mut h = harness(2, 2);
        h.node.activate().await.unwrap();
        assert_eq!(h.node.scheduler().next_timestamp(0.0), 2.0);
        h.node
            .receive(stamped(Packet::with_specification("x"), 1, None, 1.2))
            .await
            .unwrap();
        assert!((h.node.scheduler().committed() - 2.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn vehicle_slot_sends_beacons_reports_and_custom_packets() {
        let mut h = harness(1, 3);
        h.node.activate().await.unwrap();
        h.node.start();

        // a beacon from vehicle 2 turns into a report for the ground station
        let beacon = broadcast_packet(2, Position { latitude: 3.0, longitude: 4.0, valid: false }).unwrap();
        h.node.receive(stamped(beacon, 2, Some(1), 0.1)).await.unwrap();
        assert_eq!(h.node.pending_measurements(), 1);
        h.node.enqueue(Packet::with_specification("status"), Some(0)).unwrap();

        // node 1 sits three slots after node 2, which sent at 0.1
        *h.time.lock() = 3.15;
        h.node.periodic_tick().await.unwrap();

        assert_eq!(
            specs(&h.sent),
            vec![
                ("_rssi_broadcast".to_string(), Some(2)),
                ("_rssi_broadcast".to_string(), Some(3)),
                ("rssi_ground_station".to_string(), Some(0)),
                ("status".to_string(), Some(0)),
            ]
        );
        assert_eq!(h.node.pending_measurements(), 0);
        assert!((h.node.scheduler().committed() - 7.1).abs() < 1e-9);

        let report = &h.sent.lock()[2].0;
        assert_eq!(report.get_i64("sensor_id").unwrap(), 1);
        assert_eq!(report.get_i64("from_id").unwrap(), 2);
        assert_eq!(report.get_f64("rssi").unwrap(), -48.0);
    }

    #[tokio::test]
    async fn ground_station_never_broadcasts_measurements() {
        let mut h = harness(0, 2);
        h.node.activate().await.unwrap();
        h.node.start();
        assert!(!h.node.is_measuring());
        h.node.enqueue(Packet::with_specification("setting_clear"), None).unwrap();

        for step in 0..6 {
            *h.time.lock() = f64::from(step) * 3.0;
            h.node.periodic_tick().await.unwrap();
        }
        let sent = specs(&h.sent);
        assert_eq!(
            sent,
            vec![("setting_clear".to_string(), Some(1)), ("setting_clear".to_string(), Some(2))]
        );
    }

    #[tokio::test]
    async fn custom_packets_are_limited_per_slot() {
        let mut h = harness(1, 2);
        h.node.activate().await.unwrap();
        for _ in 0..7 {
            h.node.enqueue(Packet::with_specification("chunk"), Some(2)).unwrap();
        }
        *h.time.lock() = 1.0;
        h.node.periodic_tick().await.unwrap();
        assert_eq!(h.sent.lock().len(), 5);
        assert_eq!(h.node.queued(), 2);

        // not our slot yet
        *h.time.lock() = 2.5;
        h.node.periodic_tick().await.unwrap();
        assert_eq!(h.sent.lock().len(), 5);
    }

    #[tokio::test]
    async fn deactivate_is_idempotent() {
        let mut h = harness(1, 2);
        h.node.activate().await.unwrap();
        h.node.deactivate().await;
        h.node.deactivate().await;
        assert!(!h.node.is_active());
        assert!(!h.node.identity().joined);
        // ticks on an inactive node send nothing
        h.node.enqueue(Packet::with_specification("x"), Some(2)).unwrap();
        *h.time.lock() = 1.0;
        h.node.periodic_tick().await.unwrap();
        assert!(h.sent.lock().is_empty());
    }
}
