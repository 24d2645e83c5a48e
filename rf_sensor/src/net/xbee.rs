// Physical radio: XBee module on a serial port in API mode
use super::fragment::{self, Reassembler};
use super::framing::{Frame, XBeeCodec};
use super::{Inbound, NodeIdentity, Transport};
use crate::config::Settings;
use crate::errors::TransportError;
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use rf_protocol::{NodeId, Packet, Routing};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const FRAME_ID: u8 = 0x01;
const READ_TIMEOUT: Duration = Duration::from_millis(50);
/// A packet whose `DB` answer has not come back by then goes up without RSSI.
const RSSI_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_PENDING: usize = 16;

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// What the link task does after a frame came in.
#[derive(Debug, PartialEq)]
enum Step {
    Nothing,
    /// A packet is waiting for its signal strength; query `DB` with this frame id.
    RequestRssi(u8),
    Deliver(Inbound),
}

#[derive(Debug)]
struct Awaiting {
    query: u8,
    packet: Packet,
    since: Instant,
}

/// Frame-level state of the radio: own address halves, fragments being
/// reassembled and packets awaiting RSSI.
#[derive(Debug, Default)]
struct LinkState {
    serial_high: Option<[u8; 4]>,
    serial_low: Option<[u8; 4]>,
    reassembly: Reassembler,
    pending: VecDeque<Awaiting>,
    last_query: u8,
}

impl LinkState {
    fn address(&self) -> Option<u64> {
        let (high, low) = (self.serial_high?, self.serial_low?);
        Some(u64::from(u32::from_be_bytes(high)) << 32 | u64::from(u32::from_be_bytes(low)))
    }

    // frame id 0 asks the radio for no response
    fn next_query(&mut self) -> u8 {
        self.last_query = self.last_query.wrapping_add(1).max(1);
        self.last_query
    }

    fn handle(&mut self, frame: Frame, now: Instant) -> Step {
        match frame {
            Frame::Receive { source64, data, .. } => {
                let bytes = match self.reassembly.push(source64, &data) {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => return Step::Nothing,
                    Err(e) => {
                        warn!(source = format_args!("{source64:016x}"), error = %e, "dropping bad fragment");
                        return Step::Nothing;
                    }
                };
                match Packet::deserialize(&bytes) {
                    Ok(packet) => {
                        let query = self.next_query();
                        self.pending.push_back(Awaiting { query, packet, since: now });
                        Step::RequestRssi(query)
                    }
                    Err(e) => {
                        warn!(source = format_args!("{source64:016x}"), error = %e, "dropping malformed payload");
                        Step::Nothing
                    }
                }
            }
            Frame::AtResponse { frame_id, command, status, data } => match &command {
                b"DB" => match self.take(frame_id) {
                    Some(packet) => {
                        let rssi = (status == 0)
                            .then(|| data.first().map(|db| -f64::from(*db)))
                            .flatten();
                        Step::Deliver(Inbound { packet, rssi })
                    }
                    None => {
                        trace!(frame_id, "DB response for no pending packet");
                        Step::Nothing
                    }
                },
                b"SH" | b"SL" => {
                    let Ok(half) = <[u8; 4]>::try_from(data.as_slice()) else {
                        warn!(status, len = data.len(), "unexpected serial number response");
                        return Step::Nothing;
                    };
                    if command == *b"SH" {
                        self.serial_high = Some(half);
                    } else {
                        self.serial_low = Some(half);
                    }
                    if let Some(address) = self.address() {
                        info!(address = format_args!("{address:016x}"), "radio address resolved");
                    }
                    Step::Nothing
                }
                _ => {
                    trace!(command = %String::from_utf8_lossy(&command), status, "AT response");
                    Step::Nothing
                }
            },
            Frame::TransmitStatus { delivery_status, retries, .. } => {
                if delivery_status != 0 {
                    debug!(delivery_status, retries, "transmit not acknowledged");
                }
                Step::Nothing
            }
            other => {
                trace!(?other, "ignoring frame");
                Step::Nothing
            }
        }
    }

    fn take(&mut self, query: u8) -> Option<Packet> {
        let at = self.pending.iter().position(|a| a.query == query)?;
        self.pending.remove(at).map(|a| a.packet)
    }

    /// Releases the packet of a `DB` query that never reached the radio.
    fn abandon(&mut self, query: u8) -> Option<Inbound> {
        self.take(query).map(|packet| Inbound { packet, rssi: None })
    }

    /// Packets that waited too long for RSSI, or overflow the pending queue.
    fn expire(&mut self, now: Instant) -> Vec<Inbound> {
        let mut expired = Vec::new();
        while let Some(oldest) = self.pending.front() {
            if self.pending.len() <= MAX_PENDING && now.duration_since(oldest.since) < RSSI_TIMEOUT {
                break;
            }
            if let Some(a) = self.pending.pop_front() {
                expired.push(Inbound { packet: a.packet, rssi: None });
            }
        }
        expired
    }
}

struct Link {
    port: SharedPort,
    inbound: mpsc::Receiver<Inbound>,
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
}

pub struct XBeeTransport {
    id: NodeId,
    port_name: String,
    baud_rate: u32,
    peers: Vec<u64>,
    state: Arc<Mutex<LinkState>>,
    link: Option<Link>,
    // tags the fragments of each outgoing packet
    sequence: u8,
}

/// Parses a 64-bit radio address written as 16 hex digits.
pub fn parse_address(text: &str) -> Result<u64, TransportError> {
    let bytes = hex::decode(text.trim_start_matches("0x"))
        .map_err(|_| TransportError::Address(text.to_string()))?;
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| TransportError::Address(text.to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

impl XBeeTransport {
    pub fn new(
        id: NodeId,
        port_name: impl Into<String>,
        baud_rate: u32,
        peers: &[String],
    ) -> Result<Self, TransportError> {
        let peers = peers.iter().map(|p| parse_address(p)).collect::<Result<Vec<_>, _>>()?;
        if usize::from(id) >= peers.len() {
            return Err(TransportError::UnknownPeer(id));
        }
        Ok(Self {
            id,
            port_name: port_name.into(),
            baud_rate,
            peers,
            state: Arc::new(Mutex::new(LinkState::default())),
            link: None,
            sequence: 0,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, TransportError> {
        let n = usize::from(settings.node_count()).min(settings.peers.len());
        Self::new(
            settings.rf_sensor_id,
            settings.serial_port.clone(),
            settings.baud_rate,
            &settings.peers[..n],
        )
    }

    fn open_port(&self) -> Result<Box<dyn SerialPort>, TransportError> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;
        info!(port = %self.port_name, baud = self.baud_rate, "opened serial port");
        Ok(port)
    }

    fn resolved(&self) -> bool {
        self.state.lock().address().is_some()
    }
}

async fn write_frame(port: &SharedPort, frame: Frame) -> Result<(), TransportError> {
    let mut buf = BytesMut::new();
    XBeeCodec.encode(frame, &mut buf)?;
    let port = Arc::clone(port);
    tokio::task::spawn_blocking(move || {
        let mut port = port.lock();
        port.write_all(&buf)?;
        port.flush()
    })
    .await
    .map_err(|e| std::io::Error::other(e.to_string()))??;
    Ok(())
}

/// Blocking byte pump from the serial port into the link task.
fn spawn_reader(
    mut port: Box<dyn SerialPort>,
    bytes_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("xbee-reader".into())
        .spawn(move || {
            let mut buf = [0u8; 512];
            while !cancel.is_cancelled() {
                match port.read(&mut buf) {
                    Ok(0) => {}
                    Ok(n) => {
                        if bytes_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => {}
                    Err(e) => {
                        warn!(error = %e, "serial read failed");
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

async fn run_link(
    port: SharedPort,
    state: Arc<Mutex<LinkState>>,
    mut bytes_rx: mpsc::Receiver<Vec<u8>>,
    inbound_tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) {
    let mut codec = XBeeCodec;
    let mut buf = BytesMut::with_capacity(1024);
    let mut sweep = interval(RSSI_TIMEOUT);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => None,
            chunk = bytes_rx.recv() => match chunk {
                Some(c) => Some(c),
                None => break,
            },
        };

        let mut ready = Vec::new();
        if let Some(chunk) = chunk {
            buf.extend_from_slice(&chunk);
            loop {
                let frame = match codec.decode(&mut buf) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "discarding frame");
                        continue;
                    }
                };
                let step = state.lock().handle(frame, Instant::now());
                match step {
                    Step::Nothing => {}
                    Step::RequestRssi(query) => {
                        if let Err(e) = write_frame(&port, Frame::at(query, b"DB")).await {
                            warn!(error = %e, "RSSI query failed; delivering without RSSI");
                            ready.extend(state.lock().abandon(query));
                        }
                    }
                    Step::Deliver(inbound) => ready.push(inbound),
                }
            }
        }
        let expired = state.lock().expire(Instant::now());
        if !expired.is_empty() {
            debug!(count = expired.len(), "no RSSI answer; delivering without RSSI");
        }
        ready.extend(expired);

        for inbound in ready {
            if inbound_tx.send(inbound).await.is_err() {
                return;
            }
        }
    }
    debug!("serial link task stopped");
}

#[async_trait]
impl Transport for XBeeTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.link.is_some() {
            return Ok(());
        }
        let port = self.open_port()?;
        let reader = port.try_clone()?;
        let port: SharedPort = Arc::new(Mutex::new(port));
        *self.state.lock() = LinkState::default();

        let cancel = CancellationToken::new();
        let (bytes_tx, bytes_rx) = mpsc::channel(64);
        let (inbound_tx, inbound) = mpsc::channel(64);
        spawn_reader(reader, bytes_tx, cancel.clone())?;
        let dispatcher = tokio::spawn(run_link(
            Arc::clone(&port),
            Arc::clone(&self.state),
            bytes_rx,
            inbound_tx,
            cancel.clone(),
        ));

        // the address resolves once both halves are answered
        write_frame(&port, Frame::at(FRAME_ID, b"SH")).await?;
        write_frame(&port, Frame::at(FRAME_ID, b"SL")).await?;

        self.link = Some(Link { port, inbound, cancel, dispatcher });
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.cancel.cancel();
            let _ = link.dispatcher.await;
            info!(id = self.id, port = %self.port_name, "serial radio closed");
        }
    }

    async fn send(
        &mut self,
        packet: &Packet,
        to: Option<NodeId>,
        timestamp: f64,
    ) -> Result<(), TransportError> {
        if self.link.is_none() {
            return Err(TransportError::Closed);
        }
        if !self.resolved() {
            return Err(TransportError::Unresolved);
        }
        let targets: Vec<NodeId> = match to {
            Some(to) => vec![to],
            None => self.peer_ids().into_iter().filter(|p| *p != self.id).collect(),
        };

        let mut stamped = packet.clone();
        stamped.stamp_routing(Routing { from: self.id, to, timestamp });
        let fragments = fragment::split(self.sequence, &stamped.serialize()?)?;
        self.sequence = self.sequence.wrapping_add(1);
        let port = match &self.link {
            Some(link) => Arc::clone(&link.port),
            None => return Err(TransportError::Closed),
        };
        for target in targets {
            let dest64 = *self
                .peers
                .get(usize::from(target))
                .ok_or(TransportError::UnknownPeer(target))?;
            for payload in &fragments {
                write_frame(&port, Frame::transmit(FRAME_ID, dest64, payload.clone())).await?;
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::Closed)?;
        link.inbound.recv().await.ok_or_else(|| {
            TransportError::Io(std::io::Error::new(ErrorKind::BrokenPipe, "serial link lost"))
        })
    }

    fn identity(&self) -> NodeIdentity {
        let address = self.state.lock().address();
        NodeIdentity {
            id: self.id,
            address: address.map(|a| a.to_be_bytes().to_vec()).unwrap_or_default(),
            joined: self.link.is_some() && address.is_some(),
        }
    }

    fn peer_ids(&self) -> Vec<NodeId> {
        (0..self.peers.len()).filter_map(|i| NodeId::try_from(i).ok()).collect()
    }
}
