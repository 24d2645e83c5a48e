// src/net/mod.rs
pub mod fragment;
pub mod framing;
pub mod udp;
pub mod xbee;

use crate::errors::TransportError;
use async_trait::async_trait;
use rf_protocol::{NodeId, Packet};
use std::fmt;

pub use udp::UdpTransport;
pub use xbee::XBeeTransport;

/// A packet as it came off the radio, reserved routing keys still attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub packet: Packet,
    /// Signal strength of the frame in dBm, when the radio reports one.
    pub rssi: Option<f64>,
}

/// Who this node is on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: NodeId,
    /// Socket address text for the simulator, SH ‖ SL for XBee radios. Empty while unresolved.
    pub address: Vec<u8>,
    pub joined: bool,
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} [{}]", self.id, hex::encode(&self.address))?;
        if !self.joined {
            f.write_str(" (not joined)")?;
        }
        Ok(())
    }
}

/// Link to the shared channel.
///
/// Implementations stamp the reserved routing keys on every outgoing packet.
/// `recv` must be cancel safe: the node runner polls it inside `select!`.
#[async_trait]
pub trait Transport: Send {
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Releases the link. Closing twice is a no-op.
    async fn close(&mut self);

    /// Sends `packet` to node `to`, or to every other node when `to` is `None`.
    /// `timestamp` is the sender clock reading carried in `_timestamp`.
    async fn send(
        &mut self,
        packet: &Packet,
        to: Option<NodeId>,
        timestamp: f64,
    ) -> Result<(), TransportError>;

    async fn recv(&mut self) -> Result<Inbound, TransportError>;

    fn identity(&self) -> NodeIdentity;

    /// Ids of every node this transport has an address for, including itself.
    fn peer_ids(&self) -> Vec<NodeId>;
}
