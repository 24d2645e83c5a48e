// Simulated radio: one UDP socket per node, addresses taken from `peers`
use super::{Inbound, NodeIdentity, Transport};
use crate::config::Settings;
use crate::errors::TransportError;
use async_trait::async_trait;
use rand::Rng;
use rf_protocol::{MAX_PACKET_SIZE, NodeId, Packet, Routing};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

pub struct UdpTransport {
    id: NodeId,
    peers: Vec<SocketAddr>,
    socket: Option<UdpSocket>,
    buf: Vec<u8>,
}

impl UdpTransport {
    pub fn new(id: NodeId, peers: &[String]) -> Result<Self, TransportError> {
        let peers = peers
            .iter()
            .map(|p| p.parse::<SocketAddr>().map_err(|_| TransportError::Address(p.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        if usize::from(id) >= peers.len() {
            return Err(TransportError::UnknownPeer(id));
        }
        Ok(Self { id, peers, socket: None, buf: vec![0u8; MAX_PACKET_SIZE] })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, TransportError> {
        let n = usize::from(settings.node_count()).min(settings.peers.len());
        Self::new(settings.rf_sensor_id, &settings.peers[..n])
    }

    fn bind(addr: SocketAddr) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        // restarted nodes rebind their fixed address immediately
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        UdpSocket::from_std(socket.into())
    }

    fn synthetic_rssi() -> f64 {
        f64::from(rand::rng().random_range(-70i32..=-30))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let addr = self.peers[usize::from(self.id)];
        let socket = Self::bind(addr)?;
        info!(id = self.id, %addr, "simulated radio bound");
        self.socket = Some(socket);
        Ok(())
    }

    async fn close(&mut self) {
        if self.socket.take().is_some() {
            info!(id = self.id, "simulated radio closed");
        }
    }

    async fn send(
        &mut self,
        packet: &Packet,
        to: Option<NodeId>,
        timestamp: f64,
    ) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
        let mut stamped = packet.clone();
        stamped.stamp_routing(Routing { from: self.id, to, timestamp });
        let bytes = stamped.serialize()?;

        match to {
            Some(to) => {
                let addr = self
                    .peers
                    .get(usize::from(to))
                    .ok_or(TransportError::UnknownPeer(to))?;
                socket.send_to(&bytes, addr).await?;
            }
            None => {
                for (peer, addr) in self.peers.iter().enumerate() {
                    if peer != usize::from(self.id) {
                        socket.send_to(&bytes, addr).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        loop {
            let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
            let (n, from) = match socket.recv_from(&mut self.buf).await {
                Ok(r) => r,
                // ICMP port unreachable from a peer that is not up yet
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                    debug!(id = self.id, error = %e, "peer unreachable");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match Packet::deserialize(&self.buf[..n]) {
                Ok(packet) => {
                    return Ok(Inbound { packet, rssi: Some(Self::synthetic_rssi()) });
                }
                Err(e) => warn!(id = self.id, %from, error = %e, "dropping malformed datagram"),
            }
        }
    }

    fn identity(&self) -> NodeIdentity {
        let address = self
            .socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.to_string().into_bytes())
            .unwrap_or_default();
        NodeIdentity { id: self.id, address, joined: self.socket.is_some() }
    }

    fn peer_ids(&self) -> Vec<NodeId> {
        (0..self.peers.len()).filter_map(|i| NodeId::try_from(i).ok()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rf_protocol::Specification;
    use std::time::Duration;
    use tokio::time::timeout;

    fn free_addrs(n: usize) -> Vec<String> {
        let sockets: Vec<_> = (0..n)
            .map(|_| std::net::UdpSocket::bind("127.0.0.1:0").unwrap())
            .collect();
        sockets.iter().map(|s| s.local_addr().unwrap().to_string()).collect()
    }

    async fn network(n: usize) -> Vec<UdpTransport> {
        let peers = free_addrs(n);
        let mut nodes = Vec::new();
        for id in 0..n {
            let mut t = UdpTransport::new(id as NodeId, &peers).unwrap();
            t.open().await.unwrap();
            nodes.push(t);
        }
        nodes
    }

    #[tokio::test]
    async fn unicast_carries_routing() {
        let mut nodes = network(3).await;
        let mut p = Packet::with_specification("waypoint");
        p.set("index", 4).unwrap();
        nodes[1].send(&p, Some(2), 7.25).await.unwrap();

        let inbound = timeout(Duration::from_secs(2), nodes[2].recv()).await.unwrap().unwrap();
        let routing = inbound.packet.routing().unwrap();
        assert_eq!(routing, Routing { from: 1, to: Some(2), timestamp: 7.25 });
        assert_eq!(inbound.packet.specification(), Some(Specification::from("waypoint")));
        let rssi = inbound.rssi.unwrap();
        assert!((-70.0..=-30.0).contains(&rssi));
    }

    #[tokio::test]
    async fn broadcast_skips_self() {
        let mut nodes = network(3).await;
        let p = Packet::with_specification("hello");
        nodes[0].send(&p, None, 1.0).await.unwrap();

        for id in [1, 2] {
            let inbound = timeout(Duration::from_secs(2), nodes[id].recv()).await.unwrap().unwrap();
            assert_eq!(inbound.packet.routing().unwrap().to, None);
        }
        assert!(timeout(Duration::from_millis(100), nodes[0].recv()).await.is_err());
    }

    #[tokio::test]
    async fn closed_transport_rejects_io() {
        let mut nodes = network(2).await;
        nodes[0].close().await;
        nodes[0].close().await;
        assert!(!nodes[0].identity().joined);
        let p = Packet::with_specification("x");
        assert!(matches!(nodes[0].send(&p, Some(1), 0.0).await, Err(TransportError::Closed)));
        assert!(matches!(nodes[0].recv().await, Err(TransportError::Closed)));
    }

    #[test]
    fn rejects_bad_peer_table() {
        assert!(matches!(
            UdpTransport::new(0, &["not-an-address".into()]),
            Err(TransportError::Address(_))
        ));
        assert!(matches!(
            UdpTransport::new(3, &["127.0.0.1:1".into()]),
            Err(TransportError::UnknownPeer(3))
        ));
    }
}
