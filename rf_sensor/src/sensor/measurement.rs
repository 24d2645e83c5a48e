// Link measurement packets: the vehicle beacon and the report sent to the ground station
use rf_protocol::{NodeId, Packet, PacketError, Specification};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub valid: bool,
}

/// Decoded `_rssi_broadcast` payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beacon {
    pub sensor_id: NodeId,
    pub position: Position,
}

pub fn broadcast_packet(sensor_id: NodeId, position: Position) -> Result<Packet, PacketError> {
    let mut packet = Packet::with_specification(Specification::RssiBroadcast);
    packet.set("latitude", position.latitude)?;
    packet.set("longitude", position.longitude)?;
    packet.set("valid", position.valid)?;
    packet.set("sensor_id", sensor_id)?;
    Ok(packet)
}

impl Beacon {
    pub fn from_packet(packet: &Packet) -> Result<Self, PacketError> {
        Ok(Self {
            sensor_id: packet.get_node_id("sensor_id")?,
            position: Position {
                latitude: packet.get_f64("latitude")?,
                longitude: packet.get_f64("longitude")?,
                valid: packet.get_bool("valid")?,
            },
        })
    }
}

/// Report of one link: `from_id` transmitted at `from`, `sensor_id` heard it at `to`.
pub fn ground_station_packet(
    sensor_id: NodeId,
    from_id: NodeId,
    from: Position,
    to: Position,
    rssi: f64,
) -> Result<Packet, PacketError> {
    let mut packet = Packet::with_specification(Specification::RssiGroundStation);
    packet.set("sensor_id", sensor_id)?;
    packet.set("from_id", from_id)?;
    packet.set("from_latitude", from.latitude)?;
    packet.set("from_longitude", from.longitude)?;
    packet.set("from_valid", from.valid)?;
    packet.set("to_latitude", to.latitude)?;
    packet.set("to_longitude", to.longitude)?;
    packet.set("to_valid", to.valid)?;
    packet.set("rssi", rssi)?;
    Ok(packet)
}
