// Reliable settings dissemination: clear -> add(i)... -> done, one ack per step
pub mod receiver;
pub mod sender;
pub mod settings;

use rf_protocol::{NodeId, Packet, PacketError, Specification, Value};

pub use receiver::{SettingsReceiver, spawn_settings_receiver};
pub use sender::{Failure, Session, SessionConfig, SessionReport, Step, route_acks, run_session};
pub use settings::{LocalEffect, SettingsStore};

pub fn clear_packet() -> Packet {
    Packet::with_specification(Specification::SettingClear)
}

pub fn add_packet(index: usize, key: &str, value: &Value) -> Result<Packet, PacketError> {
    let mut packet = Packet::with_specification(Specification::SettingAdd);
    packet.set("index", index)?;
    packet.set("key", key)?;
    packet.set("value", value.clone())?;
    Ok(packet)
}

pub fn done_packet() -> Packet {
    Packet::with_specification(Specification::SettingDone)
}

pub fn ack_packet(sensor_id: NodeId, next_index: usize) -> Result<Packet, PacketError> {
    let mut packet = Packet::with_specification(Specification::SettingAck);
    packet.set("next_index", next_index)?;
    packet.set("sensor_id", sensor_id)?;
    Ok(packet)
}

/// Final ack: the items at `failed` did not validate and nothing was committed
/// unless `failed` is empty.
pub fn done_ack_packet(
    sensor_id: NodeId,
    next_index: usize,
    failed: &[usize],
) -> Result<Packet, PacketError> {
    let mut packet = ack_packet(sensor_id, next_index)?;
    packet.set("complete", true)?;
    packet.set("failed", failed.to_vec())?;
    Ok(packet)
}
