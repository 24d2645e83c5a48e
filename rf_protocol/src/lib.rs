// lib.rs: packet model and wire encoding shared by every radio node

use serde_json::Map;
use std::fmt;
use thiserror::Error;

pub use serde_json::{Value, json};

// =============================== Common =====================================

pub type NodeId = u8;

/// Node id of the ground station. It is the designated sink for measurements.
pub const GROUND_STATION_ID: NodeId = 0;

/// Keys (and specifications) starting with this prefix belong to the network core.
pub const RESERVED_PREFIX: &str = "_";

pub const MAX_PACKET_SIZE: usize = 65_507; // largest UDP payload

pub const KEY_SPECIFICATION: &str = "specification";
pub const KEY_FROM_ID: &str = "_from_id";
pub const KEY_TO_ID: &str = "_to_id";
pub const KEY_TIMESTAMP: &str = "_timestamp";

pub fn is_reserved(key: &str) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

// =============================== Errors =====================================

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("key '{0}' is reserved for routing metadata")]
    ReservedKey(String),
    #[error("key '{key}' does not hold a {expected}")]
    TypeMismatch { key: String, expected: &'static str },
    #[error("key '{0}' is missing")]
    Missing(String),
    #[error("malformed packet: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("packet is not a key/value object")]
    NotAnObject,
    #[error("packet too large: {0} bytes")]
    TooLarge(usize),
}

// =========================== Specifications =================================

/// Semantic type of a packet, stored under the `specification` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Specification {
    /// Vehicle-to-vehicle measurement beacon. Internal to the network core.
    RssiBroadcast,
    /// Link measurement reported by a vehicle to the ground station.
    RssiGroundStation,
    SettingClear,
    SettingAdd,
    SettingDone,
    SettingAck,
    Custom(String),
}

impl Specification {
    pub fn as_str(&self) -> &str {
        match self {
            Specification::RssiBroadcast => "_rssi_broadcast",
            Specification::RssiGroundStation => "rssi_ground_station",
            Specification::SettingClear => "setting_clear",
            Specification::SettingAdd => "setting_add",
            Specification::SettingDone => "setting_done",
            Specification::SettingAck => "setting_ack",
            Specification::Custom(name) => name,
        }
    }

    pub fn is_private(&self) -> bool {
        is_reserved(self.as_str())
    }

    /// Measurement packets are routed to the ground station buffer by default.
    pub fn is_measurement(&self) -> bool {
        matches!(self, Specification::RssiGroundStation)
    }
}

impl From<&str> for Specification {
    fn from(name: &str) -> Self {
        match name {
            "_rssi_broadcast" => Specification::RssiBroadcast,
            "rssi_ground_station" => Specification::RssiGroundStation,
            "setting_clear" => Specification::SettingClear,
            "setting_add" => Specification::SettingAdd,
            "setting_done" => Specification::SettingDone,
            "setting_ack" => Specification::SettingAck,
            other => Specification::Custom(other.to_string()),
        }
    }
}

impl From<String> for Specification {
    fn from(name: String) -> Self {
        Specification::from(name.as_str())
    }
}

impl fmt::Display for Specification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================== Routing ====================================

/// Routing metadata carried in the reserved keys of a packet on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Routing {
    pub from: NodeId,
    /// `None` for packets that are not addressed to a single node.
    pub to: Option<NodeId>,
    /// Send time on the sender's clock, in seconds.
    pub timestamp: f64,
}

// =============================== Packet =====================================

/// Ordered key/value envelope exchanged between nodes.
///
/// Keys starting with [`RESERVED_PREFIX`] hold routing metadata. They are
/// written by the transport layer through [`Packet::stamp_routing`] and can
/// not be touched through `set`/`unset`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    contents: Map<String, Value>,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_specification(spec: impl Into<Specification>) -> Self {
        let mut packet = Self::new();
        packet
            .contents
            .insert(KEY_SPECIFICATION.to_string(), Value::from(spec.into().as_str()));
        packet
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<(), PacketError> {
        if is_reserved(key) {
            return Err(PacketError::ReservedKey(key.to_string()));
        }
        self.contents.insert(key.to_string(), value.into());
        Ok(())
    }

    /// Removes `key`, returning its previous value. Unknown keys are not an error.
    pub fn unset(&mut self, key: &str) -> Result<Option<Value>, PacketError> {
        if is_reserved(key) {
            return Err(PacketError::ReservedKey(key.to_string()));
        }
        Ok(self.contents.shift_remove(key))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.contents.get(key)
    }

    pub fn get_all(&self) -> &Map<String, Value> {
        &self.contents
    }

    pub fn contains(&self, key: &str) -> bool {
        self.contents.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    fn require(&self, key: &str) -> Result<&Value, PacketError> {
        self.contents
            .get(key)
            .ok_or_else(|| PacketError::Missing(key.to_string()))
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, PacketError> {
        self.require(key)?.as_i64().ok_or(PacketError::TypeMismatch {
            key: key.to_string(),
            expected: "integer",
        })
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, PacketError> {
        self.require(key)?.as_f64().ok_or(PacketError::TypeMismatch {
            key: key.to_string(),
            expected: "number",
        })
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, PacketError> {
        self.require(key)?.as_bool().ok_or(PacketError::TypeMismatch {
            key: key.to_string(),
            expected: "boolean",
        })
    }

    pub fn get_str(&self, key: &str) -> Result<&str, PacketError> {
        self.require(key)?.as_str().ok_or(PacketError::TypeMismatch {
            key: key.to_string(),
            expected: "string",
        })
    }

    /// Reads a `[latitude, longitude]` pair.
    pub fn get_coordinate(&self, key: &str) -> Result<(f64, f64), PacketError> {
        let mismatch = || PacketError::TypeMismatch {
            key: key.to_string(),
            expected: "coordinate pair",
        };
        match self.require(key)?.as_array().map(Vec::as_slice) {
            Some([a, b]) => Ok((
                a.as_f64().ok_or_else(mismatch)?,
                b.as_f64().ok_or_else(mismatch)?,
            )),
            _ => Err(mismatch()),
        }
    }

    pub fn get_node_id(&self, key: &str) -> Result<NodeId, PacketError> {
        let raw = self.get_i64(key)?;
        NodeId::try_from(raw).map_err(|_| PacketError::TypeMismatch {
            key: key.to_string(),
            expected: "node id",
        })
    }

    pub fn specification(&self) -> Option<Specification> {
        self.contents
            .get(KEY_SPECIFICATION)
            .and_then(Value::as_str)
            .map(Specification::from)
    }

    pub fn is_private(&self) -> bool {
        self.specification().is_some_and(|s| s.is_private())
    }

    // ---------------------------- routing ---------------------------------

    /// Writes the reserved routing keys. Only the transport layer calls this.
    pub fn stamp_routing(&mut self, routing: Routing) {
        self.contents
            .insert(KEY_FROM_ID.to_string(), Value::from(routing.from));
        match routing.to {
            Some(to) => {
                self.contents.insert(KEY_TO_ID.to_string(), Value::from(to));
            }
            None => {
                self.contents.shift_remove(KEY_TO_ID);
            }
        }
        self.contents
            .insert(KEY_TIMESTAMP.to_string(), Value::from(routing.timestamp));
    }

    /// Routing metadata, if both origin and send time are present and well formed.
    pub fn routing(&self) -> Option<Routing> {
        let from = self
            .contents
            .get(KEY_FROM_ID)
            .and_then(Value::as_u64)
            .and_then(|v| NodeId::try_from(v).ok())?;
        let timestamp = self.contents.get(KEY_TIMESTAMP).and_then(Value::as_f64)?;
        let to = self
            .contents
            .get(KEY_TO_ID)
            .and_then(Value::as_u64)
            .and_then(|v| NodeId::try_from(v).ok());
        Some(Routing { from, to, timestamp })
    }

    /// Removes every reserved key so the payload can be handed to application code.
    pub fn strip_reserved(&mut self) -> Option<Routing> {
        let routing = self.routing();
        self.contents.retain(|key, _| !is_reserved(key));
        routing
    }

    // ------------------------------ wire ----------------------------------

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let bytes = serde_json::to_vec(&self.contents)?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Decodes a packet. Any malformed input fails as a whole.
    pub fn deserialize(bytes: &[u8]) -> Result<Packet, PacketError> {
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(bytes.len()));
        }
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(contents) => Ok(Packet { contents }),
            _ => Err(PacketError::NotAnObject),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.contents) {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str("<unprintable packet>"),
        }
    }
}

// ================================ Tests =====================================
