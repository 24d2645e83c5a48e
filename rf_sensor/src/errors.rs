// thiserror-based error types for the node, transports, buffer and sender
use rf_protocol::{NodeId, PacketError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("hardware address of this node is not resolved yet")]
    Unresolved,
    #[error("no address configured for node {0}")]
    UnknownPeer(NodeId),
    #[error("invalid peer address '{0}'")]
    Address(String),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial: {0}")]
    Serial(#[from] serialport::Error),
    #[error("frame: {0}")]
    Frame(String),
    #[error("packet: {0}")]
    Packet(#[from] PacketError),
}

impl TransportError {
    /// Errors after which the transport can not be used any further.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Closed | TransportError::Io(_) | TransportError::Serial(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("specification '{0}' already has a registered action")]
    DuplicateAction(String),
    #[error("private packets can not be enqueued")]
    PrivatePacket,
    #[error("node is stopped")]
    Stopped,
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("packet: {0}")]
    Packet(#[from] PacketError),
}

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("private specification '{0}' can not be buffered")]
    PrivateSpecification(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(#[from] PacketError),
}

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("session cancelled")]
    Cancelled,
    #[error("node: {0}")]
    Node(#[from] NodeError),
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("settings file is not a key/value object")]
    NotAnObject,
}
