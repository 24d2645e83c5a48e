// src/sensor/mod.rs
pub mod handle;
pub mod launch;
pub mod measurement;
pub mod node;

pub use handle::{NodeHandle, spawn};
pub use launch::{FixedLocation, NodeTask, launch};
pub use node::{NodeCallbacks, PacketAction, SensorNode};
