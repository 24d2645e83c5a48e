//! Radio node runtime: TDMA scheduling, simulated and XBee transports,
//! the sensor node, the ground station buffer and reliable settings delivery.
pub mod commands;
pub mod config;
pub mod errors;
pub mod logging;
pub mod net;
pub mod scheduler;
pub mod sensor;
pub mod telemetry;
