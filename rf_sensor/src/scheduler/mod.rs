// src/scheduler/mod.rs
pub mod tdma;
pub mod timing;

pub use tdma::TdmaScheduler;
pub use timing::{Clock, SystemClock};
