use chrono::Utc;

/// Source of the local time used for TDMA scheduling, in seconds.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Wall clock. Nodes do not need agreement on it, only a steady rate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1e6
    }
}

/// Lateness of an actual send relative to its slot start, in milliseconds.
pub fn lateness_ms(slot_start: f64, sent_at: f64) -> f64 {
    (sent_at - slot_start) * 1e3
}
