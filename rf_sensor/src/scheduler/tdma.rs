// src/scheduler/tdma.rs
use rf_protocol::NodeId;
use tracing::debug;

/// Per-node TDMA slot assignment with clock synchronization from overheard traffic.
///
/// A cycle is `slot_duration * node_count` seconds long and node `id` owns the
/// slot starting `id * slot_duration` into every cycle. Nodes never agree on
/// wall-clock time; they re-anchor their grid from the send timestamp carried
/// by every packet they hear.
#[derive(Debug, Clone, PartialEq)]
pub struct TdmaScheduler {
    id: NodeId,
    node_count: u8,
    slot_duration: f64,
    // committed next send time; only moves forward
    next_send_time: f64,
}

impl TdmaScheduler {
    pub fn new(id: NodeId, node_count: u8, slot_duration: f64) -> Self {
        let node_count = node_count.max(1);
        Self {
            id,
            node_count,
            slot_duration,
            next_send_time: f64::from(id % node_count) * slot_duration,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn slot_duration(&self) -> f64 {
        self.slot_duration
    }

    pub fn node_count(&self) -> u8 {
        self.node_count
    }

    pub fn cycle(&self) -> f64 {
        self.slot_duration * f64::from(self.node_count)
    }

    /// Last committed send time.
    pub fn committed(&self) -> f64 {
        self.next_send_time
    }

    /// Next time this node may transmit, strictly after `now`.
    ///
    /// Never earlier than the committed send time.
    pub fn next_timestamp(&self, now: f64) -> f64 {
        if self.next_send_time > now {
            return self.next_send_time;
        }
        let cycle = self.cycle();
        let cycles = ((now - self.next_send_time) / cycle).floor() + 1.0;
        self.next_send_time + cycles * cycle
    }

    /// Commits the slot following `now`, after a local send.
    pub fn advance(&mut self, now: f64) -> f64 {
        self.next_send_time = self.next_timestamp(now);
        self.next_send_time
    }

    /// Re-anchors the schedule from a packet `sender_id` sent at `received_timestamp`.
    ///
    /// Our slot lies `(id - sender) mod node_count` slots after the sender's.
    /// The later of that and the committed send time wins, so a correction can
    /// never pull this node into a slot it already gave up.
    pub fn synchronize(&mut self, received_timestamp: f64, sender_id: NodeId) -> f64 {
        let n = i32::from(self.node_count);
        let distance = (i32::from(self.id) - i32::from(sender_id)).rem_euclid(n);
        let anchored = received_timestamp + f64::from(distance) * self.slot_duration;

        if anchored >= self.next_send_time {
            self.next_send_time = anchored;
        } else {
            debug!(
                id = self.id,
                sender_id,
                anchored,
                committed = self.next_send_time,
                "sync would move schedule backwards; keeping committed slot"
            );
        }
        self.next_send_time
    }
}
