use super::settings::LocalEffect;
use super::{add_packet, clear_packet, done_packet};
use crate::config::Settings;
use crate::errors::{NodeError, SenderError};
use crate::sensor::NodeHandle;
use rf_protocol::{NodeId, Packet, PacketError, Specification, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Retransmissions of one unanswered step before the target fails.
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.settings_max_retries.max(1),
            retry_interval: settings.retry_interval(),
        }
    }
}

/// Protocol step a target was stuck on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Clear,
    Add(usize),
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    Timeout(Step),
    /// The target refused the items at these indices; nothing was committed there.
    Rejected(Vec<usize>),
}

/// Per-target progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetState {
    /// Clear sent, not yet acknowledged.
    Idle,
    Cleared,
    /// This many items acknowledged.
    Adding(usize),
    Done,
    Failed(Failure),
}

#[derive(Debug)]
struct Target {
    state: TargetState,
    timeouts: u32,
    deadline: Instant,
}

/// A packet the session wants sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub to: NodeId,
    pub packet: Packet,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionReport {
    pub succeeded: Vec<NodeId>,
    pub failed: Vec<(NodeId, Failure)>,
    /// Set when the local effect ran and failed.
    pub local_error: Option<String>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.local_error.is_none()
    }
}

/// One dissemination of `items` to a set of targets. Pure state; the caller
/// moves packets and time.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    items: Vec<(String, Value)>,
    targets: BTreeMap<NodeId, Target>,
    config: SessionConfig,
}

impl Session {
    pub fn new(
        items: Vec<(String, Value)>,
        targets: impl IntoIterator<Item = NodeId>,
        config: SessionConfig,
        now: Instant,
    ) -> Self {
        let targets = targets
            .into_iter()
            .map(|id| (id, Target { state: TargetState::Idle, timeouts: 0, deadline: now }))
            .collect();
        Self { id: Uuid::new_v4(), items, targets, config }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn items(&self) -> &[(String, Value)] {
        &self.items
    }

    pub fn state(&self, target: NodeId) -> Option<&TargetState> {
        self.targets.get(&target).map(|t| &t.state)
    }

    /// Clear packets for every target.
    pub fn start(&mut self, now: Instant) -> Vec<Outgoing> {
        let deadline = now + self.config.retry_interval;
        let mut out = Vec::with_capacity(self.targets.len());
        for (id, target) in self.targets.iter_mut() {
            target.state = TargetState::Idle;
            target.timeouts = 0;
            target.deadline = deadline;
            out.push(Outgoing { to: *id, packet: clear_packet() });
        }
        info!(session = %self.id, targets = out.len(), items = self.items.len(), "settings session started");
        out
    }

    fn step(&self, state: &TargetState) -> Option<Step> {
        let cursor = match state {
            TargetState::Idle => return Some(Step::Clear),
            TargetState::Cleared => 0,
            TargetState::Adding(n) => *n,
            TargetState::Done | TargetState::Failed(_) => return None,
        };
        Some(if cursor < self.items.len() { Step::Add(cursor) } else { Step::Done })
    }

    fn packet_for(&self, step: Step) -> Result<Packet, PacketError> {
        match step {
            Step::Clear => Ok(clear_packet()),
            Step::Add(i) => {
                let (key, value) = &self.items[i];
                add_packet(i, key, value)
            }
            Step::Done => Ok(done_packet()),
        }
    }

    /// Advances the acking target. Stale or foreign acks are ignored.
    pub fn on_ack(&mut self, ack: &Packet, now: Instant) -> Result<Vec<Outgoing>, PacketError> {
        if ack.specification() != Some(Specification::SettingAck) {
            return Ok(Vec::new());
        }
        let from = ack.get_node_id("sensor_id")?;
        let next_index = usize::try_from(ack.get_i64("next_index")?).unwrap_or(usize::MAX);
        let complete = ack.get_bool("complete").unwrap_or(false);
        let len = self.items.len();

        let Some(target) = self.targets.get(&from) else {
            debug!(session = %self.id, from, "ack from a node outside the session");
            return Ok(Vec::new());
        };
        let Some(step) = self.step(&target.state) else {
            return Ok(Vec::new());
        };

        let next = match (step, complete) {
            (Step::Done, true) => {
                let failed: Vec<usize> = ack
                    .get("failed")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_u64).map(|i| i as usize).collect())
                    .unwrap_or_default();
                if failed.is_empty() {
                    TargetState::Done
                } else {
                    TargetState::Failed(Failure::Rejected(failed))
                }
            }
            (_, true) => return Ok(Vec::new()),
            (Step::Clear, false) if next_index == 0 => TargetState::Cleared,
            (Step::Add(cursor), false) if next_index > cursor && next_index <= len => {
                TargetState::Adding(next_index)
            }
            _ => {
                debug!(session = %self.id, from, next_index, "stale ack");
                return Ok(Vec::new());
            }
        };

        let outgoing = match self.step(&next) {
            Some(step) => vec![Outgoing { to: from, packet: self.packet_for(step)? }],
            None => Vec::new(),
        };
        match &next {
            TargetState::Done => info!(session = %self.id, target = from, "target done"),
            TargetState::Failed(failure) => {
                warn!(session = %self.id, target = from, ?failure, "target rejected settings");
            }
            _ => {}
        }
        if let Some(target) = self.targets.get_mut(&from) {
            target.state = next;
            target.timeouts = 0;
            target.deadline = now + self.config.retry_interval;
        }
        Ok(outgoing)
    }

    /// Re-sends overdue steps; targets out of retries fail.
    pub fn poll_timeouts(&mut self, now: Instant) -> Result<Vec<Outgoing>, PacketError> {
        let mut resend = Vec::new();
        let mut failed = Vec::new();
        for (id, target) in &self.targets {
            let Some(step) = self.step(&target.state) else { continue };
            if now < target.deadline {
                continue;
            }
            if target.timeouts >= self.config.max_retries {
                failed.push((*id, step));
            } else {
                resend.push((*id, step));
            }
        }

        for (id, step) in failed {
            warn!(session = %self.id, target = id, ?step, "target out of retries");
            if let Some(target) = self.targets.get_mut(&id) {
                target.state = TargetState::Failed(Failure::Timeout(step));
            }
        }
        let mut out = Vec::with_capacity(resend.len());
        for (id, step) in resend {
            debug!(session = %self.id, target = id, ?step, "retrying");
            out.push(Outgoing { to: id, packet: self.packet_for(step)? });
            if let Some(target) = self.targets.get_mut(&id) {
                target.timeouts += 1;
                target.deadline = now + self.config.retry_interval;
            }
        }
        Ok(out)
    }

    /// Earliest retry deadline of a target still in progress.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.targets
            .values()
            .filter(|t| self.step(&t.state).is_some())
            .map(|t| t.deadline)
            .min()
    }

    pub fn is_finished(&self) -> bool {
        self.targets
            .values()
            .all(|t| matches!(t.state, TargetState::Done | TargetState::Failed(_)))
    }

    pub fn report(&self) -> SessionReport {
        let mut report = SessionReport::default();
        for (id, target) in &self.targets {
            match &target.state {
                TargetState::Done => report.succeeded.push(*id),
                TargetState::Failed(failure) => report.failed.push((*id, failure.clone())),
                _ => {}
            }
        }
        report
    }
}

/// Registers the ack action on `node` and returns the stream of acks.
/// Do this once per node; sessions run one after another share the stream.
pub async fn route_acks(node: &NodeHandle) -> Result<mpsc::UnboundedReceiver<Packet>, NodeError> {
    let (tx, rx) = mpsc::unbounded_channel();
    node.add_packet_action(
        Specification::SettingAck,
        Box::new(move |packet| {
            let _ = tx.send(packet);
        }),
    )
    .await?;
    Ok(rx)
}

async fn send_all(node: &NodeHandle, outgoing: Vec<Outgoing>) -> Result<(), NodeError> {
    for Outgoing { to, packet } in outgoing {
        node.enqueue(packet, Some(to)).await?;
    }
    Ok(())
}

/// Drives `session` to completion over `node`.
///
/// Cancelling drops the session state and skips the local effect. Otherwise
/// the local effect runs once at the end, whatever the remote outcome.
pub async fn run_session(
    mut session: Session,
    node: &NodeHandle,
    acks: &mut mpsc::UnboundedReceiver<Packet>,
    cancel: &CancellationToken,
    local_effect: Option<&mut dyn LocalEffect>,
) -> Result<SessionReport, SenderError> {
    let now = Instant::now();
    send_all(node, session.start(now)).await?;

    while !session.is_finished() {
        let Some(deadline) = session.next_deadline() else { break };
        let outgoing = tokio::select! {
            _ = cancel.cancelled() => {
                info!(session = %session.id(), "settings session cancelled");
                return Err(SenderError::Cancelled);
            }
            ack = acks.recv() => match ack {
                Some(ack) => match session.on_ack(&ack, Instant::now()) {
                    Ok(out) => out,
                    Err(e) => {
                        warn!(session = %session.id(), error = %e, "malformed ack");
                        Vec::new()
                    }
                },
                None => return Err(SenderError::Node(NodeError::Stopped)),
            },
            _ = sleep_until(deadline) => session.poll_timeouts(Instant::now()).map_err(NodeError::from)?,
        };
        send_all(node, outgoing).await?;
    }

    let mut report = session.report();
    if let Some(effect) = local_effect {
        if let Err(e) = effect.apply(session.items()) {
            error!(session = %session.id(), error = %e, "local settings effect failed");
            report.local_error = Some(e.to_string());
        }
    }
    info!(
        session = %session.id(),
        succeeded = ?report.succeeded,
        failed = ?report.failed,
        "settings session finished"
    );
    Ok(report)
}
