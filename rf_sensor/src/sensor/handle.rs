// Node runner task and the cloneable handle other tasks use to talk to it
use super::node::{PacketAction, SensorNode};
use crate::errors::{NodeError, TransportError};
use crate::net::{Inbound, NodeIdentity, Transport};
use crate::telemetry::Buffer;
use rf_protocol::{NodeId, Packet, Specification};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

enum Command {
    Enqueue {
        packet: Packet,
        to: Option<NodeId>,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    Start,
    Stop,
    AddAction {
        specification: Specification,
        action: PacketAction,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    Identity(oneshot::Sender<NodeIdentity>),
}

enum Event {
    Tick,
    Inbound(Result<Inbound, TransportError>),
    Command(Command),
}

#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    number_of_sensors: u8,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    buffer: Option<Buffer>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn number_of_sensors(&self) -> u8 {
        self.number_of_sensors
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(make(reply)).await.map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    pub async fn enqueue(&self, packet: Packet, to: Option<NodeId>) -> Result<(), NodeError> {
        self.request(|reply| Command::Enqueue { packet, to, reply }).await?
    }

    pub async fn add_packet_action(
        &self,
        specification: impl Into<Specification>,
        action: PacketAction,
    ) -> Result<(), NodeError> {
        let specification = specification.into();
        self.request(|reply| Command::AddAction { specification, action, reply })
            .await?
    }

    pub async fn identity(&self) -> Result<NodeIdentity, NodeError> {
        self.request(Command::Identity).await
    }

    pub async fn start(&self) -> Result<(), NodeError> {
        self.commands.send(Command::Start).await.map_err(|_| NodeError::Stopped)
    }

    pub async fn stop(&self) -> Result<(), NodeError> {
        self.commands.send(Command::Stop).await.map_err(|_| NodeError::Stopped)
    }

    /// Stops the node. A send in flight is abandoned and the transport closed.
    pub fn deactivate(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.commands.is_closed()
    }
}

/// Activates `node` and runs it on its own task until deactivated or the
/// transport fails.
pub fn spawn<T: Transport + 'static>(
    node: SensorNode<T>,
    loop_delay: Duration,
) -> (NodeHandle, JoinHandle<Result<(), NodeError>>) {
    let (commands, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let handle = NodeHandle {
        id: node.id(),
        number_of_sensors: node.number_of_sensors(),
        commands,
        cancel: cancel.clone(),
        buffer: node.buffer().cloned(),
    };
    let task = tokio::spawn(run(node, rx, cancel, loop_delay));
    (handle, task)
}

async fn run<T: Transport>(
    mut node: SensorNode<T>,
    mut commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    loop_delay: Duration,
) -> Result<(), NodeError> {
    node.activate().await?;
    let mut ticker = interval(loop_delay);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let result = loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            _ = ticker.tick() => Event::Tick,
            inbound = node.next_inbound() => Event::Inbound(inbound),
            command = commands.recv() => match command {
                Some(c) => Event::Command(c),
                None => break Ok(()),
            },
        };

        let handled = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            r = handle_event(&mut node, event) => r,
        };
        match handled {
            Err(NodeError::Transport(e)) if e.is_fatal() => {
                warn!(id = node.id(), error = %e, "transport failed; node stopping");
                break Err(NodeError::Transport(e));
            }
            Err(e) => warn!(id = node.id(), error = %e, "node event failed"),
            Ok(()) => {}
        }
    };

    node.deactivate().await;
    info!(id = node.id(), "node runner finished");
    result
}

async fn handle_event<T: Transport>(node: &mut SensorNode<T>, event: Event) -> Result<(), NodeError> {
    match event {
        Event::Tick => node.periodic_tick().await,
        Event::Inbound(inbound) => node.receive(inbound?).await,
        Event::Command(command) => {
            match command {
                Command::Enqueue { packet, to, reply } => {
                    let _ = reply.send(node.enqueue(packet, to));
                }
                Command::Start => node.start(),
                Command::Stop => node.stop(),
                Command::AddAction { specification, action, reply } => {
                    let _ = reply.send(node.add_packet_action(specification, action));
                }
                Command::Identity(reply) => {
                    let _ = reply.send(node.identity());
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::node::tests::{FakeTransport, Recorder, clock_at, settings};
    use parking_lot::Mutex;
    use rf_protocol::Routing;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn spawn_fake(id: NodeId) -> (
        NodeHandle,
        JoinHandle<Result<(), NodeError>>,
        crate::sensor::node::tests::Sent,
        mpsc::UnboundedSender<Inbound>,
        Arc<Mutex<f64>>,
    ) {
        let (transport, sent, inbound) = FakeTransport::new(id);
        let time = Arc::new(Mutex::new(0.0));
        let node = SensorNode::new(
            &settings(id, 2),
            transport,
            Box::new(Recorder { received: Arc::default() }),
            clock_at(time.clone()),
        );
        let (handle, task) = spawn(node, Duration::from_millis(10));
        (handle, task, sent, inbound, time)
    }

    #[tokio::test(start_paused = true)]
    async fn handle_commands_reach_the_node() {
        let (handle, task, sent, _inbound, time) = spawn_fake(1);
        assert!(handle.identity().await.unwrap().joined);
        assert_err!(handle.add_packet_action("_secret", Box::new(|_| {})).await);
        assert_ok!(handle.add_packet_action("setting_ack", Box::new(|_| {})).await);
        assert!(matches!(
            handle.add_packet_action("setting_ack", Box::new(|_| {})).await,
            Err(NodeError::DuplicateAction(_))
        ));

        assert_ok!(handle.enqueue(Packet::with_specification("ping"), Some(2)).await);
        *time.lock() = 1.0;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sent.lock().len(), 1);

        handle.deactivate();
        assert_ok!(task.await.unwrap());
        assert!(handle.is_stopped());
        assert!(matches!(handle.enqueue(Packet::with_specification("late"), None).await, Err(NodeError::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_packets_trigger_actions() {
        let (handle, task, _sent, inbound, _time) = spawn_fake(1);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        handle
            .add_packet_action("setting_ack", Box::new(move |p| {
                let _ = ack_tx.send(p);
            }))
            .await
            .unwrap();

        let mut p = Packet::with_specification("setting_ack");
        p.stamp_routing(Routing { from: 0, to: Some(1), timestamp: 0.0 });
        inbound.send(Inbound { packet: p, rssi: None }).unwrap();
        let got = ack_rx.recv().await.unwrap();
        assert_eq!(got.specification(), Some(Specification::SettingAck));

        handle.deactivate();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_transport_error_ends_the_runner() {
        let (_handle, task, _sent, inbound, _time) = spawn_fake(2);
        // the fake reports Closed once its inbound side is gone
        drop(inbound);
        assert!(matches!(
            task.await.unwrap(),
            Err(NodeError::Transport(TransportError::Closed))
        ));
    }
}
