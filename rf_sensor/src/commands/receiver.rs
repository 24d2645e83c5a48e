// Target side of the settings protocol
use super::settings::{SettingsStore, same_kind};
use super::{ack_packet, done_ack_packet};
use crate::errors::NodeError;
use crate::sensor::NodeHandle;
use rf_protocol::{GROUND_STATION_ID, NodeId, Packet, PacketError, Specification, Value};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Stages incoming items and commits them to the settings file on `done`.
#[derive(Debug)]
pub struct SettingsReceiver {
    id: NodeId,
    store: SettingsStore,
    staged: BTreeMap<usize, (String, Value)>,
    // (failed, next_index) of the last done, repeated when done is retried
    last_done: Option<(Vec<usize>, usize)>,
}

impl SettingsReceiver {
    pub fn new(id: NodeId, store: SettingsStore) -> Self {
        Self { id, store, staged: BTreeMap::new(), last_done: None }
    }

    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    /// Applies one protocol packet and returns the ack to send back, if any.
    pub fn handle(&mut self, packet: &Packet) -> Result<Option<Packet>, PacketError> {
        let ack = match packet.specification() {
            Some(Specification::SettingClear) => {
                self.staged.clear();
                self.last_done = None;
                ack_packet(self.id, 0)?
            }
            Some(Specification::SettingAdd) => {
                let index = usize::try_from(packet.get_i64("index")?).map_err(|_| {
                    PacketError::TypeMismatch { key: "index".into(), expected: "item index" }
                })?;
                let key = packet.get_str("key")?.to_string();
                let value = packet
                    .get("value")
                    .cloned()
                    .ok_or_else(|| PacketError::Missing("value".into()))?;
                self.staged.insert(index, (key, value));
                ack_packet(self.id, index + 1)?
            }
            Some(Specification::SettingDone) => {
                let (failed, count) = match &self.last_done {
                    Some(outcome) if self.staged.is_empty() => {
                        debug!(failed = ?outcome.0, "done repeated; answering with the last outcome");
                        outcome.clone()
                    }
                    _ => {
                        let outcome = self.commit();
                        self.last_done = Some(outcome.clone());
                        outcome
                    }
                };
                done_ack_packet(self.id, count, &failed)?
            }
            _ => return Ok(None),
        };
        Ok(Some(ack))
    }

    /// Validates every staged item and writes them all, or none.
    fn commit(&mut self) -> (Vec<usize>, usize) {
        let staged = std::mem::take(&mut self.staged);
        let count = staged.keys().next_back().map_or(0, |last| last + 1);

        let current = match self.store.current() {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "current settings unreadable");
                return ((0..count).collect(), count);
            }
        };
        let failed: Vec<usize> = (0..count)
            .filter(|index| match staged.get(index) {
                Some((key, value)) => !current.get(key).is_some_and(|old| same_kind(old, value)),
                None => true,
            })
            .collect();
        if !failed.is_empty() {
            warn!(?failed, "settings rejected");
            return (failed, count);
        }

        let items: Vec<(String, Value)> = staged.into_values().collect();
        if items.is_empty() {
            return (failed, count);
        }
        if let Err(e) = self.store.merge(&items) {
            error!(error = %e, "writing settings failed");
            return ((0..count).collect(), count);
        }
        info!(count, "settings updated; restart the node to apply them");
        (failed, count)
    }
}

/// Registers the settings actions on `node` and answers them from a background task.
pub async fn spawn_settings_receiver(
    node: NodeHandle,
    mut receiver: SettingsReceiver,
) -> Result<JoinHandle<()>, NodeError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
    for specification in [
        Specification::SettingClear,
        Specification::SettingAdd,
        Specification::SettingDone,
    ] {
        let tx = tx.clone();
        node.add_packet_action(
            specification,
            Box::new(move |packet| {
                let _ = tx.send(packet);
            }),
        )
        .await?;
    }
    drop(tx);

    Ok(tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            let ack = match receiver.handle(&packet) {
                Ok(Some(ack)) => ack,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "malformed settings packet");
                    continue;
                }
            };
            if let Err(e) = node.enqueue(ack, Some(GROUND_STATION_ID)).await {
                warn!(error = %e, "settings ack not queued");
                if matches!(e, NodeError::Stopped) {
                    break;
                }
            }
        }
    }))
}
