// logging/packets.rs: CSV trace of every packet a node sends or accepts
use chrono::Utc;
use rf_protocol::{NodeId, Packet};
use std::path::Path;
use tokio::sync::Mutex;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
};
use tracing::warn;

const HEADER: &str = "ts,direction,specification,peer,bytes\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Tx => "tx",
            Direction::Rx => "rx",
        }
    }
}

#[derive(Debug)]
pub struct PacketLog {
    file: Mutex<BufWriter<fs::File>>,
}

impl PacketLog {
    /// Opens `path` for appending, writing the header when the file is new.
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let fresh = !fs::try_exists(path).await.unwrap_or(false);
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        let mut writer = BufWriter::new(file);
        if fresh {
            writer.write_all(HEADER.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok(Self { file: Mutex::new(writer) })
    }

    /// `peer` is the destination for sent packets and the origin for received ones.
    pub async fn record(&self, direction: Direction, packet: &Packet, peer: Option<NodeId>) {
        let spec = packet.specification().map(|s| s.to_string()).unwrap_or_default();
        let bytes = packet.serialize().map(|b| b.len()).unwrap_or(0);
        let peer = peer.map(|p| p.to_string()).unwrap_or_else(|| "*".into());
        let line = format!(
            "{},{},{spec},{peer},{bytes}\n",
            Utc::now().to_rfc3339(),
            direction.as_str()
        );

        let mut f = self.file.lock().await;
        if let Err(e) = f.write_all(line.as_bytes()).await {
            warn!(error = %e, "packet log write failed");
            return;
        }
        let _ = f.flush().await;
    }
}
