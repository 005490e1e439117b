use bytes::Bytes;
use tokio::{
    io::AsyncWriteExt,
    net::tcp::OwnedWriteHalf,
    sync::mpsc::{UnboundedSender, unbounded_channel},
};

/// Per-connection writer mailbox.
///
/// Connection records are shared through the registry, so fan-out and anon
/// relay originate from tasks that do not own the stream. Each connection
/// owns its write half behind a channel: senders push wire-ready frames
/// and the owning task writes them serially, so one frame is never
/// interleaved with another.
#[derive(Debug, Clone)]
pub struct Outbox(UnboundedSender<Bytes>);

impl Outbox {
    /// Takes ownership of the write half and spawns the drain task. The
    /// task ends once every sender is gone or the peer stops reading.
    pub fn start(mut writer: OwnedWriteHalf) -> Self {
        let (tx, mut rx) = unbounded_channel::<Bytes>();

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        Self(tx)
    }

    /// Queues one frame. A failure means the connection is already gone;
    /// its own teardown handles the registry.
    pub fn push(&self, frame: Bytes) -> bool {
        self.0.send(frame).is_ok()
    }
}
