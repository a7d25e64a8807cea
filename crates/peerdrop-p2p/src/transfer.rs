//! Chunked file transfer over a direct channel
//!
//! Two message kinds share one channel: textual control frames (`meta`
//! opens a transfer, `name` announces identity) and raw binary data frames.
//! Framing relies entirely on the preceding `meta` frame's declared size —
//! data frames carry no header.
//!
//! The transfer is a best-effort stream, not request/response: the sender is
//! done when its last chunk is written and never waits for an
//! acknowledgment. There is no checksum and no resume; a transport that
//! closes mid-transfer simply discards the session.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::transport::{DirectChannel, Frame, TransportError};

/// Fixed chunk size for data frames.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Outstanding-write volume above which the sender pauses.
pub const MAX_BUFFERED: usize = 1024 * 1024;

/// How often a paused sender re-checks the outstanding volume.
pub const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);

/// Metadata announcing one file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

/// Control frames, sent as JSON text on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Precedes a transfer's data frames.
    Meta(FileMeta),
    /// Out-of-band identity announcement, sent on channel open and rename.
    Name { name: String },
}

impl ControlFrame {
    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        Ok(Frame::Text(serde_json::to_string(self)?))
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no open channel to send on")]
    NoChannel,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("control frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A fully reassembled inbound file.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFile {
    pub meta: FileMeta,
    pub bytes: Bytes,
}

/// What one inbound frame produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// A `meta` frame opened a session.
    Started(FileMeta),
    /// Percent complete after a data frame, `received * 100 / size`.
    Progress(u8),
    /// Received bytes match the declared size exactly. Fires once.
    Completed(ReceivedFile),
    /// The peer announced a display name.
    PeerRenamed(String),
}

/// Send one file over a channel: a `meta` control frame followed by
/// fixed-size chunks. Before each chunk the sender waits, in
/// [`BACKPRESSURE_POLL`] steps, for the channel's outstanding-write volume
/// to drop to [`MAX_BUFFERED`] or below — only this send task suspends.
/// Completion is local; there is no receiver acknowledgment.
pub async fn send_file<F>(
    channel: &dyn DirectChannel,
    meta: &FileMeta,
    data: &[u8],
    mut on_progress: F,
) -> Result<(), TransferError>
where
    F: FnMut(u8),
{
    if !channel.is_open() {
        return Err(TransferError::NoChannel);
    }
    channel.send(ControlFrame::Meta(meta.clone()).to_frame()?).await?;

    let mut sent: u64 = 0;
    for chunk in data.chunks(CHUNK_SIZE) {
        while channel.buffered_amount() > MAX_BUFFERED {
            tokio::time::sleep(BACKPRESSURE_POLL).await;
        }
        channel.send(Frame::Binary(Bytes::copy_from_slice(chunk))).await?;
        sent += chunk.len() as u64;
        on_progress(progress_pct(sent, meta.size));
    }
    Ok(())
}

/// Announce a display name on an open channel.
pub async fn send_name(channel: &dyn DirectChannel, name: &str) -> Result<(), TransferError> {
    channel
        .send(
            ControlFrame::Name {
                name: name.to_string(),
            }
            .to_frame()?,
        )
        .await?;
    Ok(())
}

fn progress_pct(done: u64, total: u64) -> u8 {
    if total == 0 {
        100
    } else {
        (done * 100 / total) as u8
    }
}

struct InboundTransfer {
    meta: FileMeta,
    received: u64,
    chunks: Vec<Bytes>,
}

/// Receive side of the protocol for one channel.
///
/// At most one session is open at a time; a new `meta` frame discards an
/// incomplete predecessor. Data frames that reference no open session —
/// stale frames after a reset, cross-talk after a transport swap — are
/// discarded.
#[derive(Default)]
pub struct TransferReceiver {
    current: Option<InboundTransfer>,
}

impl TransferReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// Feed one inbound frame; returns the events it produced, in order.
    pub fn handle_frame(&mut self, frame: Frame) -> Vec<TransferEvent> {
        match frame {
            Frame::Text(text) => match serde_json::from_str::<ControlFrame>(&text) {
                Ok(ControlFrame::Meta(meta)) => self.open_session(meta),
                Ok(ControlFrame::Name { name }) => vec![TransferEvent::PeerRenamed(name)],
                Err(err) => {
                    debug!("ignoring unparseable control frame: {}", err);
                    Vec::new()
                }
            },
            Frame::Binary(chunk) => self.append(chunk),
        }
    }

    /// The transport closed: discard any open session, delivering nothing.
    pub fn abort(&mut self) {
        if let Some(session) = self.current.take() {
            debug!(
                "discarding transfer of {} at {}/{} bytes",
                session.meta.name, session.received, session.meta.size
            );
        }
    }

    fn open_session(&mut self, meta: FileMeta) -> Vec<TransferEvent> {
        if let Some(prev) = self.current.take() {
            debug!(
                "new transfer {} displaces incomplete {} ({}/{} bytes)",
                meta.name, prev.meta.name, prev.received, prev.meta.size
            );
        }
        let mut events = vec![TransferEvent::Started(meta.clone())];
        if meta.size == 0 {
            // nothing to wait for
            events.push(TransferEvent::Completed(ReceivedFile {
                meta,
                bytes: Bytes::new(),
            }));
            return events;
        }
        self.current = Some(InboundTransfer {
            meta,
            received: 0,
            chunks: Vec::new(),
        });
        events
    }

    fn append(&mut self, chunk: Bytes) -> Vec<TransferEvent> {
        let (received, declared) = match self.current.as_mut() {
            Some(session) => {
                session.received += chunk.len() as u64;
                session.chunks.push(chunk);
                (session.received, session.meta.size)
            }
            None => {
                debug!("discarding {}-byte data frame with no open session", chunk.len());
                return Vec::new();
            }
        };
        if received > declared {
            // exact-size completion can never fire now; the stream is corrupt
            if let Some(session) = self.current.take() {
                debug!(
                    "transfer of {} overshot declared size ({} > {}), discarding",
                    session.meta.name, received, declared
                );
            }
            return Vec::new();
        }

        let mut events = vec![TransferEvent::Progress(progress_pct(received, declared))];
        if received == declared {
            if let Some(session) = self.current.take() {
                let mut bytes = Vec::with_capacity(declared as usize);
                for chunk in &session.chunks {
                    bytes.extend_from_slice(chunk);
                }
                events.push(TransferEvent::Completed(ReceivedFile {
                    meta: session.meta,
                    bytes: Bytes::from(bytes),
                }));
            }
        }
        events
    }
}
