//! Direct transport abstraction
//!
//! The core never establishes a point-to-point link itself; an external
//! capability does that. These traits are the seam: [`PeerConnector`] turns
//! offer/answer descriptions into channels, [`DirectChannel`] carries frames
//! once a link exists. Implementors must provide ordered, reliable,
//! message-based delivery. [`crate::mock`] provides the in-memory
//! implementation used by tests and simulations.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors from transport operations.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("no pending negotiation with {0}")]
    NoPendingNegotiation(String),
}

/// Opaque local/remote session description produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Description(pub String);

/// Opaque trickle candidate produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Candidate(pub String);

/// One message on a direct channel. Text frames carry the transfer
/// protocol's control messages, binary frames carry raw file chunks.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// Payload size in bytes, as counted against the outstanding-write volume.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A channel to a single peer once negotiation has produced a link.
#[async_trait]
pub trait DirectChannel: Send + Sync {
    /// Send a frame to the peer.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Receive the next frame. `None` means the link is closed or failed;
    /// there is no distinction the core cares about.
    async fn recv(&self) -> Option<Frame>;

    /// Bytes written but not yet acknowledged by the transport. Drives the
    /// sender's backpressure wait.
    fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Factory turning negotiation descriptions into channels.
///
/// One call per state-machine action: the initiator uses `create_offer` and
/// `apply_answer`, the responder uses `accept_offer`, both feed trickle
/// candidates through `add_candidate`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Start an outbound link. Returns our channel and the offer to relay.
    async fn create_offer(
        &self,
        peer_id: &str,
    ) -> Result<(Arc<dyn DirectChannel>, Description), TransportError>;

    /// Accept an inbound offer. Returns our channel and the answer to relay.
    async fn accept_offer(
        &self,
        peer_id: &str,
        offer: &Description,
    ) -> Result<(Arc<dyn DirectChannel>, Description), TransportError>;

    /// Complete an outbound link after the peer's answer arrives.
    async fn apply_answer(
        &self,
        peer_id: &str,
        answer: &Description,
    ) -> Result<Arc<dyn DirectChannel>, TransportError>;

    /// Apply a trickle candidate. Only called once the matching description
    /// is in place; buffering until then is the state machine's job.
    async fn add_candidate(
        &self,
        peer_id: &str,
        candidate: &Candidate,
    ) -> Result<(), TransportError>;
}

// Blanket impl so Arc-wrapped channels can be used directly.

#[async_trait]
impl<T: DirectChannel + ?Sized> DirectChannel for Arc<T> {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        (**self).send(frame).await
    }

    async fn recv(&self) -> Option<Frame> {
        (**self).recv().await
    }

    fn buffered_amount(&self) -> usize {
        (**self).buffered_amount()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn close(&self) {
        (**self).close().await
    }
}
