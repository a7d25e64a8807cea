//! Peer-to-peer side of peerdrop
//!
//! Everything an endpoint needs once a relay exists:
//!
//! - **Transport seam**: [`transport`] defines the [`DirectChannel`] and
//!   [`PeerConnector`] traits the external link-establishment capability
//!   implements; [`mock`] is the in-memory implementation tests use.
//! - **Negotiation**: [`negotiation`] is the per-peer offer/answer/candidate
//!   state machine. It does no I/O and returns actions to execute.
//! - **Transfer**: [`transfer`] frames, flow-controls and reassembles one
//!   file per channel per direction.
//! - **Endpoint**: [`endpoint`] ties the three together behind a relay
//!   WebSocket connection.

pub mod endpoint;
pub mod mock;
pub mod negotiation;
pub mod transfer;
pub mod transport;

pub use endpoint::{Endpoint, EndpointError, EndpointEvent};
pub use negotiation::{NegotiationSession, SessionAction, SessionState, SignalPayload};
pub use transfer::{
    send_file, send_name, ControlFrame, FileMeta, ReceivedFile, TransferError, TransferEvent,
    TransferReceiver, BACKPRESSURE_POLL, CHUNK_SIZE, MAX_BUFFERED,
};
pub use transport::{Candidate, Description, DirectChannel, Frame, PeerConnector, TransportError};
