//! Core state and wire types for the peerdrop relay network.
//!
//! This crate has no I/O of its own. It defines:
//! - the JSON envelopes exchanged between endpoints and the relay
//! - the [`Registry`] that tracks live endpoints and room membership
//!
//! Every registry mutation returns the list of notifications to deliver;
//! dispatching them over live sockets is the relay's job. That split keeps
//! membership logic testable without a transport.

pub mod protocol;
pub mod registry;

pub use protocol::{ClientMessage, DeviceInfo, FileAnnouncement, ServerMessage};
pub use registry::{generate_room_code, EndpointId, Outbound, Registry};
