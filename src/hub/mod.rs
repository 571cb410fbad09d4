//! Real-time session event fan-out.
//!
//! The [`SessionHub`] keeps a registry of connected clients grouped into
//! per-session rooms and broadcasts typed envelopes to them. Transports
//! are abstract ([`ClientTransport`]) so the hub core stays free of any
//! HTTP/WebSocket framework; the flume-backed [`ChannelTransport`] serves
//! tests and in-process consumers.

mod envelope;
mod fanout;
mod transport;

pub use envelope::{Envelope, MessageType};
pub use fanout::{BroadcastReport, ConnectionInfo, HubStats, SessionDirectory, SessionHub};
pub use transport::{ChannelTransport, ClientTransport, TransportError};

/// Close code sent when a client joins an unknown session.
pub const CLOSE_UNKNOWN_SESSION: u16 = 4004;
