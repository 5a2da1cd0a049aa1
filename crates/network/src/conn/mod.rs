//! Connection handles: one per transport shape.
//!
//! Four variants share one mental model — a replaceable transport behind a
//! reader-writer discipline, a locked send path, a single-reader receive
//! path, and a run loop that turns received packets into events:
//!
//! - [`DatagramConn`] — connectionless, addressed per send, LAN broadcast
//! - [`StreamConn`] — generic connection-oriented stream
//! - [`ChatConn`] — chat-protocol stream with a client/server role split and
//!   an outbound rate limiter
//! - [`FramedConn`] — message-framed WebSocket carrying JSON packets
//!
//! Every public operation is safe to call from any number of tasks except
//! `next_*packet` and `run*`, which assume a single logical reader per
//! connection.

use std::net::SocketAddr;

mod cell;
pub mod chat;
pub mod datagram;
pub mod framed;
pub mod stream;

pub use chat::ChatConn;
pub use datagram::{DatagramConn, BROADCAST_ADDR, DATAGRAM_BUFFER_SIZE};
pub use framed::FramedConn;
pub use stream::{StreamConn, READ_CHUNK_SIZE};

/// Marker event fired once when a receive loop enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStart;

/// Marker event fired once when a receive loop exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStop;

/// A decoded packet together with the address it came from.
///
/// Fired by the datagram connection instead of the bare packet, since on a
/// connectionless transport the source address is part of the information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketFrom<P> {
    /// The decoded packet.
    pub packet: P,
    /// Source address of the datagram it was decoded from.
    pub addr: SocketAddr,
}
