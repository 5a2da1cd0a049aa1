//! # Meridian Network Core
//!
//! Transport layer of the Meridian emulated game-network stack. Wraps raw
//! sockets for three wire protocols — UDP datagrams for LAN discovery, TCP
//! streams for the game and chat protocols, WebSocket messages for the
//! JSON-framed chat gateway — into uniform, task-safe connection handles.
//!
//! ## Key Components
//!
//! - [`conn`] - The four connection variants and their receive loops
//! - [`codec`] - The contract a per-protocol codec must satisfy to plug in
//! - [`error`] - Error taxonomy and the classification helpers a reconnect
//!   policy needs
//! - [`limiter`] - Outbound pacing for the chat protocol
//! - [`transport`] - Transport traits and their tokio-backed implementations
//!
//! ## The Mental Model
//!
//! Every connection handle owns a replaceable transport and drives the same
//! cycle: read, decode, fire an event. A malformed packet is routine on a
//! heterogeneous network and must not kill a long-lived stream, so decode
//! failures are reported through the event path and the loop keeps going;
//! transport failures terminate the loop and propagate to the owner, who
//! inspects them with the [`error`] classifiers to decide between reconnect
//! and shutdown.
//!
//! Events are fired through an [`event_system::Emitter`] supplied by the
//! caller; this crate never implements subscribers.

pub mod codec;
pub mod conn;
pub mod error;
pub mod limiter;
pub mod transport;

pub use codec::{ChatDecoder, CodecError, Decoder, Encoder, FramedPacket};
pub use conn::{
    ChatConn, DatagramConn, FramedConn, PacketFrom, RunStart, RunStop, StreamConn,
    BROADCAST_ADDR, DATAGRAM_BUFFER_SIZE, READ_CHUNK_SIZE,
};
pub use error::{
    is_conn_closed_error, is_conn_refused_error, is_temporary_error, is_timeout_error,
    unnest_error, AsyncError, ConnError, Transience,
};
pub use limiter::{pacing_delay, RateLimiter};
pub use transport::{
    DatagramTransport, FramedTransport, StreamTransport, TcpTransport, Transport, UdpTransport,
    WsStream, WsTransport,
};
