//! Codec contract between the connection layer and the per-protocol wire
//! formats.
//!
//! The connection variants never interpret packet bytes themselves; each
//! protocol plugs in an [`Encoder`]/[`Decoder`] pair (or a [`ChatDecoder`] for
//! the role-split chat protocol). The only thing the connection layer needs
//! from a codec besides the packet type is its failure mode: every recognized
//! malformed-input condition must surface as one of the [`CodecError`]
//! sentinels, which the receive loops treat as recoverable. Any other failure
//! is reported through a different channel (I/O, JSON, session errors) and is
//! fatal to the loop.

use bytes::BytesMut;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// The closed set of decode failures that leave the transport usable.
///
/// A decoder returning one of these must already have consumed the offending
/// bytes from its input so that the next decode attempt starts at a packet
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Declared packet length is out of the protocol's legal range.
    #[error("invalid packet size")]
    PacketSize,
    /// Packet checksum did not match its contents.
    #[error("invalid checksum")]
    Checksum,
    /// A fixed protocol constant (magic byte, version marker) had the wrong
    /// value.
    #[error("unexpected constant")]
    UnexpectedConst,
    /// The input ended before a full packet; for datagram transports this is
    /// final, for stream transports it means "read more".
    #[error("buffer too small")]
    BufferTooSmall,
}

/// Encodes one packet into caller-provided reusable storage.
pub trait Encoder: Send {
    /// The protocol's packet type.
    type Packet;

    /// Appends the wire encoding of `packet` to `dst`.
    ///
    /// The connection layer clears `dst` before each call; on success it
    /// writes `dst` to the transport as one unit.
    fn encode(&mut self, packet: &Self::Packet, dst: &mut BytesMut) -> Result<(), CodecError>;
}

/// Decodes packets from a reusable byte buffer.
pub trait Decoder: Send {
    /// The protocol's packet type.
    type Packet;

    /// Decodes exactly one packet from the front of `src`, consuming its
    /// bytes.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete packet.
    /// Stream connections respond by reading more bytes; the datagram
    /// connection, which cannot, converts it into the recoverable
    /// [`CodecError::BufferTooSmall`].
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Packet>, CodecError>;
}

/// Decoder for the chat protocol, whose packet layout differs by origin.
///
/// A server-side connection reads client-origin packets and vice versa; the
/// chat connection selects the entry point from its role.
pub trait ChatDecoder: Send {
    /// The protocol's packet type (covers both origins).
    type Packet;

    /// Decodes a packet that originated from a client.
    fn decode_client(&mut self, src: &mut BytesMut) -> Result<Option<Self::Packet>, CodecError>;

    /// Decodes a packet that originated from a server.
    fn decode_server(&mut self, src: &mut BytesMut) -> Result<Option<Self::Packet>, CodecError>;
}

/// Packet type carried by the message-framed (WebSocket/JSON) connection.
///
/// Framed packets are JSON documents with a command envelope around an inner
/// payload. The connection fires the whole packet first and then the payload
/// on its own, so subscribers can hook either the envelope or the specific
/// payload type.
pub trait FramedPacket: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The inner payload type fired as the secondary event.
    type Payload: Send + Sync + 'static;

    /// Borrows the inner payload.
    fn payload(&self) -> &Self::Payload;
}
