//! Connectionless datagram connection.
//!
//! Used by the LAN game-discovery protocol: every send names its destination,
//! broadcasts go to a fixed well-known address, and each received datagram is
//! decoded as exactly one packet.

use crate::codec::{CodecError, Decoder, Encoder};
use crate::conn::cell::TransportCell;
use crate::conn::{PacketFrom, RunStart, RunStop};
use crate::error::{AsyncError, ConnError};
use crate::transport::{DatagramTransport, UdpTransport};
use bytes::BytesMut;
use event_system::Emitter;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Well-known LAN broadcast destination for game discovery.
pub const BROADCAST_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, 6112));

/// Fixed size of the datagram read buffer. Larger datagrams are truncated by
/// the socket and will fail to decode.
pub const DATAGRAM_BUFFER_SIZE: usize = 2048;

struct SendState<E> {
    encoder: E,
    buf: BytesMut,
}

struct RecvState<D> {
    decoder: D,
    buf: BytesMut,
    scratch: Box<[u8; DATAGRAM_BUFFER_SIZE]>,
}

/// Thread-safe handle around a datagram socket speaking packets of one
/// protocol.
///
/// All methods are safe for concurrent use except
/// [`next_packet`](DatagramConn::next_packet) and [`run`](DatagramConn::run),
/// which assume a single logical reader.
pub struct DatagramConn<E, D> {
    cell: TransportCell<dyn DatagramTransport>,
    send: Mutex<SendState<E>>,
    recv: Mutex<RecvState<D>>,
}

impl<E: Encoder, D: Decoder> DatagramConn<E, D> {
    /// Wraps an existing transport.
    pub fn new(transport: Arc<dyn DatagramTransport>, encoder: E, decoder: D) -> Self {
        Self {
            cell: TransportCell::new(transport),
            send: Mutex::new(SendState {
                encoder,
                buf: BytesMut::new(),
            }),
            recv: Mutex::new(RecvState {
                decoder,
                buf: BytesMut::new(),
                scratch: Box::new([0; DATAGRAM_BUFFER_SIZE]),
            }),
        }
    }

    /// Creates a handle with no transport attached. Every transport-needing
    /// operation fails with [`ConnError::Closed`] until
    /// [`set_transport`](DatagramConn::set_transport) is called.
    pub fn empty(encoder: E, decoder: D) -> Self {
        Self {
            cell: TransportCell::empty(),
            send: Mutex::new(SendState {
                encoder,
                buf: BytesMut::new(),
            }),
            recv: Mutex::new(RecvState {
                decoder,
                buf: BytesMut::new(),
                scratch: Box::new([0; DATAGRAM_BUFFER_SIZE]),
            }),
        }
    }

    /// Binds a broadcast-capable socket to `addr` and wraps it.
    pub async fn bind(addr: SocketAddr, encoder: E, decoder: D) -> io::Result<Self> {
        let transport = UdpTransport::bind(addr)?;
        Ok(Self::new(Arc::new(transport), encoder, decoder))
    }

    /// The attached transport, if any.
    pub async fn transport(&self) -> Option<Arc<dyn DatagramTransport>> {
        self.cell.transport().await
    }

    /// Closes the current transport and starts using `transport` instead.
    ///
    /// A receive blocked on the old transport resolves to
    /// [`ConnError::Closed`].
    pub async fn set_transport(&self, transport: Arc<dyn DatagramTransport>) {
        self.cell.replace(transport).await;
    }

    /// Closes the connection. The supported way to abort a blocked receive
    /// from another task.
    pub async fn close(&self) -> Result<(), ConnError> {
        self.cell.close().await
    }

    /// Serializes `packet` into the reusable send buffer and sends it to
    /// `dest` as one datagram. Returns the number of bytes sent.
    ///
    /// Concurrent sends are serialized by the send-buffer lock, so packets
    /// never interleave on the wire.
    pub async fn send(&self, packet: &E::Packet, dest: SocketAddr) -> Result<usize, ConnError> {
        let generation = self.cell.current().await?;
        let mut state = self.send.lock().await;
        let state = &mut *state;

        state.buf.clear();
        state.encoder.encode(packet, &mut state.buf)?;
        let n = generation.transport.send_to(&state.buf, dest).await?;
        trace!(bytes = n, dest = %dest, "datagram sent");
        Ok(n)
    }

    /// Sends `packet` to the LAN broadcast address.
    pub async fn broadcast(&self, packet: &E::Packet) -> Result<usize, ConnError> {
        self.send(packet, BROADCAST_ADDR).await
    }

    /// Waits for the next datagram (bounded by the optional soft deadline)
    /// and decodes it. Returns the packet and its source address.
    ///
    /// Not safe for concurrent invocation: one logical reader per connection.
    pub async fn next_packet(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(D::Packet, SocketAddr), ConnError> {
        let generation = self.cell.current().await?;
        let mut state = self.recv.lock().await;
        let state = &mut *state;

        generation
            .drive(timeout, async {
                let (len, addr) = generation
                    .transport
                    .recv_from(&mut state.scratch[..])
                    .await?;
                state.buf.clear();
                state.buf.extend_from_slice(&state.scratch[..len]);
                match state.decoder.decode(&mut state.buf)? {
                    Some(packet) => Ok((packet, addr)),
                    // A datagram is all we get; an incomplete packet can
                    // never be completed by reading more.
                    None => Err(ConnError::Codec(CodecError::BufferTooSmall)),
                }
            })
            .await
    }

    /// Reads packets until a fatal error and fires an event for each.
    ///
    /// Fires [`RunStart`] on entry, a [`PacketFrom`] per decoded datagram, an
    /// [`AsyncError`] per recoverable decode failure, and [`RunStop`] before
    /// returning the fatal error.
    ///
    /// Not safe for concurrent invocation.
    pub async fn run(&self, events: &Emitter, timeout: Option<Duration>) -> ConnError
    where
        D::Packet: Send + Sync + 'static,
    {
        events.fire(&RunStart);
        debug!("datagram receive loop started");
        loop {
            match self.next_packet(timeout).await {
                Ok((packet, addr)) => {
                    trace!(addr = %addr, "datagram packet received");
                    events.fire(&PacketFrom { packet, addr });
                }
                Err(err) if err.is_recoverable() => {
                    warn!("recoverable decode failure: {err}");
                    events.fire(&AsyncError::new("run[next_packet]", err));
                }
                Err(err) => {
                    debug!("datagram receive loop stopped: {err}");
                    events.fire(&RunStop);
                    return err;
                }
            }
        }
    }
}
