//! Chat-protocol stream connection.
//!
//! Same shape as [`StreamConn`](crate::conn::StreamConn) with two additions
//! the chat protocol requires: packets are laid out differently depending on
//! whether they originated from a client or a server, so the decode entry
//! point is selected by connection role; and the chat service enforces a
//! throughput ceiling, so the client side sends through a rate limiter.

use crate::codec::{ChatDecoder, Encoder};
use crate::conn::cell::TransportCell;
use crate::conn::{RunStart, RunStop};
use crate::error::{AsyncError, ConnError};
use crate::limiter::RateLimiter;
use crate::transport::StreamTransport;
use bytes::BytesMut;
use event_system::Emitter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::stream::READ_CHUNK_SIZE;

/// Which endpoint a packet originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Client,
    Server,
}

struct SendState<E> {
    encoder: E,
    buf: BytesMut,
}

struct RecvState<D> {
    decoder: D,
    buf: BytesMut,
    chunk: Box<[u8; READ_CHUNK_SIZE]>,
}

/// Thread-safe handle around a chat-protocol stream.
///
/// A server-side connection (accepted from a listener) reads client-origin
/// packets with [`run_server`](ChatConn::run_server); a client-side
/// connection (dialed out) reads server-origin packets with
/// [`run_client`](ChatConn::run_client) and sends through
/// [`send_limited`](ChatConn::send_limited) to stay under the service's
/// throughput ceiling.
///
/// All methods are safe for concurrent use except the `next_*packet` and
/// `run*` family, which assume a single logical reader.
pub struct ChatConn<E, D> {
    cell: TransportCell<dyn StreamTransport>,
    send: Mutex<SendState<E>>,
    recv: Mutex<RecvState<D>>,
    limiter: Mutex<RateLimiter>,
}

impl<E: Encoder, D: ChatDecoder> ChatConn<E, D> {
    /// Wraps an existing transport.
    pub fn new(transport: Arc<dyn StreamTransport>, encoder: E, decoder: D) -> Self {
        Self {
            cell: TransportCell::new(transport),
            send: Mutex::new(SendState {
                encoder,
                buf: BytesMut::new(),
            }),
            recv: Mutex::new(RecvState {
                decoder,
                buf: BytesMut::new(),
                chunk: Box::new([0; READ_CHUNK_SIZE]),
            }),
            limiter: Mutex::new(RateLimiter::new()),
        }
    }

    /// Creates a handle with no transport attached.
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
                chunk: Box::new([0; READ_CHUNK_SIZE]),
            }),
            limiter: Mutex::new(RateLimiter::new()),
        }
    }

    /// The attached transport, if any.
    pub async fn transport(&self) -> Option<Arc<dyn StreamTransport>> {
        self.cell.transport().await
    }

    /// Closes the current transport and starts using `transport` instead.
    pub async fn set_transport(&self, transport: Arc<dyn StreamTransport>) {
        self.cell.replace(transport).await;
    }

    /// Closes the connection. The supported way to abort a blocked receive
    /// from another task.
    pub async fn close(&self) -> Result<(), ConnError> {
        self.cell.close().await
    }

    /// Serializes `packet` into the reusable send buffer and writes it to the
    /// stream. Returns the number of bytes written.
    pub async fn send(&self, packet: &E::Packet) -> Result<usize, ConnError> {
        let generation = self.cell.current().await?;
        let mut state = self.send.lock().await;
        let state = &mut *state;

        state.buf.clear();
        state.encoder.encode(packet, &mut state.buf)?;
        generation.transport.write_all(&state.buf).await?;
        trace!(bytes = state.buf.len(), "chat packet sent");
        Ok(state.buf.len())
    }

    /// Sends `packet` through the rate limiter, sleeping out the pacing
    /// window from the previous rate-limited send first.
    ///
    /// The limiter lock is held across the send, so rate-limited senders are
    /// serialized among themselves. Pacing only delays, it never rejects.
    pub async fn send_limited(&self, packet: &E::Packet) -> Result<usize, ConnError> {
        let mut limiter = self.limiter.lock().await;
        limiter.wait_ready().await;
        let n = self.send(packet).await?;
        limiter.record_send(n);
        Ok(n)
    }

    /// Waits for the next client-origin packet. Used by server-side
    /// connections.
    ///
    /// Not safe for concurrent invocation: one logical reader per connection.
    pub async fn next_client_packet(
        &self,
        timeout: Option<Duration>,
    ) -> Result<D::Packet, ConnError> {
        self.next_from(timeout, Origin::Client).await
    }

    /// Waits for the next server-origin packet. Used by client-side
    /// connections.
    ///
    /// Not safe for concurrent invocation: one logical reader per connection.
    pub async fn next_server_packet(
        &self,
        timeout: Option<Duration>,
    ) -> Result<D::Packet, ConnError> {
        self.next_from(timeout, Origin::Server).await
    }

    async fn next_from(
        &self,
        timeout: Option<Duration>,
        origin: Origin,
    ) -> Result<D::Packet, ConnError> {
        let generation = self.cell.current().await?;
        let mut state = self.recv.lock().await;
        let state = &mut *state;

        generation
            .drive(timeout, async {
                loop {
                    let decoded = match origin {
                        Origin::Client => state.decoder.decode_client(&mut state.buf)?,
                        Origin::Server => state.decoder.decode_server(&mut state.buf)?,
                    };
                    if let Some(packet) = decoded {
                        return Ok(packet);
                    }
                    let n = generation.transport.read(&mut state.chunk[..]).await?;
                    if n == 0 {
                        return Err(ConnError::Closed);
                    }
                    state.buf.extend_from_slice(&state.chunk[..n]);
                }
            })
            .await
    }

    /// Reads client-origin packets until a fatal error and fires an event for
    /// each. For connections accepted on the server side.
    ///
    /// Not safe for concurrent invocation.
    pub async fn run_server(&self, events: &Emitter, timeout: Option<Duration>) -> ConnError
    where
        D::Packet: Send + Sync + 'static,
    {
        self.run_from(events, timeout, Origin::Client, "run_server[next_client_packet]")
            .await
    }

    /// Reads server-origin packets until a fatal error and fires an event for
    /// each. For connections dialed from the client side.
    ///
    /// Not safe for concurrent invocation.
    pub async fn run_client(&self, events: &Emitter, timeout: Option<Duration>) -> ConnError
    where
        D::Packet: Send + Sync + 'static,
    {
        self.run_from(events, timeout, Origin::Server, "run_client[next_server_packet]")
            .await
    }

    async fn run_from(
        &self,
        events: &Emitter,
        timeout: Option<Duration>,
        origin: Origin,
        src: &'static str,
    ) -> ConnError
    where
        D::Packet: Send + Sync + 'static,
    {
        events.fire(&RunStart);
        debug!(?origin, "chat receive loop started");
        loop {
            match self.next_from(timeout, origin).await {
                Ok(packet) => events.fire(&packet),
                Err(err) if err.is_recoverable() => {
                    warn!("recoverable decode failure: {err}");
                    events.fire(&AsyncError::new(src, err));
                }
                Err(err) => {
                    debug!(?origin, "chat receive loop stopped: {err}");
                    events.fire(&RunStop);
                    return err;
                }
            }
        }
    }
}
