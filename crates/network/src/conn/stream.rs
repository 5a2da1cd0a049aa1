//! Generic connection-oriented stream connection.
//!
//! Wraps a byte stream (TCP in production) and a binary codec. Incoming bytes
//! accumulate in a reusable buffer; the decoder is asked for a packet after
//! every read until it produces one.

use crate::codec::{Decoder, Encoder};
use crate::conn::cell::TransportCell;
use crate::conn::{RunStart, RunStop};
use crate::error::{AsyncError, ConnError};
use crate::transport::StreamTransport;
use bytes::BytesMut;
use event_system::Emitter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Size of the chunk read from the stream when the decoder needs more bytes.
pub const READ_CHUNK_SIZE: usize = 4096;

struct SendState<E> {
    encoder: E,
    buf: BytesMut,
}

struct RecvState<D> {
    decoder: D,
    buf: BytesMut,
    chunk: Box<[u8; READ_CHUNK_SIZE]>,
}

/// Thread-safe handle around a byte stream speaking packets of one protocol.
///
/// All methods are safe for concurrent use except
/// [`next_packet`](StreamConn::next_packet) and [`run`](StreamConn::run),
/// which assume a single logical reader.
pub struct StreamConn<E, D> {
    cell: TransportCell<dyn StreamTransport>,
    send: Mutex<SendState<E>>,
    recv: Mutex<RecvState<D>>,
}

impl<E: Encoder, D: Decoder> StreamConn<E, D> {
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
    /// stream as one contiguous write. Returns the number of bytes written.
    pub async fn send(&self, packet: &E::Packet) -> Result<usize, ConnError> {
        let generation = self.cell.current().await?;
        let mut state = self.send.lock().await;
        let state = &mut *state;

        state.buf.clear();
        state.encoder.encode(packet, &mut state.buf)?;
        generation.transport.write_all(&state.buf).await?;
        trace!(bytes = state.buf.len(), "stream packet sent");
        Ok(state.buf.len())
    }

    /// Waits for the next packet (bounded by the optional soft deadline).
    ///
    /// Not safe for concurrent invocation: one logical reader per connection.
    pub async fn next_packet(&self, timeout: Option<Duration>) -> Result<D::Packet, ConnError> {
        let generation = self.cell.current().await?;
        let mut state = self.recv.lock().await;
        let state = &mut *state;

        generation
            .drive(timeout, async {
                loop {
                    if let Some(packet) = state.decoder.decode(&mut state.buf)? {
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

    /// Reads packets until a fatal error and fires an event for each.
    ///
    /// Fires [`RunStart`] on entry, each decoded packet, an [`AsyncError`]
    /// per recoverable decode failure, and [`RunStop`] before returning the
    /// fatal error.
    ///
    /// Not safe for concurrent invocation.
    pub async fn run(&self, events: &Emitter, timeout: Option<Duration>) -> ConnError
    where
        D::Packet: Send + Sync + 'static,
    {
        events.fire(&RunStart);
        debug!("stream receive loop started");
        loop {
            match self.next_packet(timeout).await {
                Ok(packet) => events.fire(&packet),
                Err(err) if err.is_recoverable() => {
                    warn!("recoverable decode failure: {err}");
                    events.fire(&AsyncError::new("run[next_packet]", err));
                }
                Err(err) => {
                    debug!("stream receive loop stopped: {err}");
                    events.fire(&RunStop);
                    return err;
                }
            }
        }
    }
}
