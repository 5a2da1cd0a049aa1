//! Message-framed WebSocket connection.
//!
//! Carries JSON-encoded packets, one per text message. Because the payload of
//! a framed packet identifies the command it carries, a successfully decoded
//! packet fires twice: once as the whole packet and once as its inner
//! payload, letting subscribers hook whichever level they care about.

use crate::codec::FramedPacket;
use crate::conn::cell::TransportCell;
use crate::conn::{RunStart, RunStop};
use crate::error::{AsyncError, ConnError};
use crate::transport::FramedTransport;
use event_system::Emitter;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

/// Thread-safe handle around a message-framed link speaking JSON packets.
///
/// All methods are safe for concurrent use except
/// [`next_packet`](FramedConn::next_packet) and [`run`](FramedConn::run),
/// which assume a single logical reader.
pub struct FramedConn<P> {
    cell: TransportCell<dyn FramedTransport>,
    send: Mutex<()>,
    recv: Mutex<()>,
    _packet: PhantomData<fn() -> P>,
}

impl<P: FramedPacket> FramedConn<P> {
    /// Wraps an existing transport.
    pub fn new(transport: Arc<dyn FramedTransport>) -> Self {
        Self {
            cell: TransportCell::new(transport),
            send: Mutex::new(()),
            recv: Mutex::new(()),
            _packet: PhantomData,
        }
    }

    /// Creates a handle with no transport attached.
    pub fn empty() -> Self {
        Self {
            cell: TransportCell::empty(),
            send: Mutex::new(()),
            recv: Mutex::new(()),
            _packet: PhantomData,
        }
    }

    /// The attached transport, if any.
    pub async fn transport(&self) -> Option<Arc<dyn FramedTransport>> {
        self.cell.transport().await
    }

    /// Closes the current transport and starts using `transport` instead.
    pub async fn set_transport(&self, transport: Arc<dyn FramedTransport>) {
        self.cell.replace(transport).await;
    }

    /// Closes the connection. The supported way to abort a blocked receive
    /// from another task.
    pub async fn close(&self) -> Result<(), ConnError> {
        self.cell.close().await
    }

    /// Serializes `packet` to JSON and sends it as exactly one outbound text
    /// message.
    ///
    /// The send lock keeps concurrent sends from interleaving; the framed
    /// transport reports no byte count.
    pub async fn send(&self, packet: &P) -> Result<(), ConnError> {
        let generation = self.cell.current().await?;
        let _send = self.send.lock().await;

        let text = serde_json::to_string(packet)?;
        generation.transport.send_text(text).await?;
        trace!("framed packet sent");
        Ok(())
    }

    /// Waits for the next inbound message (bounded by the optional soft
    /// deadline) and decodes one packet from it. Any remainder of the frame
    /// is discarded.
    ///
    /// Keepalive frames are skipped. A close frame from the peer surfaces as
    /// [`ConnError::SessionClosed`] carrying the close code.
    ///
    /// Not safe for concurrent invocation: one logical reader per connection.
    pub async fn next_packet(&self, timeout: Option<Duration>) -> Result<P, ConnError> {
        let generation = self.cell.current().await?;
        let _recv = self.recv.lock().await;

        generation
            .drive(timeout, async {
                loop {
                    match generation.transport.next_frame().await {
                        None => return Err(ConnError::Closed),
                        Some(Err(err)) => return Err(ConnError::Ws(err)),
                        Some(Ok(Message::Text(text))) => {
                            return Ok(serde_json::from_str(&text)?)
                        }
                        Some(Ok(Message::Binary(data))) => {
                            return Ok(serde_json::from_slice(&data)?)
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Err(ConnError::SessionClosed(frame))
                        }
                        // Ping/pong keepalives carry no packet.
                        Some(Ok(_)) => continue,
                    }
                }
            })
            .await
    }

    /// Reads packets until a fatal error and fires events for each.
    ///
    /// Fires [`RunStart`] on entry; per decoded packet, the packet itself
    /// followed by its inner payload; an [`AsyncError`] per recoverable JSON
    /// decode failure; and [`RunStop`] before returning the fatal error.
    ///
    /// Not safe for concurrent invocation.
    pub async fn run(&self, events: &Emitter, timeout: Option<Duration>) -> ConnError {
        events.fire(&RunStart);
        debug!("framed receive loop started");
        loop {
            match self.next_packet(timeout).await {
                Ok(packet) => {
                    events.fire(&packet);
                    events.fire(packet.payload());
                }
                Err(err) if err.is_recoverable() => {
                    warn!("recoverable decode failure: {err}");
                    events.fire(&AsyncError::new("run[next_packet]", err));
                }
                Err(err) => {
                    debug!("framed receive loop stopped: {err}");
                    events.fire(&RunStop);
                    return err;
                }
            }
        }
    }
}
