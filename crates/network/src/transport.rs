//! Transport traits and their tokio-backed implementations.
//!
//! A connection handle owns its transport as a trait object, so tests plug in
//! recording doubles and production code plugs in the real sockets defined
//! here: [`UdpTransport`] for the datagram variant, [`TcpTransport`] for the
//! stream variants, and [`WsTransport`] for the message-framed variant.
//!
//! All methods take `&self`; the connection layer's lock discipline decides
//! which of them may actually run concurrently.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Base capability every transport shares: it can be shut down.
///
/// `close` must wake any task blocked on the transport; the connection handle
/// relies on that to make closing the supported way to cancel a blocked
/// receive.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Shuts the transport down. Idempotence is not required; closing twice
    /// may return an error.
    async fn close(&self) -> Result<(), crate::error::ConnError>;
}

/// A connectionless datagram socket, addressed per send.
#[async_trait]
pub trait DatagramTransport: Transport {
    /// Receives one datagram and its source address into `buf`.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Sends `buf` as one datagram to `dest`.
    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize>;

    /// Local address the socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// A connection-oriented byte stream.
#[async_trait]
pub trait StreamTransport: Transport {
    /// Reads up to `buf.len()` bytes; `Ok(0)` means end of stream.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes all of `buf` to the stream.
    async fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    /// Local address of the stream.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Remote address of the stream.
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// A message-framed link: each read or write is one discrete message.
#[async_trait]
pub trait FramedTransport: Transport {
    /// Sends `text` as exactly one outbound text message.
    async fn send_text(&self, text: String) -> Result<(), tungstenite::Error>;

    /// Waits for the next inbound frame; `None` means end of stream.
    async fn next_frame(&self) -> Option<Result<Message, tungstenite::Error>>;
}

// ============================================================================
// UDP
// ============================================================================

/// [`DatagramTransport`] over a tokio UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Wraps an already-bound socket.
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }

    /// Binds a broadcast-capable socket to `addr`.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        debug!(addr = %socket.local_addr()?, "datagram socket bound");
        Ok(Self { socket })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn close(&self) -> Result<(), crate::error::ConnError> {
        // Datagram sockets reject shutdown unless connected; the descriptor
        // itself is released when the owning generation is dropped.
        let _ = SockRef::from(&self.socket).shutdown(Shutdown::Both);
        Ok(())
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, dest).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

// ============================================================================
// TCP
// ============================================================================

/// [`StreamTransport`] over a tokio TCP stream.
///
/// Reads and writes go through the readiness API so that both sides work
/// through `&self`; shutdown of both directions makes a blocked read observe
/// end of stream.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Wraps an established stream.
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Connects to `addr`.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        debug!(peer = %addr, "stream connected");
        Ok(Self { stream })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn close(&self) -> Result<(), crate::error::ConnError> {
        SockRef::from(&self.stream)
            .shutdown(Shutdown::Both)
            .map_err(crate::error::ConnError::Io)
    }
}

#[async_trait]
impl StreamTransport for TcpTransport {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut remaining = buf;
        while !remaining.is_empty() {
            self.stream.writable().await?;
            match self.stream.try_write(remaining) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => remaining = &remaining[n..],
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

// ============================================================================
// WebSocket
// ============================================================================

/// The WebSocket stream type produced by connecting or accepting over TCP.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`FramedTransport`] over a tokio-tungstenite WebSocket.
///
/// The socket is split so that sends and receives proceed independently; each
/// half sits behind its own lock, which doubles as the single-writer /
/// single-reader discipline the WebSocket protocol requires.
pub struct WsTransport<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps a WebSocket after its handshake has completed.
    pub fn new(ws: WebSocketStream<S>) -> Arc<Self> {
        let (sink, stream) = ws.split();
        Arc::new(Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        })
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn close(&self) -> Result<(), crate::error::ConnError> {
        // Skip the close frame when a send is in flight; cancellation of the
        // owning generation already unblocks the reader.
        if let Ok(mut sink) = self.sink.try_lock() {
            match sink.send(Message::Close(None)).await {
                Ok(())
                | Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => {}
                Err(err) => return Err(crate::error::ConnError::Ws(err)),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S> FramedTransport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_text(&self, text: String) -> Result<(), tungstenite::Error> {
        self.sink.lock().await.send(Message::Text(text.into())).await
    }

    async fn next_frame(&self) -> Option<Result<Message, tungstenite::Error>> {
        self.stream.lock().await.next().await
    }
}
