//! Transport error taxonomy and classification.
//!
//! Everything the connection layer can fail with is collapsed into
//! [`ConnError`]; its [`is_recoverable`](ConnError::is_recoverable) split is
//! what keeps receive loops alive across malformed packets while still letting
//! transport death propagate. The free functions below answer the questions a
//! reconnect policy asks about a returned error — is it a timeout, is it
//! temporary, did the peer close or refuse the connection — and are total over
//! arbitrary error values, including values produced by foreign crates and
//! errors that carry numeric codes from a non-native platform.

use std::error::Error;
use std::fmt;
use std::io;
use thiserror::Error as ThisError;
use tokio_tungstenite::tungstenite::{
    self,
    error::ProtocolError,
    protocol::{frame::coding::CloseCode, CloseFrame},
};

use crate::codec::CodecError;

/// Errors produced by the connection layer.
#[derive(Debug, ThisError)]
pub enum ConnError {
    /// No transport is attached, or the attached transport has been closed.
    ///
    /// This is the synchronous answer every transport-needing operation gives
    /// on an empty handle, and the error a blocked receive resolves to when
    /// another task closes or replaces the transport out from under it.
    #[error("connection closed")]
    Closed,

    /// A binary-protocol decoder rejected the input. Recoverable: the
    /// transport is still usable, only this packet was lost.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    /// JSON decode failure on the message-framed connection. Recoverable for
    /// structural and type mismatches, fatal for I/O-level failures.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer closed the message-framed session. Carries the close frame so
    /// handshake rejections can be told apart from ordinary closes.
    #[error("session closed by peer: {0:?}")]
    SessionClosed(Option<CloseFrame>),

    /// Message-framed transport failure below the session layer.
    #[error("websocket: {0}")]
    Ws(#[from] tungstenite::Error),

    /// Stream or datagram transport failure, including an expired receive
    /// deadline (surfaced as [`io::ErrorKind::TimedOut`]).
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl ConnError {
    /// Whether a receive loop may keep consuming the stream after this error.
    ///
    /// Only decode-time failures qualify: the codec sentinel set for the
    /// binary protocols, and structural/type errors from JSON for the framed
    /// protocol. Everything else means the transport is dead.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ConnError::Codec(_) => true,
            ConnError::Json(err) => matches!(
                err.classify(),
                serde_json::error::Category::Syntax | serde_json::error::Category::Data
            ),
            _ => false,
        }
    }
}

/// A recoverable error surfaced through the event path instead of a return
/// value, tagged with the call site that produced it.
#[derive(Debug)]
pub struct AsyncError {
    /// Name of the operation that produced the error.
    pub src: &'static str,
    /// The underlying cause.
    pub err: Box<dyn Error + Send + Sync>,
}

impl AsyncError {
    /// Wraps `err` with a source tag.
    pub fn new(src: &'static str, err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self {
            src,
            err: err.into(),
        }
    }
}

impl fmt::Display for AsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.src, self.err)
    }
}

impl Error for AsyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        let err: &(dyn Error + 'static) = self.err.as_ref();
        Some(err)
    }
}

/// Self-reported transience, the capability the classifier queries before
/// falling back to structural checks.
///
/// Error kinds that know whether they leave the transport usable implement
/// this; anything else gets the default answers.
pub trait Transience {
    /// Whether the failed operation may be retried on the same transport.
    fn is_temporary(&self) -> bool {
        false
    }

    /// Whether the error was caused by an expired deadline.
    fn is_timeout(&self) -> bool {
        false
    }
}

impl Transience for CodecError {
    fn is_temporary(&self) -> bool {
        true
    }
}

impl Transience for ConnError {
    fn is_temporary(&self) -> bool {
        self.is_recoverable() || self.is_timeout()
    }

    fn is_timeout(&self) -> bool {
        matches!(
            self,
            ConnError::Io(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
        )
    }
}

impl Transience for AsyncError {
    fn is_temporary(&self) -> bool {
        let err: &(dyn Error + 'static) = self.err.as_ref();
        is_temporary_error(err)
    }

    fn is_timeout(&self) -> bool {
        let err: &(dyn Error + 'static) = self.err.as_ref();
        is_timeout_error(err)
    }
}

/// `ECONNREFUSED` in Windows error numbering.
pub const WSAECONNREFUSED: i32 = 10061;
/// `ECONNABORTED` in Windows error numbering.
pub const WSAECONNABORTED: i32 = 10053;
/// `ECONNRESET` in Windows error numbering.
pub const WSAECONNRESET: i32 = 10054;
/// `ENOTCONN` in Windows error numbering.
pub const WSAENOTCONN: i32 = 10057;
/// `ESHUTDOWN` in Windows error numbering.
pub const WSAESHUTDOWN: i32 = 10058;

/// Raw OS codes that indicate a closed connection, in both native and Windows
/// numbering. Errors that crossed a process or platform boundary keep their
/// original numbers, so both sets must classify correctly on any host.
const CONN_CLOSED_CODES: [i32; 9] = [
    libc::ECONNABORTED,
    libc::ECONNRESET,
    libc::ENOTCONN,
    libc::ESHUTDOWN,
    libc::EPIPE,
    WSAECONNABORTED,
    WSAECONNRESET,
    WSAENOTCONN,
    WSAESHUTDOWN,
];

const CONN_REFUSED_CODES: [i32; 2] = [libc::ECONNREFUSED, WSAECONNREFUSED];

/// Follows the `source()` chain to the innermost cause.
///
/// Identity for errors without a source.
pub fn unnest_error<'a>(err: &'a (dyn Error + 'static)) -> &'a (dyn Error + 'static) {
    let mut err = err;
    while let Some(source) = err.source() {
        err = source;
    }
    err
}

/// Iterates the error and every cause below it, outermost first.
fn error_chain<'a>(
    err: &'a (dyn Error + 'static),
) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    std::iter::successors(Some(err), |&err| err.source())
}

fn transience_of<'a>(err: &'a (dyn Error + 'static)) -> Option<&'a dyn Transience> {
    if let Some(err) = err.downcast_ref::<AsyncError>() {
        return Some(err);
    }
    if let Some(err) = err.downcast_ref::<ConnError>() {
        return Some(err);
    }
    if let Some(err) = err.downcast_ref::<CodecError>() {
        return Some(err);
    }
    None
}

fn io_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Whether `err` self-reports as a timeout.
///
/// Queries the [`Transience`] capability on the error itself, then on its
/// innermost cause; I/O errors report through their [`io::ErrorKind`].
pub fn is_timeout_error(err: &(dyn Error + 'static)) -> bool {
    if let Some(transience) = transience_of(err) {
        return transience.is_timeout();
    }
    if let Some(err) = err.downcast_ref::<io::Error>() {
        return io_timeout(err);
    }

    let root = unnest_error(err);
    if let Some(transience) = transience_of(root) {
        return transience.is_timeout();
    }
    root.downcast_ref::<io::Error>().is_some_and(io_timeout)
}

/// Whether `err` self-reports as temporary, falling back to timeout
/// classification for errors without the capability.
pub fn is_temporary_error(err: &(dyn Error + 'static)) -> bool {
    if let Some(transience) = transience_of(err) {
        return transience.is_temporary();
    }
    let root = unnest_error(err);
    if let Some(transience) = transience_of(root) {
        return transience.is_temporary();
    }
    if let Some(err) = root.downcast_ref::<io::Error>() {
        if err.kind() == io::ErrorKind::Interrupted {
            return true;
        }
    }
    is_timeout_error(err)
}

fn link_indicates_closed(err: &(dyn Error + 'static)) -> bool {
    if let Some(err) = err.downcast_ref::<ConnError>() {
        return matches!(err, ConnError::Closed | ConnError::SessionClosed(_));
    }
    if let Some(err) = err.downcast_ref::<tungstenite::Error>() {
        return matches!(
            err,
            tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed
                | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)
        );
    }
    if let Some(err) = err.downcast_ref::<io::Error>() {
        if matches!(
            err.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::NotConnected
                | io::ErrorKind::BrokenPipe
        ) {
            return true;
        }
        if let Some(code) = err.raw_os_error() {
            return CONN_CLOSED_CODES.contains(&code);
        }
    }
    false
}

/// Whether `err` indicates the connection is closed.
///
/// Covers the layer's own closed/session-closed conditions, end-of-stream,
/// the abort/reset/shutdown/broken-pipe family of OS codes (native and
/// Windows numbering), and the framed transport's closed-session errors.
pub fn is_conn_closed_error(err: &(dyn Error + 'static)) -> bool {
    error_chain(err).any(link_indicates_closed)
}

fn link_indicates_refused(err: &(dyn Error + 'static)) -> bool {
    if let Some(ConnError::SessionClosed(Some(frame))) = err.downcast_ref::<ConnError>() {
        // A session torn down during establishment: TLS handshake failure or
        // a mandatory extension the server would not negotiate.
        return matches!(frame.code, CloseCode::Tls | CloseCode::Extension);
    }
    if let Some(err) = err.downcast_ref::<io::Error>() {
        if err.kind() == io::ErrorKind::ConnectionRefused {
            return true;
        }
        if let Some(code) = err.raw_os_error() {
            return CONN_REFUSED_CODES.contains(&code);
        }
    }
    false
}

/// Whether `err` indicates the peer refused the connection.
pub fn is_conn_refused_error(err: &(dyn Error + 'static)) -> bool {
    error_chain(err).any(link_indicates_refused)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    fn os_error(code: i32) -> ConnError {
        ConnError::Io(io::Error::from_raw_os_error(code))
    }

    fn close_frame(code: CloseCode) -> ConnError {
        ConnError::SessionClosed(Some(CloseFrame {
            code,
            reason: "".into(),
        }))
    }

    #[test]
    fn unnest_reaches_innermost_cause() {
        let root = io::Error::from_raw_os_error(libc::ECONNRESET);
        let nested = AsyncError::new("run[next_packet]", ConnError::Io(root));

        let inner = unnest_error(&nested);
        let inner = inner.downcast_ref::<io::Error>().expect("io root");
        assert_eq!(inner.raw_os_error(), Some(libc::ECONNRESET));
    }

    #[test]
    fn unnested_borrow_stays_usable_alongside_further_walks() {
        let err = AsyncError::new("send", os_error(libc::EPIPE));

        // The returned borrow is tied to the error, not to the walk, so it
        // survives later chain traversals over the same value.
        let root = unnest_error(&err);
        assert!(is_conn_closed_error(&err));
        assert_eq!(
            root.downcast_ref::<io::Error>()
                .and_then(io::Error::raw_os_error),
            Some(libc::EPIPE)
        );
    }

    #[test]
    fn unnest_is_identity_without_sources() {
        let err = ConnError::Closed;
        assert!(unnest_error(&err).downcast_ref::<ConnError>().is_some());
    }

    #[test]
    fn closed_codes_classify_as_closed() {
        for code in CONN_CLOSED_CODES {
            assert!(is_conn_closed_error(&os_error(code)), "code {code}");
        }
        assert!(is_conn_closed_error(&ConnError::Closed));
        assert!(is_conn_closed_error(&ConnError::Io(
            io::ErrorKind::UnexpectedEof.into()
        )));
        assert!(is_conn_closed_error(&ConnError::Ws(
            tungstenite::Error::ConnectionClosed
        )));
        assert!(is_conn_closed_error(&close_frame(CloseCode::Normal)));
    }

    #[test]
    fn closed_classification_sees_through_wrappers() {
        let err = AsyncError::new("send", os_error(WSAECONNRESET));
        assert!(is_conn_closed_error(&err));
    }

    #[test]
    fn refused_codes_classify_as_refused() {
        assert!(is_conn_refused_error(&os_error(libc::ECONNREFUSED)));
        assert!(is_conn_refused_error(&os_error(WSAECONNREFUSED)));
        assert!(is_conn_refused_error(&ConnError::Io(
            io::ErrorKind::ConnectionRefused.into()
        )));
    }

    #[test]
    fn handshake_rejection_close_codes_classify_as_refused() {
        assert!(is_conn_refused_error(&close_frame(CloseCode::Tls)));
        assert!(is_conn_refused_error(&close_frame(CloseCode::Extension)));
        // An ordinary close is closed, not refused.
        assert!(!is_conn_refused_error(&close_frame(CloseCode::Normal)));
        assert!(is_conn_closed_error(&close_frame(CloseCode::Tls)));
    }

    #[test]
    fn unrelated_errors_classify_as_nothing() {
        let err = ConnError::Io(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        assert!(!is_conn_closed_error(&err));
        assert!(!is_conn_refused_error(&err));
        assert!(!is_timeout_error(&err));
        assert!(!is_temporary_error(&err));
    }

    #[test]
    fn deadline_expiry_is_a_timeout() {
        let err = ConnError::Io(io::ErrorKind::TimedOut.into());
        assert!(is_timeout_error(&err));
        assert!(is_temporary_error(&err));
        assert!(!is_conn_closed_error(&err));
    }

    #[test]
    fn codec_errors_are_temporary_but_not_timeouts() {
        let err = ConnError::Codec(CodecError::Checksum);
        assert!(is_temporary_error(&err));
        assert!(!is_timeout_error(&err));
        assert!(err.is_recoverable());
    }

    #[test]
    fn async_wrapper_delegates_transience() {
        let err = AsyncError::new("run[next_packet]", ConnError::Codec(CodecError::PacketSize));
        assert!(err.is_temporary());
        assert!(!err.is_timeout());

        let timeout = AsyncError::new(
            "run[next_packet]",
            ConnError::Io(io::ErrorKind::TimedOut.into()),
        );
        assert!(timeout.is_timeout());
    }

    #[test]
    fn json_structural_errors_are_recoverable() {
        let err: serde_json::Error = serde_json::from_str::<u32>("not json").unwrap_err();
        assert!(ConnError::Json(err).is_recoverable());

        let err: serde_json::Error = serde_json::from_str::<u32>("\"a string\"").unwrap_err();
        assert!(ConnError::Json(err).is_recoverable());
    }

    #[test]
    fn json_eof_is_fatal() {
        let err: serde_json::Error = serde_json::from_str::<u32>("").unwrap_err();
        assert!(!ConnError::Json(err).is_recoverable());
    }
}
