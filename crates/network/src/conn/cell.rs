//! Shared transport-slot plumbing behind every connection variant.
//!
//! The slot follows a reader-writer discipline: operations that *use* the
//! transport take the shared side and operations that *replace* it take the
//! exclusive side. Close runs under the shared side on purpose — it is the
//! supported way to interrupt a receive that is blocked while also holding
//! the shared side.
//!
//! Each installed transport carries a cancellation token (a "generation").
//! Closing cancels the token, which resolves any read blocked on that
//! generation to [`ConnError::Closed`]; replacing installs a fresh token with
//! the new transport. A cancelled token is never reset, so a reader can never
//! mistake an old, closed transport for a live one.

use crate::error::ConnError;
use crate::transport::Transport;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One installed transport plus the token that invalidates it.
pub(crate) struct Generation<T: ?Sized> {
    pub transport: Arc<T>,
    token: CancellationToken,
}

impl<T: ?Sized> Clone for Generation<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            token: self.token.clone(),
        }
    }
}

impl<T: ?Sized> Generation<T> {
    /// Runs `op` bounded by the optional soft deadline and by this
    /// generation's lifetime.
    ///
    /// Deadline expiry maps to [`io::ErrorKind::TimedOut`]; cancellation of
    /// the generation maps to [`ConnError::Closed`]. A zero deadline means
    /// no deadline.
    pub(crate) async fn drive<F, O>(&self, limit: Option<Duration>, op: F) -> Result<O, ConnError>
    where
        F: Future<Output = Result<O, ConnError>>,
    {
        let bounded = async {
            match limit {
                Some(limit) if !limit.is_zero() => tokio::time::timeout(limit, op)
                    .await
                    .unwrap_or_else(|_| Err(ConnError::Io(io::ErrorKind::TimedOut.into()))),
                _ => op.await,
            }
        };
        tokio::select! {
            _ = self.token.cancelled() => Err(ConnError::Closed),
            out = bounded => out,
        }
    }
}

/// The replaceable transport slot.
pub(crate) struct TransportCell<T: ?Sized> {
    slot: RwLock<Option<Generation<T>>>,
}

impl<T: Transport + ?Sized> TransportCell<T> {
    pub(crate) fn new(transport: Arc<T>) -> Self {
        Self {
            slot: RwLock::new(Some(Generation {
                transport,
                token: CancellationToken::new(),
            })),
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    /// The attached transport, if any. Shared lock only.
    pub(crate) async fn transport(&self) -> Option<Arc<T>> {
        self.slot
            .read()
            .await
            .as_ref()
            .map(|generation| generation.transport.clone())
    }

    /// The live generation, or [`ConnError::Closed`] when the slot is empty
    /// or the attached transport has already been closed.
    pub(crate) async fn current(&self) -> Result<Generation<T>, ConnError> {
        match self.slot.read().await.as_ref() {
            Some(generation) if !generation.token.is_cancelled() => Ok(generation.clone()),
            _ => Err(ConnError::Closed),
        }
    }

    /// Cancels the current generation and closes its transport.
    ///
    /// Runs under the shared lock so it can interleave with a blocked
    /// receive. Closing an empty slot is a no-op.
    pub(crate) async fn close(&self) -> Result<(), ConnError> {
        let slot = self.slot.read().await;
        match slot.as_ref() {
            Some(generation) => {
                generation.token.cancel();
                debug!("transport closed");
                generation.transport.close().await
            }
            None => Ok(()),
        }
    }

    /// Closes the current transport, then installs `transport` under the
    /// exclusive lock with a fresh generation.
    pub(crate) async fn replace(&self, transport: Arc<T>) {
        if let Err(err) = self.close().await {
            warn!("closing previous transport during replace failed: {err}");
        }
        let mut slot = self.slot.write().await;
        *slot = Some(Generation {
            transport,
            token: CancellationToken::new(),
        });
        debug!("transport replaced");
    }
}
