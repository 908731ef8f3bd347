//! Error types for the relay.
//!
//! Transport failures never take a separate path through the reactor: they
//! are carried as the reason of a disconnect event. The variants here are
//! what handlers and callers get to see.

use crate::handler::Event;
use crate::runtime::ConnId;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by handler callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the relay runtime.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listener could not acquire its address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// An operation was attempted on a connection that is closing or closed.
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnId),

    /// The outbound connection to the forward target failed or timed out.
    #[error("connect to forward target {target} failed: {source}")]
    ForwardConnect {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A handler callback returned an error during dispatch.
    #[error("handler `{handler}` failed on {event} for connection {conn_id}: {source}")]
    Handler {
        handler: &'static str,
        event: Event,
        conn_id: ConnId,
        #[source]
        source: BoxError,
    },

    /// No I/O was seen on the connection for the configured period.
    #[error("connection idle for more than {0:?}")]
    IdleTimeout(Duration),

    /// The reactor refused a connection because it is full.
    #[error("connection limit of {0} reached")]
    ConnectionLimit(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Whether this error came from the transport closing underneath us
    /// rather than from a local decision.
    pub fn is_transport(&self) -> bool {
        matches!(self, RelayError::Io(_) | RelayError::ForwardConnect { .. })
    }
}
