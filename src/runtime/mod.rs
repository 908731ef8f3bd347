//! Readiness-driven runtime for the relay.
//!
//! - `Connection`: buffered endpoint with its lifecycle state machine
//! - `ConnectionRegistry`: slab of connections owned by one reactor
//! - `Context`: what a handler sees during a callback
//! - `Reactor`: turns mio readiness into handler chain events

mod connection;
mod context;
mod event_loop;
mod stats;
mod token;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnId, ConnState, Connection, ConnectionRegistry, Origin};
pub use context::Context;
pub use stats::{ProxyStats, StatsSnapshot};

pub(crate) use event_loop::Reactor;
pub(crate) use token::{TokenKind, LISTENER_TOKEN, WAKER_TOKEN};

use std::time::Duration;

/// Tuning knobs for one listener and its reactor.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Connections the reactor holds at once, inbound and outbound.
    pub max_connections: usize,
    /// Size of the scratch buffer used for each socket read.
    pub buffer_size: usize,
    /// Readiness events fetched per poll.
    pub batch_size: usize,
    /// Reads pause once a connection and its peer hold this many
    /// unforwarded bytes.
    pub max_pending_bytes: usize,
    /// Deadline for outbound connects.
    pub connect_timeout: Duration,
    /// Close connections with no I/O for this long. `None` disables it.
    pub idle_timeout: Option<Duration>,
    /// Bind with `SO_REUSEPORT` so several workers can share the port.
    pub reuse_port: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            buffer_size: 16 * 1024,
            batch_size: 1024,
            max_pending_bytes: 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: None,
            reuse_port: false,
        }
    }
}
