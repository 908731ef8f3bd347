//! Relay pair handler.
//!
//! Every accepted connection gets an outbound connection to a fixed forward
//! target. The two are attached to each other once the outbound connect
//! completes, and from then on bytes flow through untouched in both
//! directions. Input that arrives before pairing stays buffered on the
//! client connection and is replayed right after the attach.

use crate::error::RelayError;
use crate::handler::{Capabilities, Flow, Handler, HandlerResult};
use crate::runtime::{Context, Origin};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::{debug, warn};

/// Forwards each accepted connection to `target`.
#[derive(Debug, Clone)]
pub struct RelayHandler {
    target: SocketAddr,
}

impl RelayHandler {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }

    /// Resolve `host:port` once, up front.
    pub fn resolve(host: &str, port: u16) -> Result<Self, RelayError> {
        let target = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}:{port}"))
        })?;
        Ok(Self::new(target))
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl Handler for RelayHandler {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::CONNECT | Capabilities::DATA | Capabilities::DISCONNECT
    }

    fn on_connect(&self, ctx: &mut Context<'_>) -> HandlerResult {
        let id = ctx.id();

        match ctx.connection().origin() {
            Origin::Accepted => {
                ctx.suspend_data();
                if let Err(err) = ctx.connect(self.target) {
                    ctx.stats().forward_failed();
                    warn!(conn_id = id, error = %err, "Forward connect failed, closing client");
                    ctx.close(id);
                }
            }
            Origin::Dialed { by, .. } => {
                let requested = ctx.get(by).and_then(|c| c.pending_dial()) == Some(id);
                if requested && ctx.pair(by, id) {
                    ctx.resume_data(by);
                } else {
                    debug!(conn_id = id, client = by, "Client gone before forward connect completed");
                    ctx.close(id);
                }
            }
        }

        Ok(Flow::Terminate)
    }

    fn on_data(&self, ctx: &mut Context<'_>) -> HandlerResult {
        let forwarded = ctx.with_peer(|conn, peer| {
            let data = conn.read_available();
            peer.write(&data)
        });

        match forwarded {
            // Not paired yet: leave the bytes buffered.
            None => {}
            Some(Ok(len)) => ctx.stats().add_forwarded(len),
            Some(Err(err)) => debug!(conn_id = ctx.id(), error = %err, "Dropping data for closed peer"),
        }

        Ok(Flow::Terminate)
    }

    fn on_disconnect(&self, ctx: &mut Context<'_>) -> HandlerResult {
        let id = ctx.id();

        if let Some(peer) = ctx.unpair(id) {
            ctx.close_after_flush(peer);
        } else if let Some(dial) = ctx.connection().pending_dial() {
            ctx.close(dial);
        } else if let Origin::Dialed { by, target } = ctx.connection().origin() {
            // Only a dial that never paired takes its client down from here.
            if ctx.get(by).and_then(|c| c.pending_dial()) == Some(id) {
                match ctx.disconnect_reason() {
                    Some(reason) => {
                        warn!(conn_id = by, %target, error = %reason, "Forward connection failed, closing client")
                    }
                    None => debug!(conn_id = by, %target, "Forward connection closed before pairing"),
                }
                ctx.close(by);
            }
        }

        Ok(Flow::Continue)
    }
}
