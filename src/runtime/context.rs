//! Per-event view of the reactor handed to handler callbacks.
//!
//! Handlers cannot re-enter the chain. Anything that must produce further
//! events (a close, a resumed data stream) is recorded in `Pending` and run
//! by the reactor once the current dispatch returns.

use crate::error::RelayError;
use crate::runtime::connection::{ConnId, Connection, ConnectionRegistry};
use crate::runtime::stats::ProxyStats;
use mio::net::TcpStream;
use mio::Registry;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Work produced while dispatching, drained by the reactor.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    /// Connections that closed and still need their disconnect event.
    pub disconnects: VecDeque<(ConnId, Option<RelayError>)>,
    /// Connections whose buffered input should be dispatched as data.
    pub data: VecDeque<ConnId>,
    /// Connections whose socket should be read again.
    pub reads: VecDeque<ConnId>,
    /// Connections that may have new outbound bytes to flush.
    pub touched: Vec<ConnId>,
}

/// Access to one connection and its neighbours during a callback.
pub struct Context<'a> {
    id: ConnId,
    connections: &'a mut ConnectionRegistry,
    registry: &'a Registry,
    pending: &'a mut Pending,
    connect_timeout: Duration,
    reason: Option<&'a RelayError>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        id: ConnId,
        connections: &'a mut ConnectionRegistry,
        registry: &'a Registry,
        pending: &'a mut Pending,
        connect_timeout: Duration,
        reason: Option<&'a RelayError>,
    ) -> Self {
        Self {
            id,
            connections,
            registry,
            pending,
            connect_timeout,
            reason,
        }
    }

    /// Id of the connection the event is for.
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn connection(&self) -> &Connection {
        &self.connections[self.id]
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        self.pending.touched.push(self.id);
        &mut self.connections[self.id]
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.pending.touched.push(id);
        self.connections.get_mut(id)
    }

    /// The connection this one is attached to, if any.
    pub fn peer(&self) -> Option<&Connection> {
        self.connection()
            .attachment()
            .and_then(|peer| self.connections.get(peer))
    }

    /// Run `f` with this connection and its attached peer borrowed together.
    pub fn with_peer<R>(&mut self, f: impl FnOnce(&mut Connection, &mut Connection) -> R) -> Option<R> {
        let peer = self.connection().attachment()?;
        self.pending.touched.push(self.id);
        self.pending.touched.push(peer);
        let (conn, peer) = self.connections.get2_mut(self.id, peer)?;
        Some(f(conn, peer))
    }

    /// Why the connection went away. Only set for disconnect events.
    pub fn disconnect_reason(&self) -> Option<&RelayError> {
        self.reason
    }

    pub fn stats(&self) -> &ProxyStats {
        self.connections.stats()
    }

    /// Start a non-blocking connect to `target` on behalf of this connection.
    ///
    /// The new connection receives a connect event once the handshake
    /// completes, or a disconnect event if it fails or times out.
    pub fn connect(&mut self, target: SocketAddr) -> Result<ConnId, RelayError> {
        let stream = TcpStream::connect(target)
            .map_err(|source| RelayError::ForwardConnect { target, source })?;
        let by = self.id;
        let deadline = Instant::now() + self.connect_timeout;
        let capacity = self.connections.capacity();

        let dial = self
            .connections
            .insert_with(|id| Connection::dialed(id, stream, by, target, deadline))
            .ok_or(RelayError::ConnectionLimit(capacity))?;

        if let Err(source) = self.connections[dial].register(self.registry) {
            self.connections.close(dial, self.registry);
            return Err(RelayError::ForwardConnect { target, source });
        }

        self.connections[by].set_pending_dial(Some(dial));
        debug!(conn_id = by, dial, %target, "Dialing forward target");
        Ok(dial)
    }

    /// Attach `a` and `b` to each other. See `ConnectionRegistry::pair`.
    pub fn pair(&mut self, a: ConnId, b: ConnId) -> bool {
        self.connections.pair(a, b)
    }

    /// Clear the pair `id` belongs to, returning the former peer.
    pub fn unpair(&mut self, id: ConnId) -> Option<ConnId> {
        self.connections.unpair(id)
    }

    /// Close `id` now, dropping its pending writes.
    ///
    /// Safe to call on the connection being dispatched and on connections
    /// that are already closed.
    pub fn close(&mut self, id: ConnId) {
        if self.connections.close(id, self.registry) {
            self.pending.disconnects.push_back((id, None));
        }
    }

    /// Close `id` once its pending writes have been flushed.
    pub fn close_after_flush(&mut self, id: ConnId) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        if conn.begin_closing() {
            self.close(id);
        } else {
            self.pending.touched.push(id);
        }
    }

    /// Hold back data events for this connection; input keeps buffering.
    pub fn suspend_data(&mut self) {
        self.connections[self.id].set_data_suspended(true);
    }

    /// Release data events for `id` and replay whatever was buffered.
    pub fn resume_data(&mut self, id: ConnId) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.set_data_suspended(false);
            self.pending.data.push_back(id);
        }
    }
}
