//! mio event loop core.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls and turn the results into
//! handler chain events. Uses epoll on Linux, kqueue on macOS.
//!
//! Every readiness event is followed by a drain of the `Pending` queues, so
//! the closes, replays, and flushes a handler asks for all happen within the
//! same tick as the event that caused them.

use crate::error::RelayError;
use crate::handler::{Event, HandlerChain, Outcome};
use crate::runtime::connection::{ConnId, ConnState, Connection, ConnectionRegistry, Origin};
use crate::runtime::context::{Context, Pending};
use crate::runtime::stats::ProxyStats;
use crate::runtime::ProxySettings;
use mio::net::TcpStream;
use mio::Registry;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Connection state and dispatch for one listener.
///
/// Owns every connection and the handler chain; the poller itself stays with
/// the listener and is passed in by reference.
pub(crate) struct Reactor {
    connections: ConnectionRegistry,
    chain: HandlerChain,
    pending: Pending,
    scratch: Vec<u8>,
    settings: ProxySettings,
}

impl Reactor {
    pub fn new(chain: HandlerChain, settings: ProxySettings, stats: Arc<ProxyStats>) -> Self {
        Self {
            connections: ConnectionRegistry::new(settings.max_connections, stats),
            chain,
            pending: Pending::default(),
            scratch: vec![0u8; settings.buffer_size],
            settings,
        }
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn init(&mut self) {
        self.chain.init();
    }

    pub fn destroy(&mut self) {
        self.chain.destroy();
    }

    /// Take ownership of an accepted stream and fire its connect event.
    pub fn accept(
        &mut self,
        registry: &Registry,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<ConnId, RelayError> {
        let id = self
            .connections
            .insert_with(|id| Connection::accepted(id, stream, peer_addr))
            .ok_or(RelayError::ConnectionLimit(self.connections.capacity()))?;

        if let Err(e) = self.connections[id].register(registry) {
            self.connections.close(id, registry);
            return Err(e.into());
        }

        self.dispatch(registry, id, Event::Connect, None);
        self.drain(registry);
        Ok(id)
    }

    /// Handle a readiness event for a connection.
    pub fn handle_event(&mut self, registry: &Registry, id: ConnId, event: &mio::event::Event) {
        let state = match self.connections.get(id) {
            Some(conn) => conn.state(),
            None => return,
        };

        match state {
            ConnState::Closed => return,
            ConnState::Connecting => {
                if !self.complete_connect(registry, id) {
                    self.drain(registry);
                    return;
                }
            }
            ConnState::Open | ConnState::Closing => {}
        }

        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.read(registry, id);
        }

        if event.is_writable() {
            self.write(registry, id);
        }

        self.drain(registry);
    }

    /// Finish an outbound connect. Returns `true` once the connection is open.
    fn complete_connect(&mut self, registry: &Registry, id: ConnId) -> bool {
        let conn = &mut self.connections[id];
        match conn.finish_connect() {
            Ok(false) => false,
            Ok(true) => {
                debug!(conn_id = id, peer = %conn.peer_addr(), "Outbound connection established");
                if let Err(e) = conn.sync_interest(registry) {
                    self.close_with(registry, id, Some(e.into()));
                    return false;
                }
                self.dispatch(registry, id, Event::Connect, None);
                !self.connections[id].is_closed()
            }
            Err(source) => {
                let target = dial_target(conn);
                self.connections.stats().forward_failed();
                self.close_with(registry, id, Some(RelayError::ForwardConnect { target, source }));
                false
            }
        }
    }

    /// Bytes `id` may still buffer before reads pause: its own inbound
    /// backlog plus what its peer has not yet sent.
    fn read_budget(&self, id: ConnId) -> usize {
        let Some(conn) = self.connections.get(id) else {
            return 0;
        };
        let peer_backlog = conn
            .attachment()
            .and_then(|peer| self.connections.get(peer))
            .map_or(0, |peer| peer.pending_writes());
        self.settings
            .max_pending_bytes
            .saturating_sub(conn.available() + peer_backlog)
    }

    fn read(&mut self, registry: &Registry, id: ConnId) {
        if !self
            .connections
            .get(id)
            .is_some_and(|c| c.is_open() && !c.is_eof_pending())
        {
            return;
        }

        let budget = self.read_budget(id);
        let conn = &mut self.connections[id];
        if budget == 0 {
            conn.set_read_paused(true);
            return;
        }

        match conn.fill(&mut self.scratch, budget) {
            Ok(outcome) => {
                conn.set_read_paused(outcome.paused);
                if conn.is_data_suspended() {
                    if outcome.eof {
                        // Close after the buffered input has been replayed.
                        debug!(conn_id = id, buffered = conn.available(), "Peer closed connection, deferring close");
                        conn.set_eof_pending();
                    }
                    return;
                }
                if outcome.read > 0 {
                    self.dispatch(registry, id, Event::Data, None);
                }
                if outcome.eof {
                    debug!(conn_id = id, "Peer closed connection");
                    self.close_with(registry, id, None);
                }
            }
            Err(e) => {
                debug!(conn_id = id, error = %e, "Connection error");
                self.close_with(registry, id, Some(e.into()));
            }
        }
    }

    fn write(&mut self, registry: &Registry, id: ConnId) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        if !matches!(conn.state(), ConnState::Open | ConnState::Closing) {
            return;
        }

        if let Err(e) = conn.flush() {
            debug!(conn_id = id, error = %e, "Connection error");
            self.close_with(registry, id, Some(e.into()));
            return;
        }

        if conn.state() == ConnState::Closing && conn.pending_writes() == 0 {
            self.close_with(registry, id, None);
            return;
        }

        if let Err(e) = conn.sync_interest(registry) {
            self.close_with(registry, id, Some(e.into()));
            return;
        }

        // The peer may have paused reading on our backlog.
        if let Some(peer) = conn.attachment() {
            let paused = self
                .connections
                .get(peer)
                .is_some_and(|p| p.is_open() && p.is_read_paused());
            if paused && self.read_budget(peer) > 0 {
                self.pending.reads.push_back(peer);
            }
        }
    }

    /// Close `id` and queue its disconnect event.
    fn close_with(&mut self, registry: &Registry, id: ConnId, reason: Option<RelayError>) {
        if self.connections.close(id, registry) {
            self.pending.disconnects.push_back((id, reason));
        }
    }

    fn dispatch(
        &mut self,
        registry: &Registry,
        id: ConnId,
        event: Event,
        reason: Option<RelayError>,
    ) -> Outcome {
        let mut ctx = Context::new(
            id,
            &mut self.connections,
            registry,
            &mut self.pending,
            self.settings.connect_timeout,
            reason.as_ref(),
        );
        self.chain.dispatch(event, &mut ctx)
    }

    /// Run queued work until nothing is left.
    fn drain(&mut self, registry: &Registry) {
        loop {
            if let Some((id, reason)) = self.pending.disconnects.pop_front() {
                if let Some(reason) = &reason {
                    debug!(conn_id = id, error = %reason, "Connection closed");
                } else {
                    debug!(conn_id = id, "Connection closed");
                }
                self.dispatch(registry, id, Event::Disconnect, reason);
                continue;
            }

            if let Some(id) = self.pending.data.pop_front() {
                let Some(conn) = self.connections.get(id) else {
                    continue;
                };
                if conn.is_open() && !conn.is_data_suspended() && conn.available() > 0 {
                    self.dispatch(registry, id, Event::Data, None);
                }
                let eof_reached = self
                    .connections
                    .get(id)
                    .is_some_and(|c| c.is_open() && !c.is_data_suspended() && c.is_eof_pending());
                if eof_reached {
                    debug!(conn_id = id, "Peer closed connection");
                    self.close_with(registry, id, None);
                    continue;
                }
                if self.connections.get(id).is_some_and(|c| c.is_open() && c.is_read_paused()) {
                    self.pending.reads.push_back(id);
                }
                continue;
            }

            if let Some(id) = self.pending.reads.pop_front() {
                self.read(registry, id);
                continue;
            }

            if !self.pending.touched.is_empty() {
                let mut touched = std::mem::take(&mut self.pending.touched);
                touched.sort_unstable();
                touched.dedup();
                for id in touched {
                    self.write(registry, id);
                }
                continue;
            }

            break;
        }
    }

    /// Fire connect and idle timeouts that are due at `now`.
    pub fn expire(&mut self, registry: &Registry, now: Instant) {
        let mut connect_expired = Vec::new();
        let mut idle_expired = Vec::new();

        for (id, conn) in self.connections.iter() {
            match conn.state() {
                ConnState::Connecting => {
                    if conn.connect_deadline().is_some_and(|d| d <= now) {
                        connect_expired.push(id);
                    }
                }
                ConnState::Open => {
                    if let Some(idle) = self.settings.idle_timeout {
                        if now.saturating_duration_since(conn.last_activity()) >= idle {
                            idle_expired.push(id);
                        }
                    }
                }
                ConnState::Closing | ConnState::Closed => {}
            }
        }

        for id in connect_expired {
            let target = dial_target(&self.connections[id]);
            self.connections.stats().forward_failed();
            let source = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
            self.close_with(registry, id, Some(RelayError::ForwardConnect { target, source }));
        }

        for id in idle_expired {
            if !self.connections.get(id).is_some_and(|c| c.is_open()) {
                continue;
            }
            let outcome = self.dispatch(registry, id, Event::IdleTimeout, None);
            if outcome.is_terminated() {
                if let Some(conn) = self.connections.get_mut(id) {
                    conn.touch();
                }
            } else if let Some(idle) = self.settings.idle_timeout {
                debug!(conn_id = id, "Closing idle connection");
                self.close_with(registry, id, Some(RelayError::IdleTimeout(idle)));
            }
        }

        self.drain(registry);
    }

    /// Time until the earliest connect or idle deadline.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.connections
            .iter()
            .filter_map(|(_, conn)| match conn.state() {
                ConnState::Connecting => conn.connect_deadline(),
                ConnState::Open => self.settings.idle_timeout.map(|idle| conn.last_activity() + idle),
                ConnState::Closing | ConnState::Closed => None,
            })
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Close every live connection, firing disconnect events.
    pub fn close_all(&mut self, registry: &Registry) {
        for id in self.connections.live_ids() {
            self.close_with(registry, id, None);
        }
        self.drain(registry);
    }

    /// Release connections closed during this tick.
    pub fn end_tick(&mut self) -> usize {
        self.connections.reap()
    }
}

fn dial_target(conn: &Connection) -> SocketAddr {
    match conn.origin() {
        Origin::Dialed { target, .. } => target,
        Origin::Accepted => conn.peer_addr(),
    }
}
