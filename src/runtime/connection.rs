//! Connection state machine and the registry that owns every connection.
//!
//! A `Connection` never touches the socket on its own initiative: `write`
//! and `read_available` only move bytes in and out of its buffers. The
//! reactor drives the actual syscalls through `fill` and `flush` when the
//! poller reports readiness.

use crate::error::RelayError;
use crate::runtime::stats::ProxyStats;
use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::ops::{Index, IndexMut};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Registry key of a connection. Doubles as its mio token.
pub type ConnId = usize;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Outbound connect in progress.
    Connecting,
    /// Established; reads and writes flow.
    Open,
    /// Flushing pending writes before closing.
    Closing,
    /// Socket released. Terminal.
    Closed,
}

/// How the connection came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Accepted by the listener.
    Accepted,
    /// Opened by the reactor on behalf of another connection.
    Dialed {
        /// Connection that requested the dial.
        by: ConnId,
        /// Address being dialed.
        target: SocketAddr,
    },
}

/// Result of draining the socket into the inbound buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadOutcome {
    /// Bytes appended to the inbound buffer.
    pub read: usize,
    /// Peer closed its write side.
    pub eof: bool,
    /// Reading stopped on the byte budget, not on `WouldBlock`.
    pub paused: bool,
}

/// A single TCP endpoint owned by the registry.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    stream: Option<TcpStream>,
    state: ConnState,
    origin: Origin,
    peer_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    inbound: BytesMut,
    outbound: BytesMut,
    attachment: Option<ConnId>,
    pending_dial: Option<ConnId>,
    data_suspended: bool,
    read_paused: bool,
    eof_pending: bool,
    interest: Interest,
    last_activity: Instant,
    connect_deadline: Option<Instant>,
}

impl Connection {
    /// Wrap a stream handed out by the listener. Starts `Open`.
    pub(crate) fn accepted(id: ConnId, stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self::new(id, stream, ConnState::Open, Origin::Accepted, peer_addr, None)
    }

    /// Wrap a stream whose non-blocking connect is still in flight.
    pub(crate) fn dialed(
        id: ConnId,
        stream: TcpStream,
        by: ConnId,
        target: SocketAddr,
        deadline: Instant,
    ) -> Self {
        Self::new(
            id,
            stream,
            ConnState::Connecting,
            Origin::Dialed { by, target },
            target,
            Some(deadline),
        )
    }

    fn new(
        id: ConnId,
        stream: TcpStream,
        state: ConnState,
        origin: Origin,
        peer_addr: SocketAddr,
        connect_deadline: Option<Instant>,
    ) -> Self {
        let local_addr = stream.local_addr().ok();
        let interest = match state {
            ConnState::Connecting => Interest::READABLE | Interest::WRITABLE,
            _ => Interest::READABLE,
        };
        Self {
            id,
            stream: Some(stream),
            state,
            origin,
            peer_addr,
            local_addr,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            attachment: None,
            pending_dial: None,
            data_suspended: false,
            read_paused: false,
            eof_pending: false,
            interest,
            last_activity: Instant::now(),
            connect_deadline,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn remote_port(&self) -> u16 {
        self.peer_addr.port()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_addr.map(|addr| addr.port())
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Queue bytes for sending. Never blocks.
    ///
    /// Writes are accepted while connecting and flushed once the connect
    /// completes.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, RelayError> {
        match self.state {
            ConnState::Connecting | ConnState::Open => {
                self.outbound.extend_from_slice(data);
                Ok(data.len())
            }
            ConnState::Closing | ConnState::Closed => Err(RelayError::ConnectionClosed(self.id)),
        }
    }

    /// Take every buffered inbound byte. Empty if nothing is buffered.
    pub fn read_available(&mut self) -> Bytes {
        self.inbound.split().freeze()
    }

    /// Number of inbound bytes waiting to be read.
    pub fn available(&self) -> usize {
        self.inbound.len()
    }

    /// Number of outbound bytes not yet handed to the socket.
    pub fn pending_writes(&self) -> usize {
        self.outbound.len()
    }

    /// Set the non-owning back-reference to a peer.
    pub fn attach(&mut self, peer: ConnId) {
        self.attachment = Some(peer);
    }

    pub fn attachment(&self) -> Option<ConnId> {
        self.attachment
    }

    /// Clear the back-reference, returning what it pointed at.
    pub fn detach(&mut self) -> Option<ConnId> {
        self.attachment.take()
    }

    /// Outbound connection opened for this one and not yet paired.
    pub fn pending_dial(&self) -> Option<ConnId> {
        self.pending_dial
    }

    pub(crate) fn set_pending_dial(&mut self, dial: Option<ConnId>) {
        self.pending_dial = dial;
    }

    /// Whether data events are held back for this connection.
    pub fn is_data_suspended(&self) -> bool {
        self.data_suspended
    }

    pub(crate) fn set_data_suspended(&mut self, suspended: bool) {
        self.data_suspended = suspended;
    }

    pub(crate) fn is_read_paused(&self) -> bool {
        self.read_paused
    }

    pub(crate) fn set_read_paused(&mut self, paused: bool) {
        self.read_paused = paused;
    }

    /// Peer sent EOF while data events were held back. The connection
    /// closes once the buffered input has been replayed.
    pub(crate) fn is_eof_pending(&self) -> bool {
        self.eof_pending
    }

    pub(crate) fn set_eof_pending(&mut self) {
        self.eof_pending = true;
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn connect_deadline(&self) -> Option<Instant> {
        self.connect_deadline
    }

    /// Close the connection. Returns `false` if it was already closed.
    ///
    /// Pending writes and unread input are dropped; the socket is released.
    pub fn close(&mut self) -> bool {
        if self.state == ConnState::Closed {
            return false;
        }
        self.state = ConnState::Closed;
        self.stream = None;
        self.inbound.clear();
        self.outbound.clear();
        self.connect_deadline = None;
        true
    }

    /// Stop accepting writes and close once the outbound buffer drains.
    ///
    /// Returns `true` if the buffer is already empty and the caller should
    /// close right away.
    pub fn begin_closing(&mut self) -> bool {
        match self.state {
            ConnState::Closed => false,
            ConnState::Connecting => true,
            ConnState::Open | ConnState::Closing => {
                self.state = ConnState::Closing;
                self.outbound.is_empty()
            }
        }
    }

    /// Check whether an in-flight connect has completed.
    ///
    /// `Ok(false)` means the connect is still pending.
    pub(crate) fn finish_connect(&mut self) -> io::Result<bool> {
        let stream = self.stream.as_ref().ok_or_else(closed_stream)?;
        if let Some(err) = stream.take_error()? {
            return Err(err);
        }
        match stream.peer_addr() {
            Ok(addr) => {
                self.peer_addr = addr;
                self.local_addr = stream.local_addr().ok();
                self.state = ConnState::Open;
                self.connect_deadline = None;
                self.last_activity = Instant::now();
                Ok(true)
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read from the socket until it would block, hits EOF, or `budget`
    /// bytes have been buffered.
    pub(crate) fn fill(&mut self, scratch: &mut [u8], budget: usize) -> io::Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();
        let stream = self.stream.as_mut().ok_or_else(closed_stream)?;

        loop {
            let remaining = budget.saturating_sub(outcome.read);
            if remaining == 0 {
                outcome.paused = true;
                break;
            }
            let chunk = remaining.min(scratch.len());
            match stream.read(&mut scratch[..chunk]) {
                Ok(0) => {
                    outcome.eof = true;
                    break;
                }
                Ok(n) => {
                    self.inbound.extend_from_slice(&scratch[..n]);
                    outcome.read += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if outcome.read > 0 {
            self.last_activity = Instant::now();
            trace!(conn_id = self.id, len = outcome.read, "Read from socket");
        }
        Ok(outcome)
    }

    /// Write as much of the outbound buffer as the socket accepts.
    pub(crate) fn flush(&mut self) -> io::Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(closed_stream)?;
        let mut written = 0;

        while !self.outbound.is_empty() {
            match stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    self.outbound.advance(n);
                    written += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if written > 0 {
            self.last_activity = Instant::now();
            trace!(conn_id = self.id, len = written, remaining = self.outbound.len(), "Wrote to socket");
        }
        Ok(written)
    }

    /// Interest the poller should hold for the current state and buffers.
    fn desired_interest(&self) -> Interest {
        match self.state {
            ConnState::Connecting => Interest::READABLE | Interest::WRITABLE,
            _ if !self.outbound.is_empty() => Interest::READABLE | Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }

    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = self.desired_interest();
        let stream = self.stream.as_mut().ok_or_else(closed_stream)?;
        registry.register(stream, Token(self.id), interest)?;
        self.interest = interest;
        Ok(())
    }

    /// Reregister only if the wanted interest changed.
    pub(crate) fn sync_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = self.desired_interest();
        if interest == self.interest {
            return Ok(());
        }
        if let Some(stream) = self.stream.as_mut() {
            registry.reregister(stream, Token(self.id), interest)?;
            self.interest = interest;
        }
        Ok(())
    }

    fn deregister(&mut self, registry: &Registry) {
        if let Some(stream) = self.stream.as_mut() {
            let _ = registry.deregister(stream);
        }
    }
}

fn closed_stream() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}

/// Registry of connections owned by one reactor.
///
/// Closed connections stay in place until `reap` so their ids cannot be
/// handed to a new connection while events for the old one may still be
/// queued in the same tick.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
    stats: Arc<ProxyStats>,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, stats: Arc<ProxyStats>) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
            stats,
        }
    }

    /// Insert a connection built from its freshly assigned id.
    ///
    /// Returns `None` if the registry is at capacity.
    pub(crate) fn insert_with(&mut self, build: impl FnOnce(ConnId) -> Connection) -> Option<ConnId> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        let entry = self.connections.vacant_entry();
        let id = entry.key();
        entry.insert(build(id));
        self.stats.connection_opened();
        Some(id)
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Borrow two distinct connections mutably.
    pub fn get2_mut(&mut self, a: ConnId, b: ConnId) -> Option<(&mut Connection, &mut Connection)> {
        if a == b {
            return None;
        }
        self.connections.get2_mut(a, b)
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.connections.contains(id)
    }

    /// Number of entries, including closed ones not yet reaped.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &Connection)> {
        self.connections.iter()
    }

    /// Ids of every connection that is not yet closed.
    pub fn live_ids(&self) -> Vec<ConnId> {
        self.connections
            .iter()
            .filter(|(_, conn)| !conn.is_closed())
            .map(|(id, _)| id)
            .collect()
    }

    /// Attach two open connections to each other in one step.
    ///
    /// Fails if either side is missing, closed, or already attached.
    pub fn pair(&mut self, a: ConnId, b: ConnId) -> bool {
        let Some((left, right)) = self.get2_mut(a, b) else {
            return false;
        };
        if left.is_closed() || right.is_closed() {
            return false;
        }
        if left.attachment.is_some() || right.attachment.is_some() {
            return false;
        }
        left.attach(b);
        right.attach(a);
        if left.pending_dial == Some(b) {
            left.pending_dial = None;
        }
        if right.pending_dial == Some(a) {
            right.pending_dial = None;
        }
        self.stats.pair_opened();
        debug!(client = a, server = b, "Paired connections");
        true
    }

    /// Clear both sides of the pair `id` belongs to. Returns the peer.
    ///
    /// Only the first call for a pair returns `Some`.
    pub fn unpair(&mut self, id: ConnId) -> Option<ConnId> {
        let peer = self.connections.get_mut(id)?.detach()?;
        if let Some(other) = self.connections.get_mut(peer) {
            if other.attachment == Some(id) {
                other.detach();
            }
        }
        self.stats.pair_closed();
        debug!(conn_id = id, peer, "Unpaired connections");
        Some(peer)
    }

    /// Deregister and close a connection. Returns `true` on the first call.
    pub fn close(&mut self, id: ConnId, registry: &Registry) -> bool {
        let Some(conn) = self.connections.get_mut(id) else {
            return false;
        };
        if conn.is_closed() {
            return false;
        }
        conn.deregister(registry);
        conn.close()
    }

    /// Remove closed entries. Returns how many were removed.
    pub fn reap(&mut self) -> usize {
        let closed: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_closed())
            .map(|(id, _)| id)
            .collect();
        for &id in &closed {
            self.connections.remove(id);
            self.stats.connection_closed();
        }
        closed.len()
    }
}

impl Index<ConnId> for ConnectionRegistry {
    type Output = Connection;

    fn index(&self, id: ConnId) -> &Connection {
        &self.connections[id]
    }
}

impl IndexMut<ConnId> for ConnectionRegistry {
    fn index_mut(&mut self, id: ConnId) -> &mut Connection {
        &mut self.connections[id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::loopback;
    use std::io::{Read as _, Write as _};
    use std::time::Duration;

    fn registry(max: usize) -> ConnectionRegistry {
        ConnectionRegistry::new(max, Arc::new(ProxyStats::default()))
    }

    fn insert_accepted(reg: &mut ConnectionRegistry) -> (ConnId, std::net::TcpStream) {
        let (stream, remote, peer) = loopback();
        let id = reg
            .insert_with(|id| Connection::accepted(id, stream, peer))
            .unwrap();
        (id, remote)
    }

    #[test]
    fn test_connection_state_transitions() {
        let (stream, _remote, peer) = loopback();
        let mut conn = Connection::accepted(0, stream, peer);
        assert_eq!(conn.state(), ConnState::Open);
        assert_eq!(conn.remote_port(), peer.port());
        assert!(conn.local_port().is_some());

        conn.write(b"abc").unwrap();
        assert!(!conn.begin_closing());
        assert_eq!(conn.state(), ConnState::Closing);
        assert!(matches!(conn.write(b"x"), Err(RelayError::ConnectionClosed(0))));

        assert!(conn.close());
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(conn.pending_writes(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (stream, mut remote, peer) = loopback();
        let mut conn = Connection::accepted(0, stream, peer);

        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
        assert!(matches!(conn.write(b"late"), Err(RelayError::ConnectionClosed(0))));

        // The socket was released: the remote side sees EOF.
        remote.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(remote.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_read_available_consumes() {
        let (stream, mut remote, peer) = loopback();
        let mut conn = Connection::accepted(0, stream, peer);
        assert!(conn.read_available().is_empty());

        remote.write_all(b"hello").unwrap();
        let mut scratch = [0u8; 64];
        let deadline = Instant::now() + Duration::from_secs(5);
        while conn.available() < 5 && Instant::now() < deadline {
            conn.fill(&mut scratch, 1024).unwrap();
        }

        assert_eq!(&conn.read_available()[..], b"hello");
        assert_eq!(conn.available(), 0);
        assert!(conn.read_available().is_empty());
    }

    #[test]
    fn test_fill_respects_budget() {
        let (stream, mut remote, peer) = loopback();
        let mut conn = Connection::accepted(0, stream, peer);

        remote.write_all(&[7u8; 32]).unwrap();
        let mut scratch = [0u8; 64];
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut outcome = ReadOutcome::default();
        while !outcome.paused && Instant::now() < deadline {
            outcome = conn.fill(&mut scratch, 10 - conn.available()).unwrap();
        }
        assert!(outcome.paused);
        assert_eq!(conn.available(), 10);
    }

    #[test]
    fn test_flush_sends_queued_bytes() {
        let (stream, mut remote, peer) = loopback();
        let mut conn = Connection::accepted(0, stream, peer);

        assert_eq!(conn.write(b"testdata\r\n").unwrap(), 10);
        assert_eq!(conn.pending_writes(), 10);
        assert_eq!(conn.flush().unwrap(), 10);
        assert_eq!(conn.pending_writes(), 0);

        let mut buf = [0u8; 10];
        remote.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        remote.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"testdata\r\n");
    }

    #[test]
    fn test_registry_capacity() {
        let mut reg = registry(2);
        let (a, _ra) = insert_accepted(&mut reg);
        let (b, _rb) = insert_accepted(&mut reg);
        assert_ne!(a, b);

        let (stream, _rc, peer) = loopback();
        assert!(reg
            .insert_with(|id| Connection::accepted(id, stream, peer))
            .is_none());
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.stats().snapshot().active_connections, 2);
    }

    #[test]
    fn test_pair_and_unpair_once() {
        let mut reg = registry(4);
        let (a, _ra) = insert_accepted(&mut reg);
        let (b, _rb) = insert_accepted(&mut reg);

        assert!(reg.pair(a, b));
        assert_eq!(reg.get(a).unwrap().attachment(), Some(b));
        assert_eq!(reg.get(b).unwrap().attachment(), Some(a));
        assert_eq!(reg.stats().snapshot().active_pairs, 1);

        // Already attached.
        assert!(!reg.pair(a, b));

        assert_eq!(reg.unpair(b), Some(a));
        assert_eq!(reg.get(a).unwrap().attachment(), None);
        assert_eq!(reg.get(b).unwrap().attachment(), None);
        assert_eq!(reg.unpair(a), None);
        assert_eq!(reg.stats().snapshot().active_pairs, 0);
    }

    #[test]
    fn test_close_and_reap() {
        let poll = mio::Poll::new().unwrap();
        let mut reg = registry(4);
        let (a, _ra) = insert_accepted(&mut reg);
        reg.get_mut(a).unwrap().register(poll.registry()).unwrap();

        assert!(reg.close(a, poll.registry()));
        assert!(!reg.close(a, poll.registry()));
        assert!(reg.contains(a));
        assert!(reg.live_ids().is_empty());

        assert_eq!(reg.reap(), 1);
        assert!(!reg.contains(a));
        assert_eq!(reg.stats().snapshot().active_connections, 0);
    }
}
