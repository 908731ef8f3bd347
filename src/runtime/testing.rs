//! Socket fixtures for unit tests.

use crate::runtime::connection::{ConnId, Connection, ConnectionRegistry};
use crate::runtime::context::{Context, Pending};
use crate::runtime::stats::ProxyStats;
use mio::Poll;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A connected loopback pair: the non-blocking server side as a mio stream,
/// the blocking client side, and the client's address.
pub(crate) fn loopback() -> (mio::net::TcpStream, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let remote = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (accepted, peer) = listener.accept().unwrap();
    accepted.set_nonblocking(true).unwrap();
    (mio::net::TcpStream::from_std(accepted), remote, peer)
}

/// A registry with real sockets and no reactor around it.
pub(crate) struct Harness {
    pub poll: Poll,
    pub connections: ConnectionRegistry,
    pub pending: Pending,
    remotes: HashMap<ConnId, TcpStream>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            poll: Poll::new().unwrap(),
            connections: ConnectionRegistry::new(64, Arc::new(ProxyStats::default())),
            pending: Pending::default(),
            remotes: HashMap::new(),
        }
    }

    /// Add an accepted connection, registered with the poller.
    pub fn accept(&mut self) -> ConnId {
        let (stream, remote, peer) = loopback();
        let id = self
            .connections
            .insert_with(|id| Connection::accepted(id, stream, peer))
            .unwrap();
        self.connections[id].register(self.poll.registry()).unwrap();
        self.remotes.insert(id, remote);
        id
    }

    pub fn context(&mut self, id: ConnId) -> Context<'_> {
        Context::new(
            id,
            &mut self.connections,
            self.poll.registry(),
            &mut self.pending,
            Duration::from_secs(5),
            None,
        )
    }

    /// The client side of an accepted connection.
    pub fn remote(&mut self, id: ConnId) -> &mut TcpStream {
        self.remotes.get_mut(&id).unwrap()
    }

    /// Read from the socket until at least `len` bytes are buffered.
    pub fn read_until(&mut self, id: ConnId, len: usize) {
        let mut scratch = [0u8; 256];
        let deadline = Instant::now() + Duration::from_secs(5);
        let conn = self.connections.get_mut(id).unwrap();
        while conn.available() < len {
            assert!(Instant::now() < deadline, "timed out waiting for {len} bytes");
            conn.fill(&mut scratch, usize::MAX).unwrap();
        }
    }
}
