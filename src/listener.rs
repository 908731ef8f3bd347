//! Proxy listener: binds, accepts, and drives one reactor.
//!
//! The listener owns every connection it accepts (and every connection its
//! handlers dial). `close` stops accepting and tears all of them down.
//! Other threads interact with a running listener only through a
//! `ListenerHandle`.

use crate::error::RelayError;
use crate::handler::HandlerChain;
use crate::runtime::{
    ProxySettings, ProxyStats, Reactor, StatsSnapshot, TokenKind, LISTENER_TOKEN, WAKER_TOKEN,
};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A bound listener and the reactor serving its connections.
pub struct ProxyListener {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    reactor: Reactor,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    stats: Arc<ProxyStats>,
    initialized: bool,
    closed: bool,
}

/// Thread-safe control over a running listener.
#[derive(Clone)]
pub struct ListenerHandle {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    stats: Arc<ProxyStats>,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    /// Ask the listener to close. `run` returns once it has.
    pub fn shutdown(&self) -> io::Result<()> {
        self.shutdown.store(true, Ordering::Release);
        self.waker.wake()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl ProxyListener {
    /// Bind `addr` and prepare to accept. Nothing is accepted until the
    /// listener is polled.
    pub fn bind(
        addr: SocketAddr,
        chain: HandlerChain,
        settings: ProxySettings,
    ) -> Result<Self, RelayError> {
        let std_listener = create_listener(addr, settings.reuse_port)
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = std_listener.local_addr()?;
        let mut listener = TcpListener::from_std(std_listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let stats = Arc::new(ProxyStats::default());
        let events = Events::with_capacity(settings.batch_size);
        let reactor = Reactor::new(chain, settings, Arc::clone(&stats));

        info!(addr = %local_addr, "Listening");

        Ok(Self {
            poll,
            events,
            listener: Some(listener),
            local_addr,
            reactor,
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
            stats,
            initialized: false,
            closed: false,
        })
    }

    /// Bind every interface on `port` with default settings.
    pub fn listen(port: u16, chain: HandlerChain) -> Result<Self, RelayError> {
        Self::bind(
            SocketAddr::from(([0, 0, 0, 0], port)),
            chain,
            ProxySettings::default(),
        )
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            shutdown: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
            stats: Arc::clone(&self.stats),
            local_addr: self.local_addr,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn active_pairs(&self) -> usize {
        self.stats.active_pairs()
    }

    /// Connections currently held, including those waiting on a connect.
    pub fn connection_count(&self) -> usize {
        self.reactor.connections().len()
    }

    /// Serve until a `ListenerHandle` requests shutdown, then close.
    pub fn run(&mut self) -> Result<(), RelayError> {
        while !self.shutdown.load(Ordering::Acquire) {
            self.poll_once(None)?;
        }
        self.close();
        Ok(())
    }

    /// Run one reactor tick, waiting at most `timeout` for readiness.
    ///
    /// The wait is shortened to the next connect or idle deadline.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<(), RelayError> {
        if self.closed {
            return Ok(());
        }
        if !self.initialized {
            self.reactor.init();
            self.initialized = true;
        }

        let deadline = self.reactor.next_timeout(Instant::now());
        let timeout = match (timeout, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let registry = self.poll.registry();
        for event in self.events.iter() {
            match TokenKind::from(event.token()) {
                TokenKind::Listener => {
                    if let Some(listener) = &self.listener {
                        accept_connections(listener, registry, &mut self.reactor, &self.stats);
                    }
                }
                TokenKind::Waker => {}
                TokenKind::Connection(id) => self.reactor.handle_event(registry, id, event),
            }
        }

        self.reactor.expire(registry, Instant::now());
        self.reactor.end_tick();
        Ok(())
    }

    /// Stop accepting and close every connection. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let registry = self.poll.registry();
        if let Some(mut listener) = self.listener.take() {
            let _ = registry.deregister(&mut listener);
        }
        self.reactor.close_all(registry);
        self.reactor.end_tick();
        if self.initialized {
            self.reactor.destroy();
        }

        info!(addr = %self.local_addr, "Listener closed");
    }
}

fn accept_connections(
    listener: &TcpListener,
    registry: &Registry,
    reactor: &mut Reactor,
    stats: &ProxyStats,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                stats.accepted();
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                }
                match reactor.accept(registry, stream, peer_addr) {
                    Ok(conn_id) => debug!(conn_id, peer = %peer_addr, "Accepted connection"),
                    Err(RelayError::ConnectionLimit(max)) => {
                        warn!(max, peer = %peer_addr, "Connection limit reached");
                    }
                    Err(e) => warn!(peer = %peer_addr, error = %e, "Failed to register connection"),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Accept error: {}", e);
                break;
            }
        }
    }
}

/// Create a non-blocking TCP listener, optionally with SO_REUSEPORT for
/// kernel load balancing across workers.
fn create_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
