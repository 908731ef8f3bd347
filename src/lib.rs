//! tcp-relay: a non-blocking TCP relay.
//!
//! Each accepted connection is paired with a fresh connection to a fixed
//! forward target and bytes are copied verbatim in both directions. Events
//! for every connection flow through an ordered `HandlerChain`; the relay
//! itself is just one handler in it.
//!
//! ```no_run
//! use tcp_relay::{HandlerChain, ProxyListener, RelayHandler};
//!
//! let chain = HandlerChain::new().with(RelayHandler::resolve("127.0.0.1", 6379)?);
//! let mut listener = ProxyListener::listen(7000, chain)?;
//! listener.run()?;
//! # Ok::<(), tcp_relay::RelayError>(())
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod listener;
pub mod runtime;
pub mod server;

pub use error::RelayError;
pub use handler::{Capabilities, Event, Flow, Handler, HandlerChain, HandlerResult, Outcome};
pub use handlers::{RelayHandler, TraceHandler};
pub use listener::{ListenerHandle, ProxyListener};
pub use runtime::{ConnId, ConnState, Connection, Context, Origin, ProxySettings, StatsSnapshot};
