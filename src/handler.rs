//! Handler chain dispatch.
//!
//! Handlers declare which events they care about through `Capabilities`.
//! The chain precomputes one dispatch path per event whenever a handler is
//! added, then walks that path in insertion order until a handler answers
//! `Flow::Terminate`.
//!
//! A single handler instance serves every connection of a reactor, so
//! callbacks take `&self`. Anything that varies per connection belongs on the
//! `Connection`, reached through the `Context`.

use crate::error::{BoxError, RelayError};
use crate::runtime::{ConnId, Context};
use std::any::Any;
use std::fmt;
use std::ops::BitOr;
use std::panic::{self, AssertUnwindSafe};
use tracing::{trace, warn};

/// Connection events a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Connect,
    Data,
    Disconnect,
    IdleTimeout,
}

impl Event {
    const ALL: [Event; 4] = [Event::Connect, Event::Data, Event::Disconnect, Event::IdleTimeout];

    fn index(self) -> usize {
        match self {
            Event::Connect => 0,
            Event::Data => 1,
            Event::Disconnect => 2,
            Event::IdleTimeout => 3,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::Connect => "connect",
            Event::Data => "data",
            Event::Disconnect => "disconnect",
            Event::IdleTimeout => "idle-timeout",
        };
        f.write_str(name)
    }
}

/// Set of events a handler supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const CONNECT: Capabilities = Capabilities(1 << 0);
    pub const DATA: Capabilities = Capabilities(1 << 1);
    pub const DISCONNECT: Capabilities = Capabilities(1 << 2);
    pub const IDLE_TIMEOUT: Capabilities = Capabilities(1 << 3);
    pub const ALL: Capabilities = Capabilities(0b1111);

    pub fn supports(self, event: Event) -> bool {
        self.0 & (1 << event.index()) != 0
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Self) -> Self {
        Capabilities(self.0 | rhs.0)
    }
}

/// What a callback wants to happen to the rest of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Terminate,
}

pub type HandlerResult = Result<Flow, BoxError>;

/// A connection event handler.
///
/// Callbacks for events outside `capabilities()` are never invoked.
pub trait Handler: Send {
    /// Name used in logs and error reports.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    fn on_connect(&self, _ctx: &mut Context<'_>) -> HandlerResult {
        Ok(Flow::Continue)
    }

    fn on_data(&self, _ctx: &mut Context<'_>) -> HandlerResult {
        Ok(Flow::Continue)
    }

    fn on_disconnect(&self, _ctx: &mut Context<'_>) -> HandlerResult {
        Ok(Flow::Continue)
    }

    fn on_idle_timeout(&self, _ctx: &mut Context<'_>) -> HandlerResult {
        Ok(Flow::Continue)
    }

    /// Called once before the listener accepts its first connection.
    fn on_init(&mut self) {}

    /// Called once after the listener has closed every connection.
    fn on_destroy(&mut self) {}
}

/// Result of dispatching one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No handler supports the event.
    Unhandled,
    /// Every supporting handler answered `Continue`.
    Continued,
    /// A handler answered `Terminate`.
    Terminated { handler: &'static str },
    /// A handler failed; counts as terminated.
    Failed { handler: &'static str },
}

impl Outcome {
    pub fn is_terminated(self) -> bool {
        matches!(self, Outcome::Terminated { .. } | Outcome::Failed { .. })
    }
}

/// Ordered handler list with per-event dispatch paths.
#[derive(Default)]
pub struct HandlerChain {
    handlers: Vec<Box<dyn Handler>>,
    paths: [Vec<usize>; 4],
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; it runs after every handler already in the chain.
    pub fn add_last(&mut self, handler: impl Handler + 'static) -> &mut Self {
        self.handlers.push(Box::new(handler));
        self.compute_paths();
        self
    }

    /// Builder form of `add_last`.
    pub fn with(mut self, handler: impl Handler + 'static) -> Self {
        self.add_last(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    fn compute_paths(&mut self) {
        for event in Event::ALL {
            self.paths[event.index()] = self
                .handlers
                .iter()
                .enumerate()
                .filter(|(_, h)| h.capabilities().supports(event))
                .map(|(idx, _)| idx)
                .collect();
        }
    }

    /// Run `event` through the chain for the connection in `ctx`.
    ///
    /// A callback that returns an error ends the walk for this event only. A
    /// callback that panics also closes its connection; the reactor and every
    /// other connection keep running.
    pub fn dispatch(&self, event: Event, ctx: &mut Context<'_>) -> Outcome {
        let path = &self.paths[event.index()];
        if path.is_empty() {
            return Outcome::Unhandled;
        }

        for &idx in path {
            let handler = &self.handlers[idx];
            let result = panic::catch_unwind(AssertUnwindSafe(|| match event {
                Event::Connect => handler.on_connect(ctx),
                Event::Data => handler.on_data(ctx),
                Event::Disconnect => handler.on_disconnect(ctx),
                Event::IdleTimeout => handler.on_idle_timeout(ctx),
            }));

            match result {
                Ok(Ok(Flow::Continue)) => continue,
                Ok(Ok(Flow::Terminate)) => {
                    trace!(conn_id = ctx.id(), %event, handler = handler.name(), "Chain terminated");
                    return Outcome::Terminated { handler: handler.name() };
                }
                Ok(Err(source)) => {
                    report_failure(handler.name(), event, ctx.id(), source);
                    return Outcome::Failed { handler: handler.name() };
                }
                Err(payload) => {
                    let source = format!("panicked: {}", panic_message(payload.as_ref())).into();
                    report_failure(handler.name(), event, ctx.id(), source);
                    // Its state may be half-updated; drop the connection.
                    ctx.close(ctx.id());
                    return Outcome::Failed { handler: handler.name() };
                }
            }
        }

        Outcome::Continued
    }

    pub(crate) fn init(&mut self) {
        for handler in &mut self.handlers {
            handler.on_init();
        }
    }

    pub(crate) fn destroy(&mut self) {
        for handler in &mut self.handlers {
            handler.on_destroy();
        }
    }
}

fn report_failure(handler: &'static str, event: Event, conn_id: ConnId, source: BoxError) {
    let err = RelayError::Handler {
        handler,
        event,
        conn_id,
        source,
    };
    warn!(error = %err, "Handler failed");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::Harness;
    use std::sync::{Arc, Mutex};

    /// Records every callback it sees and answers with a fixed flow.
    struct Recorder {
        name: &'static str,
        caps: Capabilities,
        flow: Flow,
        log: Arc<Mutex<Vec<(&'static str, Event)>>>,
    }

    impl Recorder {
        fn record(&self, event: Event) -> HandlerResult {
            self.log.lock().unwrap().push((self.name, event));
            Ok(self.flow)
        }
    }

    impl Handler for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn capabilities(&self) -> Capabilities {
            self.caps
        }

        fn on_connect(&self, _ctx: &mut Context<'_>) -> HandlerResult {
            self.record(Event::Connect)
        }

        fn on_data(&self, _ctx: &mut Context<'_>) -> HandlerResult {
            self.record(Event::Data)
        }

        fn on_disconnect(&self, _ctx: &mut Context<'_>) -> HandlerResult {
            self.record(Event::Disconnect)
        }
    }

    struct Failing;

    impl Handler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::DATA
        }

        fn on_data(&self, _ctx: &mut Context<'_>) -> HandlerResult {
            Err("broken handler".into())
        }
    }

    struct Panicking;

    impl Handler for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::DATA
        }

        fn on_data(&self, _ctx: &mut Context<'_>) -> HandlerResult {
            panic!("handler bug");
        }
    }

    type Log = Arc<Mutex<Vec<(&'static str, Event)>>>;

    fn recorder(name: &'static str, caps: Capabilities, flow: Flow, log: &Log) -> Recorder {
        Recorder {
            name,
            caps,
            flow,
            log: Arc::clone(log),
        }
    }

    #[test]
    fn test_capabilities() {
        let caps = Capabilities::CONNECT | Capabilities::DATA;
        assert!(caps.supports(Event::Connect));
        assert!(caps.supports(Event::Data));
        assert!(!caps.supports(Event::Disconnect));
        assert!(!Capabilities::NONE.supports(Event::IdleTimeout));
        assert!(Capabilities::ALL.supports(Event::IdleTimeout));
    }

    #[test]
    fn test_terminate_short_circuits() {
        let log: Log = Default::default();
        let chain = HandlerChain::new()
            .with(recorder("a", Capabilities::DATA, Flow::Terminate, &log))
            .with(recorder("b", Capabilities::DATA, Flow::Continue, &log));

        let mut harness = Harness::new();
        let id = harness.accept();
        let outcome = chain.dispatch(Event::Data, &mut harness.context(id));

        assert_eq!(outcome, Outcome::Terminated { handler: "a" });
        assert_eq!(*log.lock().unwrap(), vec![("a", Event::Data)]);
    }

    #[test]
    fn test_continue_reaches_next_handler() {
        let log: Log = Default::default();
        let chain = HandlerChain::new()
            .with(recorder("a", Capabilities::DATA, Flow::Continue, &log))
            .with(recorder("b", Capabilities::DATA, Flow::Continue, &log));

        let mut harness = Harness::new();
        let id = harness.accept();
        let outcome = chain.dispatch(Event::Data, &mut harness.context(id));

        assert_eq!(outcome, Outcome::Continued);
        assert_eq!(*log.lock().unwrap(), vec![("a", Event::Data), ("b", Event::Data)]);
    }

    #[test]
    fn test_unsupported_event_skips_handler() {
        let log: Log = Default::default();
        let chain = HandlerChain::new()
            .with(recorder("connect-only", Capabilities::CONNECT, Flow::Terminate, &log))
            .with(recorder("data", Capabilities::DATA, Flow::Continue, &log));

        let mut harness = Harness::new();
        let id = harness.accept();

        assert_eq!(chain.dispatch(Event::Data, &mut harness.context(id)), Outcome::Continued);
        assert_eq!(
            chain.dispatch(Event::Disconnect, &mut harness.context(id)),
            Outcome::Unhandled
        );
        assert_eq!(*log.lock().unwrap(), vec![("data", Event::Data)]);
    }

    #[test]
    fn test_error_is_isolated_and_terminates() {
        let log: Log = Default::default();
        let chain = HandlerChain::new()
            .with(Failing)
            .with(recorder("after", Capabilities::DATA, Flow::Continue, &log));

        let mut harness = Harness::new();
        let first = harness.accept();
        let second = harness.accept();

        let outcome = chain.dispatch(Event::Data, &mut harness.context(first));
        assert_eq!(outcome, Outcome::Failed { handler: "failing" });
        assert!(outcome.is_terminated());
        assert!(log.lock().unwrap().is_empty());

        // The other connection is untouched and still dispatchable.
        assert!(harness.connections[second].is_open());
        assert!(harness.connections[first].is_open());
    }

    #[test]
    fn test_panic_closes_only_its_connection() {
        let log: Log = Default::default();
        let chain = HandlerChain::new()
            .with(Panicking)
            .with(recorder("after", Capabilities::DATA, Flow::Continue, &log));

        let mut harness = Harness::new();
        let first = harness.accept();
        let second = harness.accept();

        let outcome = chain.dispatch(Event::Data, &mut harness.context(first));
        assert_eq!(outcome, Outcome::Failed { handler: "panicking" });
        assert!(log.lock().unwrap().is_empty());

        assert!(harness.connections[first].is_closed());
        assert_eq!(harness.pending.disconnects.len(), 1);
        assert!(harness.connections[second].is_open());
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 7");
    }

    #[test]
    fn test_insertion_order_and_names() {
        let log: Log = Default::default();
        let mut chain = HandlerChain::new();
        chain
            .add_last(recorder("first", Capabilities::ALL, Flow::Continue, &log))
            .add_last(recorder("second", Capabilities::ALL, Flow::Continue, &log));

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.names(), vec!["first", "second"]);

        let mut harness = Harness::new();
        let id = harness.accept();
        chain.dispatch(Event::Connect, &mut harness.context(id));
        assert_eq!(
            *log.lock().unwrap(),
            vec![("first", Event::Connect), ("second", Event::Connect)]
        );
    }
}
