//! Event logging handler.
//!
//! Place it first in the chain to see every event before other handlers
//! consume it.

use crate::handler::{Capabilities, Event, Flow, Handler, HandlerResult};
use crate::runtime::Context;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
pub struct TraceHandler;

impl TraceHandler {
    fn log(&self, event: Event, ctx: &Context<'_>) -> HandlerResult {
        let conn = ctx.connection();
        debug!(
            conn_id = conn.id(),
            %event,
            peer = %conn.peer_addr(),
            origin = ?conn.origin(),
            attachment = ?conn.attachment(),
            available = conn.available(),
            reason = ?ctx.disconnect_reason(),
            "Connection event"
        );
        Ok(Flow::Continue)
    }
}

impl Handler for TraceHandler {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    fn on_connect(&self, ctx: &mut Context<'_>) -> HandlerResult {
        self.log(Event::Connect, ctx)
    }

    fn on_data(&self, ctx: &mut Context<'_>) -> HandlerResult {
        self.log(Event::Data, ctx)
    }

    fn on_disconnect(&self, ctx: &mut Context<'_>) -> HandlerResult {
        self.log(Event::Disconnect, ctx)
    }

    fn on_idle_timeout(&self, ctx: &mut Context<'_>) -> HandlerResult {
        self.log(Event::IdleTimeout, ctx)
    }
}
