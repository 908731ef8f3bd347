//! Handlers shipped with the relay.
//!
//! - `relay`: pairs each accepted connection with one to the forward target
//! - `trace`: logs every connection event, passes everything on

pub mod relay;
pub mod trace;

pub use relay::RelayHandler;
pub use trace::TraceHandler;
