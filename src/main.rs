//! tcp-relay: forward every accepted TCP connection to a fixed target.
//!
//! Features:
//! - Non-blocking mio reactor per worker thread
//! - Handler chain dispatch (relay, optional event tracing)
//! - Connect and idle timeouts, per-pair flow control
//! - Configuration via CLI arguments or TOML file

use tcp_relay::config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        forward = %config.forward,
        workers = ?config.workers,
        max_connections = config.max_connections,
        connect_timeout_ms = config.connect_timeout_ms,
        idle_timeout_secs = config.idle_timeout_secs,
        "Starting tcp-relay"
    );

    tcp_relay::server::run(config)?;
    Ok(())
}
