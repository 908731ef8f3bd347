//! Process-level server: one proxy listener per worker thread.
//!
//! With more than one worker every listener binds the same address with
//! `SO_REUSEPORT` and the kernel spreads accepted connections across them.

use crate::config::{Config, ConfigError};
use crate::error::RelayError;
use crate::handler::HandlerChain;
use crate::handlers::{RelayHandler, TraceHandler};
use crate::listener::ProxyListener;
use std::net::SocketAddr;
use std::thread;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Build the handler chain every worker runs.
pub fn build_chain(config: &Config, target: SocketAddr) -> HandlerChain {
    let mut chain = HandlerChain::new();
    if config.trace_events {
        chain.add_last(TraceHandler);
    }
    chain.add_last(RelayHandler::new(target));
    chain
}

/// Bind every worker's listener, then serve until all of them stop.
pub fn run(config: Config) -> Result<(), ServerError> {
    let num_workers = match config.workers {
        None | Some(0) => num_cpus(),
        Some(n) => n,
    };
    let addr = config.listen_addr()?;
    let target = config.forward_addr()?;
    let settings = config.proxy_settings(num_workers > 1);

    info!(
        workers = num_workers,
        addr = %addr,
        target = %target,
        "Starting relay"
    );

    // Bind on this thread so a taken port fails the whole process.
    let mut listeners = Vec::with_capacity(num_workers);
    for _ in 0..num_workers {
        listeners.push(ProxyListener::bind(
            addr,
            build_chain(&config, target),
            settings.clone(),
        )?);
    }

    if num_workers == 1 {
        if let Some(mut listener) = listeners.pop() {
            listener.run()?;
        }
        return Ok(());
    }

    let mut handles = Vec::with_capacity(num_workers);
    for (worker_id, mut listener) in listeners.into_iter().enumerate() {
        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                info!(worker = worker_id, "Worker started");
                if let Err(e) = listener.run() {
                    error!(worker = worker_id, error = %e, "Worker failed");
                }
            })
            .map_err(ServerError::Spawn)?;
        handles.push(handle);
    }

    // Wait for all workers
    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliArgs, TomlConfig};
    use clap::Parser;

    fn config(args: &[&str]) -> Config {
        let cli = CliArgs::parse_from(std::iter::once("tcp-relay").chain(args.iter().copied()));
        Config::merge(cli, TomlConfig::default()).unwrap()
    }

    #[test]
    fn test_chain_layout() {
        let target = "127.0.0.1:9".parse().unwrap();

        let chain = build_chain(&config(&["-f", "127.0.0.1:9"]), target);
        assert_eq!(chain.names(), vec!["relay"]);

        let chain = build_chain(&config(&["-f", "127.0.0.1:9", "--trace-events"]), target);
        assert_eq!(chain.names(), vec!["trace", "relay"]);
    }

    #[test]
    fn test_run_fails_on_bad_forward() {
        let err = run(config(&["-f", "nowhere", "-w", "1"])).unwrap_err();
        assert!(matches!(err, ServerError::Config(ConfigError::InvalidAddress(..))));
    }
}
