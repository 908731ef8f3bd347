//! Counters shared between the reactor thread and its observers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Live counters for one listener.
#[derive(Debug, Default)]
pub struct ProxyStats {
    accepted: AtomicU64,
    active_connections: AtomicUsize,
    active_pairs: AtomicUsize,
    bytes_forwarded: AtomicU64,
    forward_failures: AtomicU64,
}

/// Point-in-time copy of `ProxyStats`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active_connections: usize,
    pub active_pairs: usize,
    pub bytes_forwarded: u64,
    pub forward_failures: u64,
}

impl ProxyStats {
    pub(crate) fn accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn pair_opened(&self) {
        self.active_pairs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pair_closed(&self) {
        self.active_pairs.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_forwarded(&self, bytes: usize) {
        self.bytes_forwarded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn forward_failed(&self) {
        self.forward_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_pairs(&self) -> usize {
        self.active_pairs.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            active_pairs: self.active_pairs.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
        }
    }
}
