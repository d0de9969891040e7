//! Diagnostic events emitted by the transaction and bootstrap engines.
//!
//! Events never influence control flow; a sink only observes them.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

/// Discrete events reported to the observability sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    ConflictRetrying { resource: String, attempt: u32 },
    ConflictRetriesExhausted { resource: String, attempts: u32 },
    BootstrapWaiting {
        resource: String,
        attempt: u32,
        remaining_secs: u64,
    },
    BootstrapSucceeded { resource: String, attempts: u32 },
    BootstrapFailed { resource: String, waited_secs: u64 },
}

/// Receiver of storage events.
pub trait EventSink: Send + Sync + 'static {
    fn record(&self, event: StorageEvent);
}

/// Per-kind event counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub conflicts_retrying: u64,
    pub conflicts_exhausted: u64,
    pub bootstrap_waiting: u64,
    pub bootstrap_succeeded: u64,
    pub bootstrap_failed: u64,
}

/// Default sink: logs through `tracing` and counts each kind.
#[derive(Debug, Default)]
pub struct TracingEventSink {
    conflicts_retrying: AtomicU64,
    conflicts_exhausted: AtomicU64,
    bootstrap_waiting: AtomicU64,
    bootstrap_succeeded: AtomicU64,
    bootstrap_failed: AtomicU64,
}

impl TracingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> EventCounts {
        EventCounts {
            conflicts_retrying: self.conflicts_retrying.load(Ordering::Relaxed),
            conflicts_exhausted: self.conflicts_exhausted.load(Ordering::Relaxed),
            bootstrap_waiting: self.bootstrap_waiting.load(Ordering::Relaxed),
            bootstrap_succeeded: self.bootstrap_succeeded.load(Ordering::Relaxed),
            bootstrap_failed: self.bootstrap_failed.load(Ordering::Relaxed),
        }
    }
}

impl EventSink for TracingEventSink {
    fn record(&self, event: StorageEvent) {
        match &event {
            StorageEvent::ConflictRetrying { resource, attempt } => {
                self.conflicts_retrying.fetch_add(1, Ordering::Relaxed);
                warn!(resource = %resource, attempt, "Transaction conflict detected, retrying");
            }
            StorageEvent::ConflictRetriesExhausted { resource, attempts } => {
                self.conflicts_exhausted.fetch_add(1, Ordering::Relaxed);
                error!(resource = %resource, attempts, "Transaction conflict persisted, giving up");
            }
            StorageEvent::BootstrapWaiting {
                resource,
                attempt,
                remaining_secs,
            } => {
                self.bootstrap_waiting.fetch_add(1, Ordering::Relaxed);
                warn!(
                    resource = %resource,
                    attempt,
                    remaining_secs,
                    "Database not reachable yet, waiting before retrying pool bootstrap"
                );
            }
            StorageEvent::BootstrapSucceeded { resource, attempts } => {
                self.bootstrap_succeeded.fetch_add(1, Ordering::Relaxed);
                info!(resource = %resource, attempts, "Connection pool bootstrapped");
            }
            StorageEvent::BootstrapFailed {
                resource,
                waited_secs,
            } => {
                self.bootstrap_failed.fetch_add(1, Ordering::Relaxed);
                error!(resource = %resource, waited_secs, "Connection pool bootstrap failed");
            }
        }
    }
}
