//! Pool bootstrap that tolerates a database which is not reachable yet.
//!
//! Construction is retried at a fixed interval while the failure belongs to
//! the "unreachable / still starting" class, until it succeeds, the time
//! budget runs out ([`DbError::PoolUnavailable`]), or shutdown is requested
//! ([`DbError::ShutdownRequested`]). Any other failure ends the wait at once.

use crate::config::BootstrapOptions;
use crate::db::events::{EventSink, StorageEvent};
use crate::error::{DbError, DbResult};
use std::future::Future;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Run `connect` until it yields a pool or the wait is over.
pub async fn bootstrap_with_retry<T, F, Fut>(
    resource: &str,
    options: &BootstrapOptions,
    shutdown: &CancellationToken,
    events: &dyn EventSink,
    mut connect: F,
) -> DbResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let started = Instant::now();
    let max_wait = options.max_wait();
    let retry_interval = options.retry_interval();
    let mut attempt: u32 = 0;

    loop {
        if shutdown.is_cancelled() {
            info!(resource = %resource, "Shutdown requested, abandoning pool bootstrap");
            return Err(DbError::ShutdownRequested);
        }

        attempt += 1;
        debug!(resource = %resource, attempt, "Constructing connection pool");
        let outcome = tokio::select! {
            outcome = connect() => outcome,
            _ = shutdown.cancelled() => {
                info!(resource = %resource, "Shutdown requested while connecting, abandoning pool bootstrap");
                return Err(DbError::ShutdownRequested);
            }
        };
        let error = match outcome {
            Ok(pool) => {
                events.record(StorageEvent::BootstrapSucceeded {
                    resource: resource.to_string(),
                    attempts: attempt,
                });
                return Ok(pool);
            }
            Err(e) => e,
        };

        let elapsed = started.elapsed();
        if !error.is_unreachable() {
            events.record(StorageEvent::BootstrapFailed {
                resource: resource.to_string(),
                waited_secs: elapsed.as_secs(),
            });
            return Err(error);
        }

        if elapsed >= max_wait {
            events.record(StorageEvent::BootstrapFailed {
                resource: resource.to_string(),
                waited_secs: elapsed.as_secs(),
            });
            return Err(DbError::pool_unavailable(
                resource,
                elapsed.as_secs(),
                error.to_string(),
            ));
        }

        let remaining = max_wait - elapsed;
        events.record(StorageEvent::BootstrapWaiting {
            resource: resource.to_string(),
            attempt,
            remaining_secs: remaining.as_secs(),
        });

        tokio::select! {
            _ = tokio::time::sleep(retry_interval.min(remaining)) => {}
            _ = shutdown.cancelled() => {
                info!(resource = %resource, "Shutdown requested while waiting for database");
                return Err(DbError::ShutdownRequested);
            }
        }
    }
}
