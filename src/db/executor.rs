//! Retrying transaction executor.
//!
//! Each attempt runs `ACQUIRE -> CONFIGURE -> EXECUTE_BODY -> COMMIT -> RELEASE`.
//! A failure in the body or in commit rolls back (best effort), releases the
//! session and is classified: retryable conflicts loop back through the retry
//! profile, anything else propagates unchanged. A successful commit is
//! terminal, so retries never happen after a commit.

use crate::db::classifier::classify;
use crate::db::events::{EventSink, StorageEvent, TracingEventSink};
use crate::db::pinned::PinnedTransaction;
use crate::db::retry::{RetryDecision, RetryProfile};
use crate::db::session::{LeasedSession, Session, SessionSource};
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, TransactionAttempt};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Administrative on/off switch for one storage target.
#[derive(Debug, Default)]
pub struct StorageSwitch {
    disabled: AtomicBool,
}

impl StorageSwitch {
    pub fn new(disabled: bool) -> Self {
        Self {
            disabled: AtomicBool::new(disabled),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Release);
    }
}

/// Looks up the pool an executor leases from, once per attempt.
pub type PoolResolver<P> = Arc<dyn Fn() -> BoxFuture<'static, DbResult<Arc<P>>> + Send + Sync>;

/// Runs transaction bodies against one pool with conflict retries.
pub struct TransactionExecutor<P: SessionSource> {
    resolver: PoolResolver<P>,
    resource: String,
    profile: RetryProfile,
    events: Arc<dyn EventSink>,
    switch: Arc<StorageSwitch>,
    shutdown: CancellationToken,
}

impl<P: SessionSource> Clone for TransactionExecutor<P> {
    fn clone(&self) -> Self {
        Self {
            resolver: Arc::clone(&self.resolver),
            resource: self.resource.clone(),
            profile: self.profile,
            events: Arc::clone(&self.events),
            switch: Arc::clone(&self.switch),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<P: SessionSource> TransactionExecutor<P> {
    /// Executor over a fixed pool with the default retry profile, a tracing
    /// sink, storage enabled and its own shutdown token.
    pub fn new(source: Arc<P>, resource: impl Into<String>) -> Self {
        Self::with_resolver(
            Arc::new(move || -> BoxFuture<'static, DbResult<Arc<P>>> {
                let source = Arc::clone(&source);
                Box::pin(async move { Ok(source) })
            }),
            resource,
        )
    }

    /// Executor that asks `resolver` for the current pool on every acquire,
    /// so a pool that was shut down and bootstrapped again is picked up.
    pub fn with_resolver(resolver: PoolResolver<P>, resource: impl Into<String>) -> Self {
        Self {
            resolver,
            resource: resource.into(),
            profile: RetryProfile::Default,
            events: Arc::new(TracingEventSink::new()),
            switch: Arc::new(StorageSwitch::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_profile(mut self, profile: RetryProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_switch(mut self, switch: Arc<StorageSwitch>) -> Self {
        self.switch = switch;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn profile(&self) -> RetryProfile {
        self.profile
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Run `body` in a transaction at `isolation_level`, committing on success.
    ///
    /// `body` may be invoked once per attempt, so it must be repeatable.
    /// Errors: the body's own error for non-conflict failures,
    /// [`DbError::RetriesExhausted`] when conflicts outlast the profile,
    /// [`DbError::StorageDisabled`] and [`DbError::ShutdownRequested`].
    pub async fn run<T, F>(&self, isolation_level: IsolationLevel, mut body: F) -> DbResult<T>
    where
        F: for<'c> FnMut(&'c mut P::Session) -> BoxFuture<'c, DbResult<T>>,
    {
        let mut number: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(DbError::ShutdownRequested);
            }

            number += 1;
            let attempt = TransactionAttempt::new(number, isolation_level);
            let error = match self.attempt(&attempt, &mut body).await {
                Ok(value) => {
                    debug!(
                        resource = %self.resource,
                        attempt = attempt.number,
                        elapsed_ms = attempt.elapsed_ms() as u64,
                        "Transaction committed"
                    );
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !classify(&error).is_retryable() {
                return Err(error);
            }

            match self.profile.next(number) {
                RetryDecision::Stop => {
                    self.events.record(StorageEvent::ConflictRetriesExhausted {
                        resource: self.resource.clone(),
                        attempts: number,
                    });
                    return Err(DbError::retries_exhausted(number, error));
                }
                RetryDecision::Sleep(backoff) => {
                    self.events.record(StorageEvent::ConflictRetrying {
                        resource: self.resource.clone(),
                        attempt: number,
                    });
                    debug!(
                        resource = %self.resource,
                        attempt = number,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Backing off before retrying transaction"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.cancelled() => {
                            warn!(
                                resource = %self.resource,
                                error = %error,
                                "Shutdown requested, not retrying conflicting transaction"
                            );
                            return Err(DbError::ShutdownRequested);
                        }
                    }
                }
            }
        }
    }

    /// [`run`](Self::run) at the default `SERIALIZABLE` level.
    pub async fn run_serializable<T, F>(&self, body: F) -> DbResult<T>
    where
        F: for<'c> FnMut(&'c mut P::Session) -> BoxFuture<'c, DbResult<T>>,
    {
        self.run(IsolationLevel::default(), body).await
    }

    /// Lease and configure a session whose commit is left to the caller.
    ///
    /// Used by batch imports that must discard all work when any item fails.
    pub async fn begin_pinned(
        &self,
        isolation_level: IsolationLevel,
    ) -> DbResult<PinnedTransaction<P::Session>> {
        let lease = self.lease(isolation_level).await?;
        Ok(PinnedTransaction::new(lease, self.resource.clone()))
    }

    async fn attempt<T, F>(&self, attempt: &TransactionAttempt, body: &mut F) -> DbResult<T>
    where
        F: for<'c> FnMut(&'c mut P::Session) -> BoxFuture<'c, DbResult<T>>,
    {
        let mut lease = self.lease(attempt.isolation_level).await?;

        let outcome: DbResult<T> = async {
            let value = body(lease.session()?).await?;
            lease.session()?.commit().await?;
            Ok(value)
        }
        .await;

        if let Err(e) = &outcome {
            debug!(
                resource = %self.resource,
                attempt = attempt.number,
                error = %e,
                "Transaction attempt failed, rolling back"
            );
            lease.rollback_quietly().await;
        }

        lease.release().await;
        outcome
    }

    /// ACQUIRE + CONFIGURE. The lease is released again if configuring fails.
    async fn lease(&self, isolation_level: IsolationLevel) -> DbResult<LeasedSession<P::Session>> {
        if self.shutdown.is_cancelled() {
            return Err(DbError::ShutdownRequested);
        }
        if self.switch.is_disabled() {
            return Err(DbError::storage_disabled(&self.resource));
        }

        let source = (self.resolver)().await?;
        let session = source.acquire().await?;
        let mut lease = LeasedSession::new(session, self.resource.clone());
        if let Err(e) = lease.configure(isolation_level).await {
            lease.rollback_quietly().await;
            lease.release().await;
            return Err(e);
        }
        Ok(lease)
    }
}

impl<P: SessionSource> std::fmt::Debug for TransactionExecutor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionExecutor")
            .field("resource", &self.resource)
            .field("profile", &self.profile)
            .field("disabled", &self.switch.is_disabled())
            .finish_non_exhaustive()
    }
}
