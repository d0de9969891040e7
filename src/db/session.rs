//! Leased database sessions.
//!
//! [`SessionSource`] and [`Session`] are the seam between the transaction
//! engine and a physical pool. The sqlx-backed implementation lives in
//! [`pool`](super::pool); tests drive the engine with in-memory doubles.

use crate::error::{DbError, DbResult};
use crate::models::IsolationLevel;
use std::future::Future;
use tracing::warn;

/// A leased handle to a physical database session.
///
/// Owned exclusively by the code path that leased it. Dropping it returns the
/// connection to its pool; [`close`](Session::close) discards it instead.
pub trait Session: Send + 'static {
    fn isolation_level(&self) -> IsolationLevel;

    fn autocommit(&self) -> bool;

    /// `IsolationLevel::None` leaves the current level untouched.
    fn set_isolation_level(
        &mut self,
        level: IsolationLevel,
    ) -> impl Future<Output = DbResult<()>> + Send;

    /// Turning autocommit off opens a transaction; turning it back on
    /// discards whatever that transaction still holds.
    fn set_autocommit(&mut self, enabled: bool) -> impl Future<Output = DbResult<()>> + Send;

    fn commit(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    fn rollback(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    /// Close the underlying connection instead of returning it to the pool.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Something that leases sessions: a bootstrapped connection pool.
pub trait SessionSource: Send + Sync + 'static {
    type Session: Session;

    /// Wait for a free pooled connection.
    fn acquire(&self) -> impl Future<Output = DbResult<Self::Session>> + Send;

    /// Release the pool and every idle connection it holds.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Pool defaults captured at lease time, restored before release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionDefaults {
    pub isolation_level: IsolationLevel,
    pub autocommit: bool,
}

impl SessionDefaults {
    pub fn capture<S: Session>(session: &S) -> Self {
        Self {
            isolation_level: session.isolation_level(),
            autocommit: session.autocommit(),
        }
    }
}

/// Scoped lease of a session.
///
/// Restores the captured defaults on every exit path. Prefer
/// [`release`](Self::release); if the lease is dropped instead (panic in a
/// transaction body, cancelled future) restoration runs on a spawned task.
///
/// A session whose defaults cannot be restored is closed, never pooled.
pub struct LeasedSession<S: Session> {
    /// Only taken by `release` or `Drop`.
    session: Option<S>,
    defaults: SessionDefaults,
    resource: String,
}

impl<S: Session> LeasedSession<S> {
    pub fn new(session: S, resource: impl Into<String>) -> Self {
        let defaults = SessionDefaults::capture(&session);
        Self {
            session: Some(session),
            defaults,
            resource: resource.into(),
        }
    }

    pub fn defaults(&self) -> SessionDefaults {
        self.defaults
    }

    /// Set the requested isolation level and disable autocommit.
    pub async fn configure(&mut self, isolation_level: IsolationLevel) -> DbResult<()> {
        let session = self.session()?;
        session.set_isolation_level(isolation_level).await?;
        session.set_autocommit(false).await
    }

    /// The leased session; an error once it has been handed back.
    pub fn session(&mut self) -> DbResult<&mut S> {
        let resource = &self.resource;
        self.session.as_mut().ok_or_else(|| {
            DbError::internal(format!("Session for '{}' was already released", resource))
        })
    }

    /// Roll back whatever the session holds, logging instead of failing.
    pub async fn rollback_quietly(&mut self) {
        let rolled_back = match self.session() {
            Ok(session) => session.rollback().await,
            Err(e) => Err(e),
        };
        if let Err(e) = rolled_back {
            warn!(resource = %self.resource, error = %e, "Rollback failed");
        }
    }

    /// Restore defaults and hand the connection back to the pool.
    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            restore(session, self.defaults, &self.resource).await;
        }
    }
}

impl<S: Session> Drop for LeasedSession<S> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let defaults = self.defaults;
        let resource = std::mem::take(&mut self.resource);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    restore(session, defaults, &resource).await;
                    warn!(resource = %resource, "Session released via Drop - transaction was abandoned");
                });
            }
            Err(_) => {
                // No runtime to restore on; dropping returns it to a pool that is going away anyway.
                warn!(resource = %resource, "Session dropped outside of a runtime");
            }
        }
    }
}

async fn restore<S: Session>(mut session: S, defaults: SessionDefaults, resource: &str) {
    let restored = match session.set_autocommit(defaults.autocommit).await {
        Ok(()) => session.set_isolation_level(defaults.isolation_level).await,
        Err(e) => Err(e),
    };

    if let Err(e) = restored {
        warn!(
            resource = %resource,
            error = %e,
            "Failed to restore session defaults, closing connection"
        );
        session.close().await;
    }
}
