//! Pinned transactions for batch work.
//!
//! A pinned transaction holds one leased session for its whole life and is
//! never retried internally: the caller runs any number of bodies against it
//! and then decides to commit or roll back. Dropping it while still active
//! rolls the work back and returns the session to its pool.

use crate::db::session::{LeasedSession, Session};
use crate::error::{DbError, DbResult};
use crate::models::TransactionState;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

pub struct PinnedTransaction<S: Session> {
    id: String,
    started_at: DateTime<Utc>,
    state: TransactionState,
    resource: String,
    /// `None` once committed or rolled back.
    lease: Option<LeasedSession<S>>,
}

impl<S: Session> PinnedTransaction<S> {
    /// Wrap an already configured lease.
    pub(crate) fn new(lease: LeasedSession<S>, resource: String) -> Self {
        let id = generate_transaction_id();
        info!(transaction_id = %id, resource = %resource, "Pinned transaction started");
        Self {
            id,
            started_at: Utc::now(),
            state: TransactionState::Active,
            resource,
            lease: Some(lease),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Run `body` inside the transaction without committing.
    ///
    /// A failing body leaves the transaction active; the caller decides
    /// whether to roll back.
    pub async fn run<T, F>(&mut self, body: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut S) -> BoxFuture<'c, DbResult<T>>,
    {
        let session = self.active_lease()?.session()?;
        let result = body(session).await;
        if let Err(e) = &result {
            debug!(transaction_id = %self.id, error = %e, "Pinned transaction body failed");
        }
        result
    }

    /// Commit and release the session.
    ///
    /// If the commit fails the work is rolled back and the transaction ends
    /// in [`TransactionState::RolledBack`].
    pub async fn commit(&mut self) -> DbResult<()> {
        self.active_lease()?;
        let Some(mut lease) = self.lease.take() else {
            return Err(self.ended_error());
        };

        let committed = match lease.session() {
            Ok(session) => session.commit().await,
            Err(e) => Err(e),
        };
        match &committed {
            Ok(()) => {
                self.state = TransactionState::Committed;
                info!(transaction_id = %self.id, "Pinned transaction committed");
            }
            Err(e) => {
                warn!(transaction_id = %self.id, error = %e, "Commit failed, rolling back");
                lease.rollback_quietly().await;
                self.state = TransactionState::RolledBack;
            }
        }

        lease.release().await;
        committed
    }

    /// Discard all work and release the session.
    pub async fn rollback(&mut self) -> DbResult<()> {
        self.active_lease()?;
        let Some(mut lease) = self.lease.take() else {
            return Err(self.ended_error());
        };

        let rolled_back = match lease.session() {
            Ok(session) => session.rollback().await,
            Err(e) => Err(e),
        };
        self.state = TransactionState::RolledBack;
        lease.release().await;

        info!(transaction_id = %self.id, "Pinned transaction rolled back");
        rolled_back
    }

    fn active_lease(&mut self) -> DbResult<&mut LeasedSession<S>> {
        if self.state.is_ended() {
            return Err(self.ended_error());
        }
        let id = &self.id;
        self.lease
            .as_mut()
            .ok_or_else(|| DbError::transaction("Transaction is no longer active", id.as_str()))
    }

    fn ended_error(&self) -> DbError {
        DbError::transaction(
            format!("Transaction is no longer active ({:?})", self.state),
            self.id.as_str(),
        )
    }
}

impl<S: Session> std::fmt::Debug for PinnedTransaction<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedTransaction")
            .field("id", &self.id)
            .field("started_at", &self.started_at)
            .field("state", &self.state)
            .field("resource", &self.resource)
            .finish()
    }
}

fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
