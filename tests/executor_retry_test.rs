//! Integration tests for the retrying transaction executor.
//!
//! Driven by an in-memory session source so conflicts, commit failures and
//! restore failures can be scripted without a database.

use authstore_sql::db::{
    EventSink, RetryProfile, Session, SessionSource, StorageEvent, StorageSwitch,
    TransactionExecutor,
};
use authstore_sql::error::{DbError, DbResult};
use authstore_sql::models::{IsolationLevel, TransactionState};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const POOL_DEFAULT: IsolationLevel = IsolationLevel::ReadCommitted;

/// Everything the fake pool observed.
#[derive(Default)]
struct Ledger {
    acquired: AtomicU32,
    commits: AtomicU32,
    rollbacks: AtomicU32,
    closed: AtomicU32,
    /// Commits that fail with a serialization conflict before one succeeds.
    commit_conflicts: AtomicU32,
    /// State of each session as it went back into the pool.
    returned: Mutex<Vec<(IsolationLevel, bool)>>,
}

impl Ledger {
    fn returned(&self) -> Vec<(IsolationLevel, bool)> {
        self.returned.lock().unwrap().clone()
    }
}

struct FakePool {
    ledger: Arc<Ledger>,
    fail_restore: bool,
}

impl FakePool {
    fn new() -> (Arc<Self>, Arc<Ledger>) {
        let ledger = Arc::new(Ledger::default());
        let pool = Arc::new(Self {
            ledger: Arc::clone(&ledger),
            fail_restore: false,
        });
        (pool, ledger)
    }
}

impl SessionSource for FakePool {
    type Session = FakeSession;

    async fn acquire(&self) -> DbResult<FakeSession> {
        self.ledger.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession {
            ledger: Arc::clone(&self.ledger),
            isolation: POOL_DEFAULT,
            autocommit: true,
            fail_restore: self.fail_restore,
            closed: false,
        })
    }

    async fn close(&self) {}
}

struct FakeSession {
    ledger: Arc<Ledger>,
    isolation: IsolationLevel,
    autocommit: bool,
    fail_restore: bool,
    closed: bool,
}

impl Session for FakeSession {
    fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    fn autocommit(&self) -> bool {
        self.autocommit
    }

    async fn set_isolation_level(&mut self, level: IsolationLevel) -> DbResult<()> {
        if level != IsolationLevel::None {
            self.isolation = level;
        }
        Ok(())
    }

    async fn set_autocommit(&mut self, enabled: bool) -> DbResult<()> {
        if enabled && self.fail_restore {
            return Err(DbError::connection("connection reset by peer", "reconnect"));
        }
        self.autocommit = enabled;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        let pending = self.ledger.commit_conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.ledger.commit_conflicts.store(pending - 1, Ordering::SeqCst);
            return Err(serialization_failure());
        }
        self.ledger.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.ledger.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(mut self) {
        self.closed = true;
        self.ledger.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if !self.closed {
            self.ledger
                .returned
                .lock()
                .unwrap()
                .push((self.isolation, self.autocommit));
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<StorageEvent>>,
}

impl RecordingSink {
    fn retrying(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, StorageEvent::ConflictRetrying { .. }))
            .count()
    }

    fn exhausted(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, StorageEvent::ConflictRetriesExhausted { .. }))
            .count()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: StorageEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn deadlock() -> DbError {
    DbError::database(
        "deadlock detected",
        Some("40P01".to_string()),
        "Retry the transaction",
    )
}

fn serialization_failure() -> DbError {
    DbError::database(
        "could not serialize access due to concurrent update",
        Some("40001".to_string()),
        "Retry the transaction",
    )
}

fn executor(pool: Arc<FakePool>, sink: Arc<RecordingSink>) -> TransactionExecutor<FakePool> {
    TransactionExecutor::new(pool, "fake").with_events(sink)
}

#[tokio::test]
async fn test_default_profile_gives_up_after_three_attempts() {
    tokio::time::pause();
    let (pool, ledger) = FakePool::new();
    let sink = Arc::new(RecordingSink::default());
    let calls = Arc::new(AtomicU32::new(0));

    let result: DbResult<()> = executor(pool, Arc::clone(&sink))
        .run_serializable(|_session| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(serialization_failure())
            })
        })
        .await;

    match result {
        Err(DbError::RetriesExhausted { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert_eq!(source.sql_state(), Some("40001"));
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(ledger.commits.load(Ordering::SeqCst), 0);
    assert_eq!(ledger.rollbacks.load(Ordering::SeqCst), 3);
    assert_eq!(sink.retrying(), 2);
    assert_eq!(sink.exhausted(), 1);
}

#[tokio::test]
async fn test_bulk_profile_recovers_after_49_conflicts() {
    tokio::time::pause();
    let (pool, ledger) = FakePool::new();
    let sink = Arc::new(RecordingSink::default());
    let calls = Arc::new(AtomicU32::new(0));

    let result = executor(pool, Arc::clone(&sink))
        .with_profile(RetryProfile::Bulk)
        .run_serializable(|_session| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 50 {
                    // No SQLSTATE: recognized by message alone
                    Err(DbError::internal(
                        "could not serialize access due to concurrent update",
                    ))
                } else {
                    Ok(n)
                }
            })
        })
        .await;

    assert_eq!(result.unwrap(), 50);
    assert_eq!(ledger.commits.load(Ordering::SeqCst), 1);
    assert_eq!(sink.retrying(), 49);
    assert_eq!(sink.exhausted(), 0);
}

#[tokio::test]
async fn test_bulk_profile_gives_up_after_fifty_attempts() {
    tokio::time::pause();
    let (pool, _ledger) = FakePool::new();
    let sink = Arc::new(RecordingSink::default());
    let calls = Arc::new(AtomicU32::new(0));

    let result: DbResult<()> = executor(pool, Arc::clone(&sink))
        .with_profile(RetryProfile::Bulk)
        .run_serializable(|_session| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(deadlock())
            })
        })
        .await;

    assert!(matches!(
        result,
        Err(DbError::RetriesExhausted { attempts: 50, .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 50);
}

#[tokio::test]
async fn test_deadlock_then_success_emits_one_retry_event() {
    tokio::time::pause();
    let (pool, ledger) = FakePool::new();
    let sink = Arc::new(RecordingSink::default());
    let calls = Arc::new(AtomicU32::new(0));

    let result = executor(pool, Arc::clone(&sink))
        .run_serializable(|_session| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(deadlock())
                } else {
                    Ok("session-row")
                }
            })
        })
        .await;

    assert_eq!(result.unwrap(), "session-row");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(ledger.commits.load(Ordering::SeqCst), 1);
    assert_eq!(sink.retrying(), 1);
}

#[tokio::test]
async fn test_non_retryable_error_is_attempted_once() {
    let (pool, ledger) = FakePool::new();
    let sink = Arc::new(RecordingSink::default());
    let calls = Arc::new(AtomicU32::new(0));

    let result: DbResult<()> = executor(pool, Arc::clone(&sink))
        .run_serializable(|_session| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DbError::database(
                    "duplicate key value violates unique constraint",
                    Some("23505".to_string()),
                    "Use a different key",
                ))
            })
        })
        .await;

    match result {
        Err(e @ DbError::Database { .. }) => assert_eq!(e.sql_state(), Some("23505")),
        other => panic!("expected the original error, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.commits.load(Ordering::SeqCst), 0);
    assert_eq!(sink.retrying(), 0);
}

#[tokio::test]
async fn test_commit_conflict_is_retried_and_success_is_not() {
    tokio::time::pause();
    let (pool, ledger) = FakePool::new();
    ledger.commit_conflicts.store(1, Ordering::SeqCst);
    let sink = Arc::new(RecordingSink::default());
    let calls = Arc::new(AtomicU32::new(0));

    let result = executor(pool, Arc::clone(&sink))
        .run_serializable(|_session| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .await;

    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(ledger.commits.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.acquired.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_body_sees_requested_isolation_and_defaults_are_restored() {
    let (pool, ledger) = FakePool::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    executor(pool, Arc::new(RecordingSink::default()))
        .run(IsolationLevel::RepeatableRead, |session| {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                seen.lock()
                    .unwrap()
                    .push((session.isolation_level(), session.autocommit()));
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![(IsolationLevel::RepeatableRead, false)]
    );
    assert_eq!(ledger.returned(), vec![(POOL_DEFAULT, true)]);
}

#[tokio::test]
async fn test_isolation_none_keeps_pool_level() {
    let (pool, _ledger) = FakePool::new();
    let seen = Arc::new(Mutex::new(None));

    executor(pool, Arc::new(RecordingSink::default()))
        .run(IsolationLevel::None, |session| {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                *seen.lock().unwrap() = Some(session.isolation_level());
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), Some(POOL_DEFAULT));
}

#[tokio::test]
async fn test_every_attempt_restores_defaults() {
    tokio::time::pause();
    let (pool, ledger) = FakePool::new();

    let _ = executor(pool, Arc::new(RecordingSink::default()))
        .run(IsolationLevel::Serializable, |_session| {
            Box::pin(async { Err::<(), _>(deadlock()) })
        })
        .await;

    let returned = ledger.returned();
    assert_eq!(returned.len(), 3);
    assert!(returned.iter().all(|state| *state == (POOL_DEFAULT, true)));
}

#[tokio::test]
async fn test_session_that_cannot_be_restored_is_closed() {
    let ledger = Arc::new(Ledger::default());
    let pool = Arc::new(FakePool {
        ledger: Arc::clone(&ledger),
        fail_restore: true,
    });

    executor(pool, Arc::new(RecordingSink::default()))
        .run_serializable(|_session| Box::pin(async { Ok(()) }))
        .await
        .unwrap();

    assert_eq!(ledger.closed.load(Ordering::SeqCst), 1);
    assert!(ledger.returned().is_empty());
}

#[tokio::test]
async fn test_disabled_storage_fails_without_acquiring() {
    let (pool, ledger) = FakePool::new();
    let switch = Arc::new(StorageSwitch::new(true));

    let result = executor(pool, Arc::new(RecordingSink::default()))
        .with_switch(Arc::clone(&switch))
        .run_serializable(|_session| Box::pin(async { Ok(()) }))
        .await;

    assert!(matches!(result, Err(DbError::StorageDisabled { .. })));
    assert_eq!(ledger.acquired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_shutdown_prevents_new_attempts() {
    let (pool, ledger) = FakePool::new();
    let shutdown = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));

    let result: DbResult<()> = executor(pool, Arc::new(RecordingSink::default()))
        .with_shutdown(shutdown.clone())
        .run_serializable(|_session| {
            let calls = Arc::clone(&calls);
            let shutdown = shutdown.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // The attempt in flight finishes; no further attempt starts
                shutdown.cancel();
                Err(deadlock())
            })
        })
        .await;

    assert!(matches!(result, Err(DbError::ShutdownRequested)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.returned().len(), 1);
}

#[tokio::test]
async fn test_pinned_transaction_never_commits_on_its_own() {
    let (pool, ledger) = FakePool::new();
    let exec = executor(pool, Arc::new(RecordingSink::default()));

    let mut tx = exec
        .begin_pinned(IsolationLevel::Serializable)
        .await
        .unwrap();
    assert!(tx.id().starts_with("tx_"));

    for _ in 0..3 {
        tx.run(|session| {
            Box::pin(async move {
                assert!(!session.autocommit());
                Ok(())
            })
        })
        .await
        .unwrap();
    }
    assert_eq!(ledger.commits.load(Ordering::SeqCst), 0);

    tx.rollback().await.unwrap();
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(ledger.commits.load(Ordering::SeqCst), 0);
    assert_eq!(ledger.rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.returned(), vec![(POOL_DEFAULT, true)]);

    let after = tx.run(|_session| Box::pin(async { Ok(()) })).await;
    assert!(matches!(after, Err(DbError::Transaction { .. })));
    assert!(tx.commit().await.is_err());
}

#[tokio::test]
async fn test_dropped_pinned_transaction_is_restored_in_background() {
    let (pool, ledger) = FakePool::new();
    let exec = executor(pool, Arc::new(RecordingSink::default()));

    let tx = exec
        .begin_pinned(IsolationLevel::Serializable)
        .await
        .unwrap();
    assert_eq!(tx.state(), TransactionState::Active);
    drop(tx);

    for _ in 0..50 {
        if !ledger.returned().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ledger.returned(), vec![(POOL_DEFAULT, true)]);
    assert_eq!(ledger.commits.load(Ordering::SeqCst), 0);
}
