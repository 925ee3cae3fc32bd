#![allow(dead_code)]

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use logbook_verification::api::AppState;
use logbook_verification::audit::{ActorContext, AuditLogger, AuditSink};
use logbook_verification::database::models::{EntryPayload, GrantRole, LogbookEntry};
use logbook_verification::database::Database;
use logbook_verification::entries::EntryStore;
use logbook_verification::grants::GrantStore;
use logbook_verification::identity::SqlIdentityProvider;
use logbook_verification::tasks::{RetryPolicy, TaskQueue, TaskWorker};
use logbook_verification::verification::{
    EntryUpdateInvalidator, ReviewStateMachine, VerificationLedger, VerifierBackfill,
};

pub const INSTITUTION: i64 = 1;
pub const OTHER_INSTITUTION: i64 = 2;

/// Every component wired against one database and a temporary audit file.
pub struct TestEnv {
    pub db: Database,
    pub audit: AuditLogger,
    pub grants: GrantStore,
    pub entries: EntryStore,
    pub machine: ReviewStateMachine,
    pub ledger: VerificationLedger,
    pub backfill: VerifierBackfill,
    pub invalidator: EntryUpdateInvalidator,
    _dir: TempDir,
}

/// A logbook with an owner, a supervisor and an admin of the same institution
pub struct Participants {
    pub logbook_id: i64,
    pub owner: ActorContext,
    pub supervisor: ActorContext,
    pub admin: ActorContext,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_batch_size(100).await
    }

    pub async fn with_batch_size(batch_size: u32) -> Self {
        let db = Database::new_in_memory()
            .await
            .expect("Failed to create test database");
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        Self::build(db, dir, batch_size).await
    }

    /// WAL database file with a multi-connection pool, so concurrent calls
    /// really contend for the write lock
    pub async fn file_backed(batch_size: u32) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db = Database::open(&dir.path().join("logbook.db"))
            .await
            .expect("Failed to open test database");
        Self::build(db, dir, batch_size).await
    }

    async fn build(db: Database, dir: TempDir, batch_size: u32) -> Self {
        let audit = AuditLogger::new(dir.path().join("audit.jsonl"), "test-server")
            .await
            .expect("Failed to open audit log");
        let sink: Arc<dyn AuditSink> = Arc::new(audit.clone());

        let pool = db.pool().clone();
        let identity = Arc::new(SqlIdentityProvider::new(pool.clone()));
        let ledger = VerificationLedger::new(pool.clone(), sink.clone());

        Self {
            grants: GrantStore::new(pool.clone(), sink.clone()),
            entries: EntryStore::new(pool.clone()),
            machine: ReviewStateMachine::new(pool.clone(), identity, sink.clone()),
            backfill: VerifierBackfill::new(pool.clone(), batch_size),
            invalidator: EntryUpdateInvalidator::new(
                pool,
                sink,
                ["updated_at".to_string(), "modified_at".to_string()],
            ),
            ledger,
            db,
            audit,
            _dir: dir,
        }
    }

    pub async fn user(&self, name: &str) -> ActorContext {
        let id = self
            .db
            .create_user(name, Some(INSTITUTION), false)
            .await
            .expect("Failed to create user");
        ActorContext::new(id)
            .with_origin(Some("127.0.0.1".to_string()), Some("test-agent".to_string()))
    }

    pub async fn admin(&self, name: &str, institution_id: i64) -> ActorContext {
        let id = self
            .db
            .create_user(name, Some(institution_id), true)
            .await
            .expect("Failed to create admin");
        ActorContext::new(id)
    }

    pub async fn grant(&self, user: &ActorContext, logbook_id: i64, role: GrantRole) {
        let system = ActorContext::new(0);
        self.grants
            .create_grant(&system, user.user_id, logbook_id, role)
            .await
            .expect("Failed to create grant");
    }

    pub async fn participants(&self) -> Participants {
        let logbook_id = self
            .db
            .create_logbook(INSTITUTION, "Clinical rotations")
            .await
            .expect("Failed to create logbook");
        let owner = self.user(&format!("owner-{}", logbook_id)).await;
        let supervisor = self.user(&format!("supervisor-{}", logbook_id)).await;
        let admin = self.admin(&format!("admin-{}", logbook_id), INSTITUTION).await;

        self.grant(&owner, logbook_id, GrantRole::Owner).await;
        self.grant(&supervisor, logbook_id, GrantRole::Supervisor).await;

        Participants {
            logbook_id,
            owner,
            supervisor,
            admin,
        }
    }

    pub async fn entry(&self, logbook_id: i64, author: &ActorContext, amount: i64) -> LogbookEntry {
        self.entries
            .create_entry(logbook_id, author.user_id, payload(amount))
            .await
            .expect("Failed to create entry")
    }

    /// State wired to a live worker, for exercising the HTTP surface
    pub fn app_state(&self) -> AppState {
        let (tasks, receiver) = TaskQueue::channel();
        TaskWorker::new(self.backfill.clone(), self.invalidator.clone(), fast_retry()).spawn(receiver);

        AppState {
            db: self.db.clone(),
            machine: self.machine.clone(),
            ledger: self.ledger.clone(),
            tasks,
            server_id: "test-server".to_string(),
        }
    }
}

pub fn payload(amount: i64) -> EntryPayload {
    let value = json!({"amount": amount, "site": "ward 3", "updated_at": "2026-01-01T00:00:00Z"});
    serde_json::from_value(value).expect("valid payload")
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

/// Poll until `check` holds; background tasks finish on their own schedule
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
