pub mod models;
pub mod queries;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::VerificationError;

pub const INITIAL_SCHEMA: &str = include_str!("../../migrations/001_initial_schema.sql");

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        info!("Connected to {}", database_url);
        Ok(Database { pool })
    }

    /// Single shared connection; every pool connection to `:memory:` would
    /// otherwise see its own empty database.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let database = Database { pool };
        database.run_migrations().await?;
        Ok(database)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Path-backed database with the schema applied, for tests and tools
    pub async fn open(path: &std::path::Path) -> Result<Self, sqlx::Error> {
        let database = Self::new(&format!("sqlite://{}", path.display())).await?;
        database.run_migrations().await?;
        Ok(database)
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(INITIAL_SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn create_user(
        &self,
        username: &str,
        institution_id: Option<i64>,
        is_institution_admin: bool,
    ) -> Result<i64, VerificationError> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (username, institution_id, is_institution_admin, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(username)
        .bind(institution_id)
        .bind(is_institution_admin)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn create_logbook(
        &self,
        institution_id: i64,
        name: &str,
    ) -> Result<i64, VerificationError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO logbooks (institution_id, name, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(institution_id)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let logbook_id = result.last_insert_rowid();
        info!("Created logbook {} ({})", logbook_id, name);
        Ok(logbook_id)
    }

    /// Cheap liveness probe for the health endpoint
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

/// Start a transaction that holds the write lock from its first statement.
///
/// Every read-then-write transaction goes through here. Under WAL a deferred
/// `BEGIN` fails with `SQLITE_BUSY_SNAPSHOT` when another writer commits
/// between the read and the write, without waiting out the busy timeout.
pub async fn begin_write(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
    pool.begin_with("BEGIN IMMEDIATE").await
}
