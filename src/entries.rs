//! Entry storage.
//!
//! Entry CRUD is owned by the logbook service; the engine needs just enough
//! of it to compute which payload fields an edit touched.

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::audit::ActorContext;
use crate::database::models::{EntryPayload, LogbookEntry};
use crate::database::queries::Queries;
use crate::error::VerificationError;
use crate::signals::EntryUpdated;

#[derive(Clone)]
pub struct EntryStore {
    pool: SqlitePool,
}

impl EntryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_entry(
        &self,
        logbook_id: i64,
        author_id: i64,
        payload: EntryPayload,
    ) -> Result<LogbookEntry, VerificationError> {
        if Queries::get_logbook(&self.pool, logbook_id).await?.is_none() {
            return Err(VerificationError::logbook_not_found(logbook_id));
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO logbook_entries (logbook_id, author_id, payload, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(logbook_id)
        .bind(author_id)
        .bind(serde_json::to_string(&payload)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let entry_id = result.last_insert_rowid();
        debug!("Created entry {} in logbook {}", entry_id, logbook_id);

        Ok(LogbookEntry {
            id: entry_id,
            logbook_id,
            author_id,
            payload,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_entry(&self, entry_id: i64) -> Result<LogbookEntry, VerificationError> {
        Queries::get_entry(&self.pool, entry_id)
            .await?
            .ok_or_else(|| VerificationError::entry_not_found(entry_id))
    }

    /// Replace an entry's payload. Returns the updated entry together with
    /// the signal describing the edit; dispatching it is the caller's job.
    pub async fn update_payload(
        &self,
        editor: &ActorContext,
        entry_id: i64,
        payload: EntryPayload,
    ) -> Result<(LogbookEntry, EntryUpdated), VerificationError> {
        let before = self.get_entry(entry_id).await?;

        if before.author_id != editor.user_id {
            return Err(VerificationError::Forbidden(format!(
                "Only the author may edit entry {}",
                entry_id
            )));
        }

        let changed = changed_fields(&before.payload, &payload);
        let now = Utc::now();

        sqlx::query("UPDATE logbook_entries SET payload = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&payload)?)
            .bind(now)
            .bind(entry_id)
            .execute(&self.pool)
            .await?;

        info!(
            "Entry {} updated by user {} ({} field(s) changed)",
            entry_id,
            editor.user_id,
            changed.len()
        );

        let signal = EntryUpdated {
            entry_id,
            logbook_id: before.logbook_id,
            changed_fields: changed,
            editor: editor.clone(),
            edited_at: now,
        };

        let entry = LogbookEntry {
            payload,
            updated_at: now,
            ..before
        };

        Ok((entry, signal))
    }
}

/// Keys added, removed or modified between two payloads, sorted
pub fn changed_fields(before: &EntryPayload, after: &EntryPayload) -> Vec<String> {
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();

    keys.into_iter()
        .filter(|key| before.get(*key) != after.get(*key))
        .cloned()
        .collect()
}
