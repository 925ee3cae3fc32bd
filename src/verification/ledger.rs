//! Per-entry, per-verifier approval ledger.
//!
//! One row per (entry, verifier), enforced by a unique index. Rows are
//! created pending, flipped to decided by the verifier, and reset to pending
//! when the entry changes. The engine never deletes them.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::info;

use crate::audit::{ActorContext, AuditRecord, AuditSink};
use crate::database::models::{
    DecisionOutcome, GrantRole, VerificationHistory, VerificationRecord,
};
use crate::database::queries::{record_from_row, Queries};
use crate::error::VerificationError;

const RECORD_COLUMNS: &str = "id, entry_id, verifier_id, decided, outcome, decided_at, notes, created_at, updated_at";

/// What a reset must preserve about the decision it discards
pub struct ResetContext<'a> {
    pub editor_id: i64,
    pub edited_at: DateTime<Utc>,
    pub changed_fields: &'a [String],
    pub note: String,
}

#[derive(Clone)]
pub struct VerificationLedger {
    pool: SqlitePool,
    audit: Arc<dyn AuditSink>,
}

impl VerificationLedger {
    pub fn new(pool: SqlitePool, audit: Arc<dyn AuditSink>) -> Self {
        Self { pool, audit }
    }

    /// Create pending rows for `verifier_id` on each entry that lacks one.
    /// Returns how many rows were newly created.
    pub async fn ensure_pending_batch(
        conn: &mut SqliteConnection,
        verifier_id: i64,
        entry_ids: &[i64],
    ) -> Result<u64, sqlx::Error> {
        let now = Utc::now();
        let mut created = 0;

        for entry_id in entry_ids {
            let result = sqlx::query(
                r#"
                INSERT INTO verification_records
                    (entry_id, verifier_id, decided, created_at, updated_at)
                VALUES (?, ?, FALSE, ?, ?)
                ON CONFLICT (entry_id, verifier_id) DO NOTHING
                "#,
            )
            .bind(entry_id)
            .bind(verifier_id)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;

            created += result.rows_affected();
        }

        Ok(created)
    }

    /// Decided rows on an entry whose decision predates `edited_at`.
    /// Decisions made after the edit already judged the new content.
    pub async fn decided_before(
        conn: &mut SqliteConnection,
        entry_id: i64,
        edited_at: DateTime<Utc>,
    ) -> Result<Vec<VerificationRecord>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM verification_records
            WHERE entry_id = ? AND decided = TRUE AND (decided_at IS NULL OR decided_at <= ?)
            ORDER BY id
            "#,
            RECORD_COLUMNS
        ))
        .bind(entry_id)
        .bind(edited_at)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Flip one decided row back to pending and keep a history row of what
    /// was discarded. Returns false if the row was no longer decided, or was
    /// decided again after the edit.
    pub async fn reset_decision(
        conn: &mut SqliteConnection,
        record: &VerificationRecord,
        reset: &ResetContext<'_>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE verification_records
            SET decided = FALSE, outcome = NULL, decided_at = NULL, notes = ?, updated_at = ?
            WHERE id = ? AND decided = TRUE AND (decided_at IS NULL OR decided_at <= ?)
            "#,
        )
        .bind(&reset.note)
        .bind(Utc::now())
        .bind(record.id)
        .bind(reset.edited_at)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        let changed_fields = serde_json::to_string(reset.changed_fields)
            .map_err(|e| sqlx::Error::Protocol(format!("changed_fields: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO verification_history
                (record_id, entry_id, verifier_id, previous_outcome, previous_notes,
                 previous_decided_at, invalidated_by, invalidated_at, changed_fields)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id)
        .bind(record.entry_id)
        .bind(record.verifier_id)
        .bind(record.outcome.map(|o| o.as_str()))
        .bind(&record.notes)
        .bind(record.decided_at)
        .bind(reset.editor_id)
        .bind(reset.edited_at)
        .bind(changed_fields)
        .execute(&mut *conn)
        .await?;

        Ok(true)
    }

    pub async fn decided_for_entry(
        &self,
        entry_id: i64,
    ) -> Result<Vec<VerificationRecord>, VerificationError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM verification_records WHERE entry_id = ? AND decided = TRUE ORDER BY id",
            RECORD_COLUMNS
        ))
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(record_from_row)
            .collect::<Result<_, _>>()?)
    }

    pub async fn records_for_entry(
        &self,
        entry_id: i64,
    ) -> Result<Vec<VerificationRecord>, VerificationError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM verification_records WHERE entry_id = ? ORDER BY id",
            RECORD_COLUMNS
        ))
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(record_from_row)
            .collect::<Result<_, _>>()?)
    }

    pub async fn records_for_verifier(
        &self,
        logbook_id: i64,
        verifier_id: i64,
    ) -> Result<Vec<VerificationRecord>, VerificationError> {
        let rows = sqlx::query(
            r#"
            SELECT vr.id, vr.entry_id, vr.verifier_id, vr.decided, vr.outcome, vr.decided_at,
                   vr.notes, vr.created_at, vr.updated_at
            FROM verification_records vr
            JOIN logbook_entries le ON le.id = vr.entry_id
            WHERE le.logbook_id = ? AND vr.verifier_id = ?
            ORDER BY vr.entry_id
            "#,
        )
        .bind(logbook_id)
        .bind(verifier_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(record_from_row)
            .collect::<Result<_, _>>()?)
    }

    /// A verifier approves or rejects an entry. Creates the row when the
    /// entry postdates the verifier's backfill.
    pub async fn record_decision(
        &self,
        actor: &ActorContext,
        entry_id: i64,
        outcome: DecisionOutcome,
        notes: Option<String>,
    ) -> Result<VerificationRecord, VerificationError> {
        let entry = Queries::get_entry(&self.pool, entry_id)
            .await?
            .ok_or_else(|| VerificationError::entry_not_found(entry_id))?;

        let grant = Queries::get_user_grant(&self.pool, entry.logbook_id, actor.user_id).await?;
        if !matches!(grant, Some(ref g) if g.role == GrantRole::Supervisor) {
            return Err(VerificationError::Forbidden(format!(
                "User {} is not a verifier on logbook {}",
                actor.user_id, entry.logbook_id
            )));
        }

        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO verification_records
                (entry_id, verifier_id, decided, outcome, decided_at, notes, created_at, updated_at)
            VALUES (?, ?, TRUE, ?, ?, ?, ?, ?)
            ON CONFLICT (entry_id, verifier_id) DO UPDATE SET
                decided = TRUE,
                outcome = excluded.outcome,
                decided_at = excluded.decided_at,
                notes = excluded.notes,
                updated_at = excluded.updated_at
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(entry_id)
        .bind(actor.user_id)
        .bind(outcome.as_str())
        .bind(now)
        .bind(&notes)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let record = record_from_row(&row)?;

        info!(
            "User {} {} entry {} (record {})",
            actor.user_id,
            outcome.as_str(),
            entry_id,
            record.id
        );

        self.audit
            .record(
                AuditRecord::new(
                    actor,
                    "verification.decided",
                    format!("Entry {} {} by user {}", entry_id, outcome.as_str(), actor.user_id),
                )
                .with_metadata("entry_id", entry_id)
                .with_metadata("logbook_id", entry.logbook_id)
                .with_metadata("outcome", outcome.as_str()),
            )
            .await?;

        Ok(record)
    }

    pub async fn history_for_entry(
        &self,
        entry_id: i64,
    ) -> Result<Vec<VerificationHistory>, VerificationError> {
        let rows = sqlx::query(
            r#"
            SELECT id, record_id, entry_id, verifier_id, previous_outcome, previous_notes,
                   previous_decided_at, invalidated_by, invalidated_at, changed_fields
            FROM verification_history
            WHERE entry_id = ?
            ORDER BY id
            "#,
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<VerificationHistory, VerificationError> {
                let outcome: Option<String> = row.try_get("previous_outcome")?;
                let changed: String = row.try_get("changed_fields")?;
                Ok(VerificationHistory {
                    id: row.try_get("id")?,
                    record_id: row.try_get("record_id")?,
                    entry_id: row.try_get("entry_id")?,
                    verifier_id: row.try_get("verifier_id")?,
                    previous_outcome: outcome.as_deref().and_then(DecisionOutcome::from_str),
                    previous_notes: row.try_get("previous_notes")?,
                    previous_decided_at: row.try_get("previous_decided_at")?,
                    invalidated_by: row.try_get("invalidated_by")?,
                    invalidated_at: row.try_get("invalidated_at")?,
                    changed_fields: serde_json::from_str(&changed)?,
                })
            })
            .collect()
    }
}
