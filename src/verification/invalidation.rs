//! Entry-Update Invalidation Procedure
//!
//! A decision made on an entry's old content says nothing about its new
//! content. When the payload changes, every ledger row for the entry that was
//! decided before the edit goes back to pending. What was discarded is folded
//! into the row's note and copied to `verification_history`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::audit::{AuditRecord, AuditSink};
use crate::database::begin_write;
use crate::database::models::VerificationRecord;
use crate::error::VerificationError;
use crate::signals::EntryUpdated;
use crate::verification::ledger::{ResetContext, VerificationLedger};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationOutcome {
    pub entry_id: i64,
    pub reset: u64,
    pub affected_verifiers: Vec<i64>,
    /// True when the edit touched only metadata fields
    pub ignored: bool,
}

#[derive(Clone)]
pub struct EntryUpdateInvalidator {
    pool: SqlitePool,
    audit: Arc<dyn AuditSink>,
    ignored_fields: HashSet<String>,
}

impl EntryUpdateInvalidator {
    pub fn new(
        pool: SqlitePool,
        audit: Arc<dyn AuditSink>,
        ignored_fields: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            pool,
            audit,
            ignored_fields: ignored_fields.into_iter().collect(),
        }
    }

    /// Changed fields that carry entry content, in signal order
    pub fn content_fields<'a>(&self, changed_fields: &'a [String]) -> Vec<&'a String> {
        changed_fields
            .iter()
            .filter(|field| !field.starts_with('_') && !self.ignored_fields.contains(*field))
            .collect()
    }

    pub async fn run(&self, signal: &EntryUpdated) -> Result<InvalidationOutcome, VerificationError> {
        let mut outcome = InvalidationOutcome {
            entry_id: signal.entry_id,
            ..Default::default()
        };

        let content_fields: Vec<String> = self
            .content_fields(&signal.changed_fields)
            .into_iter()
            .cloned()
            .collect();

        if content_fields.is_empty() {
            debug!(
                "Entry {} update touched no content fields ({:?}); decisions kept",
                signal.entry_id, signal.changed_fields
            );
            outcome.ignored = true;
            return Ok(outcome);
        }

        // Read under the write lock so the note and history describe exactly
        // the rows being reset.
        let mut tx = begin_write(&self.pool).await?;

        let decided =
            VerificationLedger::decided_before(&mut tx, signal.entry_id, signal.edited_at).await?;
        if decided.is_empty() {
            debug!(
                "Entry {} has no decisions older than the edit at {}",
                signal.entry_id, signal.edited_at
            );
            return Ok(outcome);
        }

        for record in &decided {
            let reset = ResetContext {
                editor_id: signal.editor.user_id,
                edited_at: signal.edited_at,
                changed_fields: &content_fields,
                note: invalidation_note(record, signal.editor.user_id, signal.edited_at, &content_fields),
            };

            if VerificationLedger::reset_decision(&mut tx, record, &reset).await? {
                outcome.reset += 1;
                outcome.affected_verifiers.push(record.verifier_id);
            }
        }

        if outcome.reset > 0 {
            let verifiers: Vec<String> = outcome
                .affected_verifiers
                .iter()
                .map(|v| v.to_string())
                .collect();

            // Recorded before commit so a failed audit write rolls the reset back
            // and the retry sees the decisions again.
            self.audit
                .record(
                    AuditRecord::new(
                        &signal.editor,
                        "verification.invalidated",
                        format!(
                            "Reset {} verification decision(s) on entry {} after edit by user {}; verifiers: {}",
                            outcome.reset,
                            signal.entry_id,
                            signal.editor.user_id,
                            verifiers.join(", ")
                        ),
                    )
                    .with_metadata("entry_id", signal.entry_id)
                    .with_metadata("logbook_id", signal.logbook_id)
                    .with_metadata("changed_fields", content_fields.join(","))
                    .with_metadata("verifiers", verifiers.join(",")),
                )
                .await?;
        }

        tx.commit().await?;

        info!(
            "Invalidated {} decision(s) on entry {} (fields: {})",
            outcome.reset,
            signal.entry_id,
            content_fields.join(", ")
        );

        Ok(outcome)
    }
}

/// Note left on a reset row describing the decision it replaced
pub fn invalidation_note(
    record: &VerificationRecord,
    editor_id: i64,
    edited_at: DateTime<Utc>,
    changed_fields: &[String],
) -> String {
    let previous = record
        .outcome
        .map(|o| o.as_str())
        .unwrap_or("decided");

    let mut note = format!(
        "[Reset {}] Entry edited by user {} (changed fields: {}). Previous decision: {}",
        edited_at.to_rfc3339(),
        editor_id,
        changed_fields.join(", "),
        previous
    );

    if let Some(decided_at) = record.decided_at {
        note.push_str(&format!(" at {}", decided_at.to_rfc3339()));
    }
    note.push('.');

    match record.notes.as_deref().map(str::trim) {
        Some(prior) if !prior.is_empty() => {
            note.push_str(&format!(" Previous note: {}", prior));
        }
        _ => {}
    }

    note
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::DecisionOutcome;
    use chrono::TimeZone;

    fn decided_record(notes: Option<&str>) -> VerificationRecord {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        VerificationRecord {
            id: 1,
            entry_id: 10,
            verifier_id: 20,
            decided: true,
            outcome: Some(DecisionOutcome::Approved),
            decided_at: Some(at),
            notes: notes.map(String::from),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_note_mentions_prior_decision_and_fields() {
        let edited_at = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let note = invalidation_note(
            &decided_record(Some("ok")),
            42,
            edited_at,
            &["amount".to_string(), "site".to_string()],
        );

        assert!(note.contains("approved"));
        assert!(note.contains("Previous note: ok"));
        assert!(note.contains("user 42"));
        assert!(note.contains("amount, site"));
        assert!(note.contains("2026-03-02T12:00:00"));
    }

    #[test]
    fn test_note_without_prior_note() {
        let note = invalidation_note(&decided_record(None), 1, Utc::now(), &["a".to_string()]);
        assert!(!note.contains("Previous note"));
        assert!(note.ends_with('.'));
    }

    #[test]
    fn test_blank_prior_note_is_omitted() {
        let note = invalidation_note(&decided_record(Some("   ")), 1, Utc::now(), &["a".to_string()]);
        assert!(!note.contains("Previous note"));
    }
}
