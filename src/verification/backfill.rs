//! Verifier Backfill Procedure
//!
//! When a supervisor is granted access to a logbook that already holds
//! entries, every one of those entries needs a pending ledger row for them.
//! Entries are walked in id order, one committed transaction per batch, so a
//! crash loses at most the batch in flight and a rerun picks up where the
//! unique index says work is still missing.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::database::begin_write;
use crate::database::models::GrantRole;
use crate::database::queries::Queries;
use crate::error::VerificationError;
use crate::verification::ledger::VerificationLedger;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillSummary {
    pub verifier_id: i64,
    pub logbook_id: i64,
    pub entries_seen: u64,
    pub created: u64,
    pub already_present: u64,
    pub batches: u32,
    /// Set when the verifier no longer held the supervisor grant
    pub skipped: bool,
}

#[derive(Clone)]
pub struct VerifierBackfill {
    pool: SqlitePool,
    batch_size: u32,
}

impl VerifierBackfill {
    pub fn new(pool: SqlitePool, batch_size: u32) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(
        &self,
        verifier_id: i64,
        logbook_id: i64,
    ) -> Result<BackfillSummary, VerificationError> {
        let mut summary = BackfillSummary {
            verifier_id,
            logbook_id,
            ..Default::default()
        };

        // Redelivered after a revoke: nothing to backfill for
        let grant = Queries::get_user_grant(&self.pool, logbook_id, verifier_id).await?;
        if !matches!(grant, Some(ref g) if g.role == GrantRole::Supervisor) {
            info!(
                "Skipping backfill for user {} on logbook {}: no supervisor grant",
                verifier_id, logbook_id
            );
            summary.skipped = true;
            return Ok(summary);
        }

        let mut cursor = 0i64;
        loop {
            let mut tx = begin_write(&self.pool).await?;

            let entry_ids =
                Queries::get_entry_ids_page(&mut *tx, logbook_id, cursor, self.batch_size as i64)
                    .await?;
            let Some(&last_id) = entry_ids.last() else {
                break;
            };

            let created =
                VerificationLedger::ensure_pending_batch(&mut tx, verifier_id, &entry_ids).await?;
            tx.commit().await?;

            let seen = entry_ids.len() as u64;
            summary.batches += 1;
            summary.entries_seen += seen;
            summary.created += created;
            summary.already_present += seen - created;
            cursor = last_id;

            debug!(
                "Backfill batch {} for verifier {} on logbook {}: {} created, {} present",
                summary.batches,
                verifier_id,
                logbook_id,
                created,
                seen - created
            );

            if seen < self.batch_size as u64 {
                break;
            }
        }

        if summary.entries_seen == 0 {
            info!(
                "Logbook {} has no entries; nothing to backfill for verifier {}",
                logbook_id, verifier_id
            );
        } else {
            info!(
                "Backfilled verifier {} on logbook {}: {} created, {} already present ({} batches)",
                verifier_id, logbook_id, summary.created, summary.already_present, summary.batches
            );
        }

        Ok(summary)
    }
}
