//! Access grant store.
//!
//! Grants are issued by the external access-control service; this store
//! persists them, enforces one Owner and one Supervisor per logbook, and
//! reports the grant-created signal that drives verifier backfill.

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{ActorContext, AuditRecord, AuditSink};
use crate::database::begin_write;
use crate::database::models::{AccessGrant, GrantRole};
use crate::database::queries::Queries;
use crate::error::VerificationError;
use crate::signals::GrantCreated;

#[derive(Clone)]
pub struct GrantStore {
    pool: SqlitePool,
    audit: Arc<dyn AuditSink>,
}

impl GrantStore {
    pub fn new(pool: SqlitePool, audit: Arc<dyn AuditSink>) -> Self {
        Self { pool, audit }
    }

    /// Persist a new grant and return the signal for dispatch
    pub async fn create_grant(
        &self,
        granted_by: &ActorContext,
        user_id: i64,
        logbook_id: i64,
        role: GrantRole,
    ) -> Result<(AccessGrant, GrantCreated), VerificationError> {
        let mut tx = begin_write(&self.pool).await?;

        if Queries::get_logbook(&mut *tx, logbook_id).await?.is_none() {
            return Err(VerificationError::logbook_not_found(logbook_id));
        }

        if let Some(existing) = Queries::get_user_grant(&mut *tx, logbook_id, user_id).await? {
            return Err(VerificationError::ValidationError(format!(
                "User {} already holds the {} role on logbook {}",
                user_id, existing.role, logbook_id
            )));
        }

        if role.is_reviewer() {
            if let Some(holder) = Queries::get_role_grant(&mut *tx, logbook_id, role).await? {
                return Err(VerificationError::ValidationError(format!(
                    "Logbook {} already has a {} (user {})",
                    logbook_id, role, holder.user_id
                )));
            }
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO access_grants (user_id, logbook_id, role, reviewed, created_at, updated_at)
            VALUES (?, ?, ?, FALSE, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(logbook_id)
        .bind(role.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            // Lost a race with a concurrent grant for the same slot
            if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                VerificationError::ValidationError(format!(
                    "Conflicting {} grant on logbook {}",
                    role, logbook_id
                ))
            } else {
                VerificationError::from(e)
            }
        })?;

        let grant_id = result.last_insert_rowid();

        // Audited before commit; a failed audit write rolls the grant back
        self.audit
            .record(
                AuditRecord::new(
                    granted_by,
                    "grant.created",
                    format!("Granted {} on logbook {} to user {}", role, logbook_id, user_id),
                )
                .with_metadata("logbook_id", logbook_id)
                .with_metadata("user_id", user_id)
                .with_metadata("role", role),
            )
            .await?;

        tx.commit().await?;

        info!(
            "Granted {} on logbook {} to user {} (grant {})",
            role, logbook_id, user_id, grant_id
        );

        let grant = AccessGrant {
            id: grant_id,
            user_id,
            logbook_id,
            role,
            reviewed: false,
            reviewed_at: None,
            created_at: now,
            updated_at: now,
        };
        let signal = GrantCreated {
            user_id,
            logbook_id,
            role,
        };

        Ok((grant, signal))
    }

    /// Remove a grant. Ledger rows written by the verifier are kept so past
    /// decisions remain attributable.
    pub async fn revoke_grant(
        &self,
        revoked_by: &ActorContext,
        user_id: i64,
        logbook_id: i64,
    ) -> Result<AccessGrant, VerificationError> {
        let mut tx = begin_write(&self.pool).await?;

        let grant = Queries::get_user_grant(&mut *tx, logbook_id, user_id)
            .await?
            .ok_or_else(|| {
                VerificationError::NotFound(format!(
                    "User {} holds no grant on logbook {}",
                    user_id, logbook_id
                ))
            })?;

        sqlx::query("DELETE FROM access_grants WHERE id = ?")
            .bind(grant.id)
            .execute(&mut *tx)
            .await?;

        let retained: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM verification_records vr
            JOIN logbook_entries le ON le.id = vr.entry_id
            WHERE le.logbook_id = ? AND vr.verifier_id = ?
            "#,
        )
        .bind(logbook_id)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        if grant.role == GrantRole::Supervisor && retained > 0 {
            warn!(
                "Revoked supervisor {} on logbook {}; retaining {} verification records",
                user_id, logbook_id, retained
            );
        } else {
            info!("Revoked {} on logbook {} from user {}", grant.role, logbook_id, user_id);
        }

        self.audit
            .record(
                AuditRecord::new(
                    revoked_by,
                    "grant.revoked",
                    format!(
                        "Revoked {} on logbook {} from user {}",
                        grant.role, logbook_id, user_id
                    ),
                )
                .with_metadata("logbook_id", logbook_id)
                .with_metadata("user_id", user_id)
                .with_metadata("retained_records", retained),
            )
            .await?;

        tx.commit().await?;

        Ok(grant)
    }

    pub async fn grants_for_logbook(
        &self,
        logbook_id: i64,
    ) -> Result<Vec<AccessGrant>, VerificationError> {
        Ok(Queries::get_grants_for_logbook(&self.pool, logbook_id).await?)
    }
}
