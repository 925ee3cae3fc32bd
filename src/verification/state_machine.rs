//! Sequential Approval State Machine
//!
//! Gates logbook-wide sign-off through three ordered stages:
//! owner review, supervisor review, institution assessment. A later stage
//! can only be completed once every earlier stage is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{ActorContext, AuditRecord, AuditSink};
use crate::database::begin_write;
use crate::database::models::{AccessGrant, GrantRole};
use crate::database::queries::Queries;
use crate::error::VerificationError;
use crate::identity::{IdentityProvider, Role};

/// Logbook-wide review progress derived from the three flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Unreviewed,
    OwnerReviewed,
    FullyReviewed,
    Assessed,
}

impl ReviewState {
    /// A supervisor flag left set after the owner un-reviews does not count
    /// towards progress.
    pub fn derive(owner_reviewed: bool, supervisor_reviewed: bool, assessed: bool) -> Self {
        match (owner_reviewed, supervisor_reviewed, assessed) {
            (_, _, true) => ReviewState::Assessed,
            (true, true, false) => ReviewState::FullyReviewed,
            (true, false, false) => ReviewState::OwnerReviewed,
            (false, _, false) => ReviewState::Unreviewed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Ready,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub owner_review: StepStatus,
    pub supervisor_review: StepStatus,
    pub institution_assessment: StepStatus,
}

impl WorkflowSummary {
    pub fn from_flags(owner_reviewed: bool, supervisor_reviewed: bool, assessed: bool) -> Self {
        let step = |done: bool, unlocked: bool| match (done, unlocked) {
            (true, _) => StepStatus::Completed,
            (false, true) => StepStatus::Ready,
            (false, false) => StepStatus::Pending,
        };

        Self {
            owner_review: step(owner_reviewed, false),
            supervisor_review: step(supervisor_reviewed, owner_reviewed),
            institution_assessment: step(assessed, owner_reviewed && supervisor_reviewed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationStatus {
    pub logbook_id: i64,
    pub owner_id: Option<i64>,
    pub supervisor_id: Option<i64>,
    pub owner_reviewed: bool,
    pub supervisor_reviewed: bool,
    pub assessed: bool,
    pub assessment_ready: bool,
    pub state: ReviewState,
    pub workflow: WorkflowSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewUpdate {
    pub role: GrantRole,
    pub reviewed: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentUpdate {
    pub assessed: bool,
    pub assessed_by: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ReviewStateMachine {
    pool: SqlitePool,
    identity: Arc<dyn IdentityProvider>,
    audit: Arc<dyn AuditSink>,
}

impl ReviewStateMachine {
    pub fn new(
        pool: SqlitePool,
        identity: Arc<dyn IdentityProvider>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            pool,
            identity,
            audit,
        }
    }

    /// Set the acting owner's or supervisor's reviewed flag.
    ///
    /// The supervisor precedence check is folded into the `UPDATE` itself, so
    /// no owner un-review can slip in between the check and the write.
    /// Callers without a reviewer grant get `Forbidden` whether or not the
    /// logbook exists.
    pub async fn set_review_status(
        &self,
        actor: &ActorContext,
        logbook_id: i64,
        reviewed: bool,
    ) -> Result<ReviewUpdate, VerificationError> {
        let mut tx = begin_write(&self.pool).await?;

        let grant = Queries::get_user_grant(&mut *tx, logbook_id, actor.user_id)
            .await?
            .filter(|g| g.role.is_reviewer())
            .ok_or_else(|| {
                VerificationError::Forbidden(format!(
                    "User {} is not an owner or supervisor of logbook {}",
                    actor.user_id, logbook_id
                ))
            })?;

        let now = Utc::now();
        let reviewed_at = if reviewed { Some(now) } else { None };

        let result = if grant.role == GrantRole::Supervisor && reviewed {
            sqlx::query(
                r#"
                UPDATE access_grants
                SET reviewed = TRUE, reviewed_at = ?, updated_at = ?
                WHERE id = ?
                  AND EXISTS (
                      SELECT 1 FROM access_grants owner
                      WHERE owner.logbook_id = ? AND owner.role = 'owner' AND owner.reviewed = TRUE
                  )
                "#,
            )
            .bind(reviewed_at)
            .bind(now)
            .bind(grant.id)
            .bind(logbook_id)
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                "UPDATE access_grants SET reviewed = ?, reviewed_at = ?, updated_at = ? WHERE id = ?",
            )
            .bind(reviewed)
            .bind(reviewed_at)
            .bind(now)
            .bind(grant.id)
            .execute(&mut *tx)
            .await?
        };

        if result.rows_affected() == 0 {
            if grant.role == GrantRole::Supervisor && reviewed {
                info!(
                    "Rejected supervisor review of logbook {} by user {}: owner has not reviewed",
                    logbook_id, actor.user_id
                );
                return Err(VerificationError::missing_reviews(vec![GrantRole::Owner]));
            }
            return Err(VerificationError::NotFound(format!(
                "Grant {} disappeared during update",
                grant.id
            )));
        }

        if grant.role == GrantRole::Owner && grant.reviewed && !reviewed {
            self.warn_on_owner_withdrawal(&mut tx, logbook_id).await?;
        }

        self.audit
            .record(
                AuditRecord::new(
                    actor,
                    "logbook.review_status_changed",
                    format!(
                        "{} {} logbook {} ({} -> {})",
                        grant.role,
                        if reviewed { "reviewed" } else { "withdrew review of" },
                        logbook_id,
                        grant.reviewed,
                        reviewed
                    ),
                )
                .with_metadata("logbook_id", logbook_id)
                .with_metadata("role", grant.role)
                .with_metadata("old_value", grant.reviewed)
                .with_metadata("new_value", reviewed),
            )
            .await?;

        tx.commit().await?;

        info!(
            "Logbook {} {} reviewed flag set to {} by user {}",
            logbook_id, grant.role, reviewed, actor.user_id
        );

        Ok(ReviewUpdate {
            role: grant.role,
            reviewed,
            updated_at: now,
        })
    }

    /// Institution-level sign-off, gated on both reviewer flags.
    pub async fn set_assessment(
        &self,
        actor: &ActorContext,
        logbook_id: i64,
        assessed: bool,
    ) -> Result<AssessmentUpdate, VerificationError> {
        if !self
            .identity
            .has_role(actor.user_id, Role::InstitutionAdmin)
            .await?
        {
            return Err(VerificationError::Forbidden(format!(
                "User {} is not an institution admin",
                actor.user_id
            )));
        }
        let actor_institution = self.identity.institution_of(actor.user_id).await?;

        let mut tx = begin_write(&self.pool).await?;

        let logbook = Queries::get_logbook(&mut *tx, logbook_id)
            .await?
            .ok_or_else(|| VerificationError::logbook_not_found(logbook_id))?;

        if actor_institution != Some(logbook.institution_id) {
            return Err(VerificationError::InstitutionMismatch(format!(
                "Logbook {} belongs to institution {}, not the caller's",
                logbook_id, logbook.institution_id
            )));
        }

        let now = Utc::now();
        let assessed_at = if assessed { Some(now) } else { None };

        let result = sqlx::query(
            r#"
            UPDATE logbooks
            SET assessed = ?, assessed_by = ?, assessed_at = ?, updated_at = ?
            WHERE id = ?
              AND (
                  ? = FALSE
                  OR (
                      EXISTS (SELECT 1 FROM access_grants
                              WHERE logbook_id = logbooks.id AND role = 'owner' AND reviewed = TRUE)
                      AND EXISTS (SELECT 1 FROM access_grants
                                  WHERE logbook_id = logbooks.id AND role = 'supervisor' AND reviewed = TRUE)
                  )
              )
            "#,
        )
        .bind(assessed)
        .bind(actor.user_id)
        .bind(assessed_at)
        .bind(now)
        .bind(logbook_id)
        .bind(assessed)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let missing = missing_reviewers(&mut tx, logbook_id).await?;
            info!(
                "Rejected assessment of logbook {} by user {}: missing {:?}",
                logbook_id, actor.user_id, missing
            );
            return Err(VerificationError::missing_reviews(missing));
        }

        self.audit
            .record(
                AuditRecord::new(
                    actor,
                    "logbook.assessment_changed",
                    format!(
                        "Institution admin {} logbook {} ({} -> {})",
                        if assessed { "assessed" } else { "withdrew assessment of" },
                        logbook_id,
                        logbook.assessed,
                        assessed
                    ),
                )
                .with_metadata("logbook_id", logbook_id)
                .with_metadata("institution_id", logbook.institution_id)
                .with_metadata("old_value", logbook.assessed)
                .with_metadata("new_value", assessed),
            )
            .await?;

        tx.commit().await?;

        info!(
            "Logbook {} assessment set to {} by user {}",
            logbook_id, assessed, actor.user_id
        );

        Ok(AssessmentUpdate {
            assessed,
            assessed_by: actor.user_id,
            updated_at: now,
        })
    }

    pub async fn get_status(&self, logbook_id: i64) -> Result<VerificationStatus, VerificationError> {
        let logbook = Queries::get_logbook(&self.pool, logbook_id)
            .await?
            .ok_or_else(|| VerificationError::logbook_not_found(logbook_id))?;

        let owner = Queries::get_role_grant(&self.pool, logbook_id, GrantRole::Owner).await?;
        let supervisor =
            Queries::get_role_grant(&self.pool, logbook_id, GrantRole::Supervisor).await?;

        let owner_reviewed = is_reviewed(&owner);
        let supervisor_reviewed = is_reviewed(&supervisor);

        Ok(VerificationStatus {
            logbook_id,
            owner_id: owner.map(|g| g.user_id),
            supervisor_id: supervisor.map(|g| g.user_id),
            owner_reviewed,
            supervisor_reviewed,
            assessed: logbook.assessed,
            assessment_ready: owner_reviewed && supervisor_reviewed,
            state: ReviewState::derive(owner_reviewed, supervisor_reviewed, logbook.assessed),
            workflow: WorkflowSummary::from_flags(
                owner_reviewed,
                supervisor_reviewed,
                logbook.assessed,
            ),
        })
    }

    async fn warn_on_owner_withdrawal(
        &self,
        conn: &mut SqliteConnection,
        logbook_id: i64,
    ) -> Result<(), VerificationError> {
        let supervisor =
            Queries::get_role_grant(&mut *conn, logbook_id, GrantRole::Supervisor).await?;
        let logbook = Queries::get_logbook(&mut *conn, logbook_id).await?;

        if is_reviewed(&supervisor) || logbook.map(|l| l.assessed).unwrap_or(false) {
            warn!(
                "Owner withdrew review of logbook {} while later stages remain signed off",
                logbook_id
            );
        }
        Ok(())
    }
}

fn is_reviewed(grant: &Option<AccessGrant>) -> bool {
    grant.as_ref().map(|g| g.reviewed).unwrap_or(false)
}

async fn missing_reviewers(
    conn: &mut SqliteConnection,
    logbook_id: i64,
) -> Result<Vec<GrantRole>, VerificationError> {
    let mut missing = Vec::new();
    for role in [GrantRole::Owner, GrantRole::Supervisor] {
        if !is_reviewed(&Queries::get_role_grant(&mut *conn, logbook_id, role).await?) {
            missing.push(role);
        }
    }
    Ok(missing)
}
