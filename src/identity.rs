//! Identity and authorization lookups.
//!
//! Authentication and role storage belong to an external service; the engine
//! only asks the two questions below.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::database::queries::Queries;
use crate::error::VerificationError;

/// Institution-level permissions (distinct from per-logbook grants)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    InstitutionAdmin,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn has_role(&self, user_id: i64, role: Role) -> Result<bool, VerificationError>;

    async fn institution_of(&self, user_id: i64) -> Result<Option<i64>, VerificationError>;
}

/// Reads the locally mirrored `users` table
#[derive(Clone)]
pub struct SqlIdentityProvider {
    pool: SqlitePool,
}

impl SqlIdentityProvider {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityProvider for SqlIdentityProvider {
    async fn has_role(&self, user_id: i64, role: Role) -> Result<bool, VerificationError> {
        let user = Queries::get_user(&self.pool, user_id).await?;
        Ok(match (user, role) {
            (Some(user), Role::InstitutionAdmin) => user.is_institution_admin,
            (None, _) => false,
        })
    }

    async fn institution_of(&self, user_id: i64) -> Result<Option<i64>, VerificationError> {
        let user = Queries::get_user(&self.pool, user_id).await?;
        Ok(user.and_then(|u| u.institution_id))
    }
}
