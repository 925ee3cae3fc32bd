use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;

use crate::database::models::GrantRole;

impl From<serde_json::Error> for VerificationError {
    fn from(err: serde_json::Error) -> Self {
        Self::ValidationError(format!("JSON serialization error: {}", err))
    }
}

/// SQLite primary result code for constraint failures, including ones
/// raised by triggers.
const SQLITE_CONSTRAINT: i32 = 19;

impl From<sqlx::Error> for VerificationError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::TransientFailure(format!("Storage unavailable: {}", err))
            }
            sqlx::Error::Database(db) if is_constraint_failure(db.as_ref()) => {
                Self::IntegrityError(format!("Constraint violated: {}", err))
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::RowNotFound => {
                Self::IntegrityError(format!("Unreadable row: {}", err))
            }
            _ => Self::DatabaseError(format!("Database error: {}", err)),
        }
    }
}

fn is_constraint_failure(db: &dyn sqlx::error::DatabaseError) -> bool {
    if !matches!(db.kind(), sqlx::error::ErrorKind::Other) {
        return true;
    }
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| code & 0xff == SQLITE_CONSTRAINT)
        .unwrap_or(false)
}

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Precedence violation: {message}")]
    PrecedenceViolation {
        message: String,
        missing: Vec<GrantRole>,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Institution mismatch: {0}")]
    InstitutionMismatch(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient failure: {0}")]
    TransientFailure(String),

    #[error("Audit error: {0}")]
    AuditError(String),

    /// Stored data broke a constraint or could not be decoded; retrying
    /// will not help.
    #[error("Integrity error: {0}")]
    IntegrityError(String),
}

impl VerificationError {
    /// Precedence failure naming every reviewer role whose flag is still unset.
    pub fn missing_reviews(missing: Vec<GrantRole>) -> Self {
        let names: Vec<&str> = missing.iter().map(|r| r.as_str()).collect();
        Self::PrecedenceViolation {
            message: format!("{} review required first", names.join(" and ")),
            missing,
        }
    }

    pub fn logbook_not_found(logbook_id: i64) -> Self {
        Self::NotFound(format!("Logbook {} does not exist", logbook_id))
    }

    pub fn entry_not_found(entry_id: i64) -> Self {
        Self::NotFound(format!("Entry {} does not exist", entry_id))
    }

    /// Whether a background task hitting this error should be attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError(_) | Self::TransientFailure(_) | Self::AuditError(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::PrecedenceViolation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Forbidden(_) | Self::InstitutionMismatch(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::TransientFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ConfigError(_)
            | Self::DatabaseError(_)
            | Self::AuditError(_)
            | Self::IntegrityError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "config_error",
            Self::DatabaseError(_) => "database_error",
            Self::ValidationError(_) => "validation_error",
            Self::PrecedenceViolation { .. } => "precedence_violation",
            Self::Forbidden(_) => "forbidden",
            Self::InstitutionMismatch(_) => "institution_mismatch",
            Self::NotFound(_) => "not_found",
            Self::TransientFailure(_) => "transient_failure",
            Self::AuditError(_) => "audit_error",
            Self::IntegrityError(_) => "integrity_error",
        }
    }
}

impl IntoResponse for VerificationError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal details stay in the logs
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let mut body = serde_json::json!({
            "error": self.kind(),
            "message": message,
        });

        if let Self::PrecedenceViolation { missing, .. } = &self {
            body["missing"] = serde_json::json!(missing);
        }

        (status, Json(body)).into_response()
    }
}
