use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Role a user holds on one logbook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantRole {
    Owner,
    Supervisor,
    Contributor,
}

impl GrantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantRole::Owner => "owner",
            GrantRole::Supervisor => "supervisor",
            GrantRole::Contributor => "contributor",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(GrantRole::Owner),
            "supervisor" => Some(GrantRole::Supervisor),
            "contributor" => Some(GrantRole::Contributor),
            _ => None,
        }
    }

    /// Owner and Supervisor grants carry a logbook-wide reviewed flag
    pub fn is_reviewer(&self) -> bool {
        matches!(self, GrantRole::Owner | GrantRole::Supervisor)
    }
}

impl std::fmt::Display for GrantRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Substance of a verifier's decision on one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approved,
    Rejected,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::Approved => "approved",
            DecisionOutcome::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(DecisionOutcome::Approved),
            "rejected" => Some(DecisionOutcome::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logbook {
    pub id: i64,
    pub institution_id: i64,
    pub name: String,
    pub assessed: bool,
    pub assessed_by: Option<i64>,
    pub assessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub type EntryPayload = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogbookEntry {
    pub id: i64,
    pub logbook_id: i64,
    pub author_id: i64,
    pub payload: EntryPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessGrant {
    pub id: i64,
    pub user_id: i64,
    pub logbook_id: i64,
    pub role: GrantRole,
    pub reviewed: bool,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: i64,
    pub entry_id: i64,
    pub verifier_id: i64,
    pub decided: bool,
    pub outcome: Option<DecisionOutcome>,
    pub decided_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A decision that was reset because the entry it covered changed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationHistory {
    pub id: i64,
    pub record_id: i64,
    pub entry_id: i64,
    pub verifier_id: i64,
    pub previous_outcome: Option<DecisionOutcome>,
    pub previous_notes: Option<String>,
    pub previous_decided_at: Option<DateTime<Utc>>,
    pub invalidated_by: i64,
    pub invalidated_at: DateTime<Utc>,
    pub changed_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub institution_id: Option<i64>,
    pub is_institution_admin: bool,
}
