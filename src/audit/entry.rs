//! Audit Record
//!
//! Structured, hash-chained records describing who changed verification
//! state, from where, and why.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub const GENESIS_ACTION: &str = "genesis";
pub const ZERO_HASH: &str =
    "sha256:0000000000000000000000000000000000000000000000000000000000000000";

/// Who triggered an action, captured when the request arrives so that
/// background work can attribute it after the request is gone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub user_id: i64,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl ActorContext {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            ip: None,
            user_agent: None,
        }
    }

    pub fn with_origin(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.ip = ip;
        self.user_agent = user_agent;
        self
    }
}

/// Audit record with cryptographic hash chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Acting user id, `None` for system records
    pub actor: Option<i64>,
    pub action: String,
    pub description: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub previous_hash: String,
    #[serde(default)]
    pub this_hash: String,
}

impl AuditRecord {
    /// Unchained record; the logger links and seals it on append
    pub fn new(actor: &ActorContext, action: &str, description: String) -> Self {
        Self {
            actor: Some(actor.user_id),
            action: action.to_string(),
            description,
            ip: actor.ip.clone(),
            user_agent: actor.user_agent.clone(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            previous_hash: String::new(),
            this_hash: String::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Link this record after `previous_hash` and compute its own hash
    pub fn seal(&mut self, previous_hash: String) {
        self.previous_hash = previous_hash;
        self.this_hash = self.calculate_hash();
    }

    /// Create canonical string representation for hashing
    pub fn canonical_string(&self) -> String {
        format!(
            "actor:{}|action:{}|description:{}|ip:{}|user_agent:{}|timestamp:{}|previous_hash:{}|metadata:{}",
            self.actor.map(|a| a.to_string()).unwrap_or_default(),
            self.action,
            self.description,
            self.ip.as_deref().unwrap_or(""),
            self.user_agent.as_deref().unwrap_or(""),
            self.timestamp.to_rfc3339(),
            self.previous_hash,
            self.serialize_metadata()
        )
    }

    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_string().as_bytes());
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }

    fn serialize_metadata(&self) -> String {
        let mut items: Vec<String> = self
            .metadata
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect();
        items.sort();
        items.join(",")
    }

    pub fn verify_hash(&self) -> bool {
        self.this_hash == self.calculate_hash()
    }

    pub fn summary(&self) -> String {
        match self.actor {
            Some(actor) => format!("{} by user {}: {}", self.action, actor, self.description),
            None => format!("{}: {}", self.action, self.description),
        }
    }
}

/// First record of every audit file
pub fn create_genesis_record(server_id: &str) -> AuditRecord {
    let mut record = AuditRecord {
        actor: None,
        action: GENESIS_ACTION.to_string(),
        description: format!("Audit log started by {}", server_id),
        ip: None,
        user_agent: None,
        timestamp: Utc::now(),
        metadata: HashMap::new(),
        previous_hash: String::new(),
        this_hash: String::new(),
    };
    record.metadata.insert("server_id".to_string(), server_id.to_string());
    record.seal(ZERO_HASH.to_string());
    record
}
