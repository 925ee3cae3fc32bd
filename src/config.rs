use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::VerificationError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub server_id: String,
    pub audit: AuditConfig,
    pub tasks: TaskConfig,
    pub entries: EntryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub log_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Entries handled per backfill transaction
    pub backfill_batch_size: u32,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryConfig {
    /// Payload keys whose changes never invalidate verifier decisions
    pub ignored_fields: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://logbook.db".to_string(),
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
            server_id: "logbook-verification-01".to_string(),
            audit: AuditConfig::default(),
            tasks: TaskConfig::default(),
            entries: EntryConfig::default(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: "logs/audit.jsonl".to_string(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            backfill_batch_size: 100,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            ignored_fields: vec![
                "updated_at".to_string(),
                "modified_at".to_string(),
                "last_synced_at".to_string(),
            ],
        }
    }
}

impl TaskConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl AppConfig {
    /// Defaults, then the YAML file named by `CONFIG_FILE`, then individual
    /// environment variables.
    pub fn load() -> Result<Self, VerificationError> {
        let mut config = match env::var("CONFIG_FILE") {
            Ok(path) => Self::from_yaml_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Ok(url) = env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(host) = env::var("SERVER_HOST") {
            config.server_host = host;
        }
        if let Some(port) = parse_env("SERVER_PORT")? {
            config.server_port = port;
        }
        if let Ok(server_id) = env::var("SERVER_ID") {
            config.server_id = server_id;
        }
        if let Some(enabled) = parse_env("AUDIT_ENABLED")? {
            config.audit.enabled = enabled;
        }
        if let Ok(path) = env::var("AUDIT_LOG_PATH") {
            config.audit.log_path = path;
        }
        if let Some(size) = parse_env("BACKFILL_BATCH_SIZE")? {
            config.tasks.backfill_batch_size = size;
        }
        if let Some(attempts) = parse_env("TASK_MAX_ATTEMPTS")? {
            config.tasks.max_attempts = attempts;
        }
        if let Some(ms) = parse_env("TASK_INITIAL_BACKOFF_MS")? {
            config.tasks.initial_backoff_ms = ms;
        }
        if let Some(ms) = parse_env("TASK_MAX_BACKOFF_MS")? {
            config.tasks.max_backoff_ms = ms;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, VerificationError> {
        info!("Loading configuration from: {:?}", path);

        let contents = fs::read_to_string(path).map_err(|e| {
            VerificationError::ConfigError(format!("Failed to read {:?}: {}", path, e))
        })?;

        Self::from_yaml_str(&contents)
            .map_err(|e| VerificationError::ConfigError(format!("Failed to parse {:?}: {}", path, e)))
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    pub fn validate(&self) -> Result<(), VerificationError> {
        if self.tasks.backfill_batch_size == 0 {
            return Err(VerificationError::ConfigError(
                "backfill_batch_size must be at least 1".to_string(),
            ));
        }

        if self.tasks.max_attempts == 0 {
            return Err(VerificationError::ConfigError(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.tasks.initial_backoff_ms > self.tasks.max_backoff_ms {
            return Err(VerificationError::ConfigError(format!(
                "initial_backoff_ms ({}) > max_backoff_ms ({})",
                self.tasks.initial_backoff_ms, self.tasks.max_backoff_ms
            )));
        }

        if self.audit.enabled && self.audit.log_path.trim().is_empty() {
            return Err(VerificationError::ConfigError(
                "audit.log_path is required when auditing is enabled".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, VerificationError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| VerificationError::ConfigError(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(None),
    }
}
