//! Audit Logger
//!
//! Append-only JSONL audit file with a hash chain across records.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::audit::entry::{create_genesis_record, AuditRecord};
use crate::error::VerificationError;

/// Write-only destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), VerificationError>;
}

/// Sink used when auditing is switched off
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), VerificationError> {
        debug!("Audit disabled, dropping: {}", record.summary());
        Ok(())
    }
}

struct LogState {
    file: File,
    head_hash: String,
    entry_count: u64,
}

#[derive(Clone)]
pub struct AuditLogger {
    log_path: PathBuf,
    state: Arc<Mutex<LogState>>,
}

impl AuditLogger {
    /// Open (or start) the audit log at `log_path`, resuming its hash chain
    pub async fn new(log_path: impl Into<PathBuf>, server_id: &str) -> Result<Self> {
        let log_path = log_path.into();

        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| anyhow!("Failed to create log directory: {}", e))?;
            }
        }

        let existing = load_records(&log_path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| anyhow!("Failed to open audit log file: {}", e))?;

        let head_hash = existing
            .last()
            .map(|r| r.this_hash.clone())
            .unwrap_or_default();

        let logger = Self {
            log_path,
            state: Arc::new(Mutex::new(LogState {
                file,
                head_hash,
                entry_count: existing.len() as u64,
            })),
        };

        if existing.is_empty() {
            logger.append(create_genesis_record(server_id)).await?;
        } else {
            info!("Loaded {} existing audit records", existing.len());
        }

        Ok(logger)
    }

    /// Seal `record` onto the chain and append it. Records passed in already
    /// sealed (the genesis record) keep their hash.
    async fn append(&self, mut record: AuditRecord) -> Result<()> {
        let mut state = self.state.lock().await;

        if record.this_hash.is_empty() || !state.head_hash.is_empty() {
            record.seal(state.head_hash.clone());
        }

        let json = serde_json::to_string(&record)
            .map_err(|e| anyhow!("Failed to serialize record: {}", e))?;

        writeln!(state.file, "{}", json)
            .map_err(|e| anyhow!("Failed to write to audit log: {}", e))?;
        state
            .file
            .flush()
            .map_err(|e| anyhow!("Failed to flush audit log: {}", e))?;

        state.head_hash = record.this_hash.clone();
        state.entry_count += 1;

        debug!("Appended audit record: {}", record.summary());
        Ok(())
    }

    pub async fn get_head_hash(&self) -> String {
        self.state.lock().await.head_hash.clone()
    }

    pub async fn get_entry_count(&self) -> u64 {
        self.state.lock().await.entry_count
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub async fn get_all_records(&self) -> Result<Vec<AuditRecord>> {
        // Hold the lock so a concurrent append cannot leave a partial line
        let _state = self.state.lock().await;
        load_records(&self.log_path)
    }

    pub async fn get_records_by_action(&self, action: &str) -> Result<Vec<AuditRecord>> {
        Ok(self
            .get_all_records()
            .await?
            .into_iter()
            .filter(|record| record.action == action)
            .collect())
    }
}

#[async_trait]
impl AuditSink for AuditLogger {
    async fn record(&self, record: AuditRecord) -> Result<(), VerificationError> {
        self.append(record)
            .await
            .map_err(|e| VerificationError::AuditError(e.to_string()))
    }
}

/// Read every record from a JSONL audit file; a missing file has none
pub fn load_records(path: &Path) -> Result<Vec<AuditRecord>> {
    if !path.exists() {
        return Ok(vec![]);
    }

    let file = File::open(path).map_err(|e| anyhow!("Failed to open audit log file: {}", e))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| anyhow!("Failed to read line {}: {}", line_num + 1, e))?;
        if line.trim().is_empty() {
            continue;
        }

        let record: AuditRecord = serde_json::from_str(&line)
            .map_err(|e| anyhow!("Failed to parse record at line {}: {}", line_num + 1, e))?;
        records.push(record);
    }

    Ok(records)
}
