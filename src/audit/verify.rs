//! Audit Log Verification
//!
//! Checks record hashes, chain links and timestamp order of an audit file.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::path::Path;
use tracing::info;

use crate::audit::entry::{AuditRecord, GENESIS_ACTION, ZERO_HASH};
use crate::audit::logger::load_records;

/// Verify complete audit log hash chain
pub fn verify_audit_log(records: &[AuditRecord]) -> Result<()> {
    let first = records.first().ok_or_else(|| anyhow!("Empty audit log"))?;

    if first.action != GENESIS_ACTION || first.previous_hash != ZERO_HASH {
        return Err(anyhow!("First record must be genesis"));
    }

    for (i, record) in records.iter().enumerate() {
        if !record.verify_hash() {
            return Err(anyhow!("Invalid hash in record {}", i));
        }
    }

    for i in 1..records.len() {
        if records[i].previous_hash != records[i - 1].this_hash {
            return Err(anyhow!(
                "Hash chain broken at record {}: expected {}, got {}",
                i,
                records[i - 1].this_hash,
                records[i].previous_hash
            ));
        }

        if records[i].timestamp < records[i - 1].timestamp {
            return Err(anyhow!(
                "Non-monotonic timestamp at record {}: {} < {}",
                i,
                records[i].timestamp,
                records[i - 1].timestamp
            ));
        }
    }

    info!("Audit log verification successful: {} records", records.len());
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub is_valid: bool,
    pub record_count: usize,
    pub head_hash: Option<String>,
    pub error_message: Option<String>,
}

/// Verify an audit file, reporting failures instead of returning them
pub fn verify_audit_log_file(path: &Path) -> VerificationReport {
    info!("Verifying audit log file: {:?}", path);

    if !path.exists() {
        return VerificationReport {
            is_valid: false,
            record_count: 0,
            head_hash: None,
            error_message: Some(format!("File does not exist: {:?}", path)),
        };
    }

    let records = match load_records(path) {
        Ok(records) => records,
        Err(e) => {
            return VerificationReport {
                is_valid: false,
                record_count: 0,
                head_hash: None,
                error_message: Some(format!("Failed to load records: {}", e)),
            }
        }
    };

    let result = verify_audit_log(&records);
    VerificationReport {
        is_valid: result.is_ok(),
        record_count: records.len(),
        head_hash: records.last().map(|r| r.this_hash.clone()),
        error_message: result.err().map(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{create_genesis_record, ActorContext};

    fn chain(len: usize) -> Vec<AuditRecord> {
        let mut records = vec![create_genesis_record("test")];
        for i in 0..len {
            let mut record = AuditRecord::new(&ActorContext::new(i as i64), "a", format!("{}", i));
            record.seal(records.last().unwrap().this_hash.clone());
            records.push(record);
        }
        records
    }

    #[test]
    fn test_valid_chain() {
        assert!(verify_audit_log(&chain(3)).is_ok());
    }

    #[test]
    fn test_empty_log_rejected() {
        assert!(verify_audit_log(&[]).is_err());
    }

    #[test]
    fn test_removed_record_detected() {
        let mut records = chain(3);
        records.remove(2);
        let err = verify_audit_log(&records).unwrap_err();
        assert!(err.to_string().contains("Hash chain broken"));
    }

    #[test]
    fn test_edited_record_detected() {
        let mut records = chain(2);
        records[1].description = "rewritten".into();
        let err = verify_audit_log(&records).unwrap_err();
        assert!(err.to_string().contains("Invalid hash"));
    }
}
