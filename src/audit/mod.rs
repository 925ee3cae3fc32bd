//! Audit Sink
//!
//! Write-only, tamper-evident record of every review, assessment and
//! invalidation the engine performs.

pub mod entry;
pub mod logger;
pub mod verify;

pub use entry::{ActorContext, AuditRecord};
pub use logger::{AuditLogger, AuditSink, NullAuditSink};
pub use verify::{verify_audit_log, verify_audit_log_file, VerificationReport};
