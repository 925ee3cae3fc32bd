//! Verification Engine
//!
//! The logbook-wide review gate and the per-entry ledger, plus the two
//! background procedures that keep the ledger consistent as verifiers are
//! added and entries change.

pub mod backfill;
pub mod invalidation;
pub mod ledger;
pub mod state_machine;

pub use backfill::{BackfillSummary, VerifierBackfill};
pub use invalidation::{invalidation_note, EntryUpdateInvalidator, InvalidationOutcome};
pub use ledger::VerificationLedger;
pub use state_machine::{
    AssessmentUpdate, ReviewState, ReviewStateMachine, ReviewUpdate, StepStatus,
    VerificationStatus, WorkflowSummary,
};
