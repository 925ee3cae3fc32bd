mod common;

use async_trait::async_trait;
use std::sync::Arc;

use common::TestEnv;
use logbook_verification::audit::{ActorContext, AuditRecord, AuditSink};
use logbook_verification::grants::GrantStore;
use logbook_verification::database::models::{DecisionOutcome, GrantRole};
use logbook_verification::VerificationError;

#[tokio::test]
async fn test_one_supervisor_per_logbook() {
    let env = TestEnv::new().await;
    let p = env.participants().await;
    let second = env.user("second-supervisor").await;

    let result = env
        .grants
        .create_grant(&ActorContext::new(0), second.user_id, p.logbook_id, GrantRole::Supervisor)
        .await;
    assert!(matches!(result, Err(VerificationError::ValidationError(_))));
}

#[tokio::test]
async fn test_one_grant_per_user() {
    let env = TestEnv::new().await;
    let p = env.participants().await;

    let result = env
        .grants
        .create_grant(&ActorContext::new(0), p.owner.user_id, p.logbook_id, GrantRole::Contributor)
        .await;
    assert!(matches!(result, Err(VerificationError::ValidationError(_))));
}

#[tokio::test]
async fn test_contributors_are_unlimited() {
    let env = TestEnv::new().await;
    let p = env.participants().await;

    for name in ["c1", "c2", "c3"] {
        let user = env.user(name).await;
        env.grant(&user, p.logbook_id, GrantRole::Contributor).await;
    }

    let grants = env.grants.grants_for_logbook(p.logbook_id).await.unwrap();
    assert_eq!(grants.len(), 5);
}

#[tokio::test]
async fn test_grant_on_missing_logbook() {
    let env = TestEnv::new().await;
    let user = env.user("someone").await;

    let result = env
        .grants
        .create_grant(&ActorContext::new(0), user.user_id, 777, GrantRole::Owner)
        .await;
    assert!(matches!(result, Err(VerificationError::NotFound(_))));
}

#[tokio::test]
async fn test_grant_returns_signal() {
    let env = TestEnv::new().await;
    let logbook_id = env.db.create_logbook(1, "Lab").await.unwrap();
    let user = env.user("verifier").await;

    let (grant, signal) = env
        .grants
        .create_grant(&ActorContext::new(0), user.user_id, logbook_id, GrantRole::Supervisor)
        .await
        .unwrap();

    assert_eq!(grant.role, GrantRole::Supervisor);
    assert!(!grant.reviewed);
    assert_eq!(signal.user_id, user.user_id);
    assert_eq!(signal.logbook_id, logbook_id);
    assert_eq!(signal.role, GrantRole::Supervisor);
}

#[tokio::test]
async fn test_revoke_retains_ledger_rows() {
    let env = TestEnv::new().await;
    let p = env.participants().await;
    let entry = env.entry(p.logbook_id, &p.owner, 10).await;

    env.ledger
        .record_decision(&p.supervisor, entry.id, DecisionOutcome::Approved, None)
        .await
        .unwrap();

    let revoked = env
        .grants
        .revoke_grant(&ActorContext::new(0), p.supervisor.user_id, p.logbook_id)
        .await
        .unwrap();
    assert_eq!(revoked.role, GrantRole::Supervisor);

    let records = env.ledger.records_for_entry(entry.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].decided);

    // Slot is free again
    let replacement = env.user("replacement").await;
    env.grant(&replacement, p.logbook_id, GrantRole::Supervisor)
        .await;

    let audits = env.audit.get_records_by_action("grant.revoked").await.unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(
        audits[0].metadata.get("retained_records").map(String::as_str),
        Some("1")
    );
}

#[tokio::test]
async fn test_missing_supervisor_counts_as_unreviewed() {
    let env = TestEnv::new().await;
    let logbook_id = env.db.create_logbook(1, "Solo").await.unwrap();
    let owner = env.user("solo-owner").await;
    let admin = env.admin("solo-admin", 1).await;
    env.grant(&owner, logbook_id, GrantRole::Owner).await;

    env.machine
        .set_review_status(&owner, logbook_id, true)
        .await
        .unwrap();

    let status = env.machine.get_status(logbook_id).await.unwrap();
    assert!(status.supervisor_id.is_none());
    assert!(!status.assessment_ready);

    match env.machine.set_assessment(&admin, logbook_id, true).await {
        Err(VerificationError::PrecedenceViolation { missing, .. }) => {
            assert_eq!(missing, vec![GrantRole::Supervisor]);
        }
        other => panic!("expected precedence violation, got {:?}", other),
    }
}

struct RejectingSink;

#[async_trait]
impl AuditSink for RejectingSink {
    async fn record(&self, _record: AuditRecord) -> Result<(), VerificationError> {
        Err(VerificationError::AuditError("audit volume full".to_string()))
    }
}

#[tokio::test]
async fn test_unaudited_grant_is_rolled_back() {
    let env = TestEnv::new().await;
    let logbook_id = env.db.create_logbook(1, "Audit outage").await.unwrap();
    let user = env.user("pending-supervisor").await;

    let store = GrantStore::new(env.db.pool().clone(), Arc::new(RejectingSink));
    let result = store
        .create_grant(&ActorContext::new(0), user.user_id, logbook_id, GrantRole::Supervisor)
        .await;
    assert!(matches!(result, Err(VerificationError::AuditError(_))));
    assert!(env.grants.grants_for_logbook(logbook_id).await.unwrap().is_empty());

    // Once auditing recovers the same grant goes through and yields its signal
    let (_, signal) = env
        .grants
        .create_grant(&ActorContext::new(0), user.user_id, logbook_id, GrantRole::Supervisor)
        .await
        .unwrap();
    assert_eq!(signal.user_id, user.user_id);
}
