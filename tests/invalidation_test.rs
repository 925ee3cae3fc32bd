mod common;

use chrono::Utc;
use serde_json::json;

use common::{payload, TestEnv};
use logbook_verification::database::models::{DecisionOutcome, GrantRole};
use logbook_verification::signals::EntryUpdated;

#[tokio::test]
async fn test_amount_edit_resets_decided_record() {
    let env = TestEnv::new().await;
    let p = env.participants().await;
    let entry = env.entry(p.logbook_id, &p.owner, 10).await;

    env.ledger
        .record_decision(
            &p.supervisor,
            entry.id,
            DecisionOutcome::Approved,
            Some("ok".to_string()),
        )
        .await
        .unwrap();

    let (_, signal) = env
        .entries
        .update_payload(&p.owner, entry.id, payload(20))
        .await
        .unwrap();
    assert_eq!(signal.changed_fields, vec!["amount".to_string()]);

    let outcome = env.invalidator.run(&signal).await.unwrap();
    assert_eq!(outcome.reset, 1);
    assert_eq!(outcome.affected_verifiers, vec![p.supervisor.user_id]);
    assert!(!outcome.ignored);

    let records = env.ledger.records_for_entry(entry.id).await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert!(!record.decided);
    assert!(record.decided_at.is_none());
    assert!(record.outcome.is_none());

    let notes = record.notes.as_deref().unwrap();
    assert!(notes.contains("ok"));
    assert!(notes.contains("amount"));
    assert!(notes.contains("approved"));
}

#[tokio::test]
async fn test_every_decided_record_is_reset() {
    let env = TestEnv::new().await;
    let p = env.participants().await;
    let entry = env.entry(p.logbook_id, &p.owner, 10).await;

    env.ledger
        .record_decision(&p.supervisor, entry.id, DecisionOutcome::Rejected, None)
        .await
        .unwrap();

    // A second verifier whose row was decided before their grant was moved
    let former = env.user("former-supervisor").await;
    sqlx::query(
        r#"
        INSERT INTO verification_records
            (entry_id, verifier_id, decided, outcome, decided_at, notes, created_at, updated_at)
        VALUES (?, ?, TRUE, 'approved', ?, 'fine', ?, ?)
        "#,
    )
    .bind(entry.id)
    .bind(former.user_id)
    .bind(Utc::now())
    .bind(Utc::now())
    .bind(Utc::now())
    .execute(env.db.pool())
    .await
    .unwrap();

    let (_, signal) = env
        .entries
        .update_payload(&p.owner, entry.id, payload(11))
        .await
        .unwrap();
    let outcome = env.invalidator.run(&signal).await.unwrap();

    assert_eq!(outcome.reset, 2);
    let records = env.ledger.records_for_entry(entry.id).await.unwrap();
    assert!(records.iter().all(|r| !r.decided));
    assert!(records
        .iter()
        .all(|r| r.notes.as_deref().unwrap_or("").contains("Previous decision")));
}

#[tokio::test]
async fn test_metadata_only_edit_keeps_decisions() {
    let env = TestEnv::new().await;
    let p = env.participants().await;
    let entry = env.entry(p.logbook_id, &p.owner, 10).await;

    env.ledger
        .record_decision(
            &p.supervisor,
            entry.id,
            DecisionOutcome::Approved,
            Some("ok".to_string()),
        )
        .await
        .unwrap();

    let mut edited = payload(10);
    edited.insert("updated_at".to_string(), json!("2026-02-01T00:00:00Z"));
    edited.insert("_sync_token".to_string(), json!("abc"));

    let (_, signal) = env
        .entries
        .update_payload(&p.owner, entry.id, edited)
        .await
        .unwrap();
    let outcome = env.invalidator.run(&signal).await.unwrap();

    assert!(outcome.ignored);
    assert_eq!(outcome.reset, 0);

    let records = env.ledger.records_for_entry(entry.id).await.unwrap();
    assert!(records[0].decided);
    assert_eq!(records[0].notes.as_deref(), Some("ok"));
    assert_eq!(records[0].outcome, Some(DecisionOutcome::Approved));
}

#[tokio::test]
async fn test_pending_records_are_untouched() {
    let env = TestEnv::new().await;
    let p = env.participants().await;
    let entry = env.entry(p.logbook_id, &p.owner, 10).await;
    env.backfill
        .run(p.supervisor.user_id, p.logbook_id)
        .await
        .unwrap();

    let (_, signal) = env
        .entries
        .update_payload(&p.owner, entry.id, payload(20))
        .await
        .unwrap();
    let outcome = env.invalidator.run(&signal).await.unwrap();

    assert_eq!(outcome.reset, 0);
    let records = env.ledger.records_for_entry(entry.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].notes.is_none());
    assert!(env.ledger.history_for_entry(entry.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reset_is_recorded_in_history_and_audit() {
    let env = TestEnv::new().await;
    let p = env.participants().await;
    let entry = env.entry(p.logbook_id, &p.owner, 10).await;

    env.ledger
        .record_decision(
            &p.supervisor,
            entry.id,
            DecisionOutcome::Approved,
            Some("ok".to_string()),
        )
        .await
        .unwrap();

    let (_, signal) = env
        .entries
        .update_payload(&p.owner, entry.id, payload(20))
        .await
        .unwrap();
    env.invalidator.run(&signal).await.unwrap();

    let history = env.ledger.history_for_entry(entry.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].verifier_id, p.supervisor.user_id);
    assert_eq!(history[0].previous_outcome, Some(DecisionOutcome::Approved));
    assert_eq!(history[0].previous_notes.as_deref(), Some("ok"));
    assert_eq!(history[0].invalidated_by, p.owner.user_id);
    assert_eq!(history[0].changed_fields, vec!["amount".to_string()]);

    let audits = env
        .audit
        .get_records_by_action("verification.invalidated")
        .await
        .unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].actor, Some(p.owner.user_id));
    assert_eq!(audits[0].ip.as_deref(), Some("127.0.0.1"));
    assert_eq!(
        audits[0].metadata.get("verifiers"),
        Some(&p.supervisor.user_id.to_string())
    );
}

#[tokio::test]
async fn test_redelivered_signal_is_harmless() {
    let env = TestEnv::new().await;
    let p = env.participants().await;
    let entry = env.entry(p.logbook_id, &p.owner, 10).await;

    env.ledger
        .record_decision(&p.supervisor, entry.id, DecisionOutcome::Approved, None)
        .await
        .unwrap();

    let (_, signal) = env
        .entries
        .update_payload(&p.owner, entry.id, payload(20))
        .await
        .unwrap();

    let first = env.invalidator.run(&signal).await.unwrap();
    assert_eq!(first.reset, 1);

    // The verifier checks the new content before the signal comes round again
    env.ledger
        .record_decision(
            &p.supervisor,
            entry.id,
            DecisionOutcome::Approved,
            Some("rechecked 20".to_string()),
        )
        .await
        .unwrap();

    let second = env.invalidator.run(&signal).await.unwrap();
    assert_eq!(second.reset, 0);

    let records = env.ledger.records_for_entry(entry.id).await.unwrap();
    assert!(records[0].decided);
    assert_eq!(records[0].outcome, Some(DecisionOutcome::Approved));
    assert_eq!(records[0].notes.as_deref(), Some("rechecked 20"));
    assert_eq!(env.ledger.history_for_entry(entry.id).await.unwrap().len(), 1);

    let audits = env
        .audit
        .get_records_by_action("verification.invalidated")
        .await
        .unwrap();
    assert_eq!(audits.len(), 1);
}

#[tokio::test]
async fn test_decision_after_edit_survives_late_signal() {
    let env = TestEnv::new().await;
    let p = env.participants().await;
    let entry = env.entry(p.logbook_id, &p.owner, 10).await;

    let (_, signal) = env
        .entries
        .update_payload(&p.owner, entry.id, payload(20))
        .await
        .unwrap();

    // Decided on the edited content before the worker got to the signal
    env.ledger
        .record_decision(&p.supervisor, entry.id, DecisionOutcome::Rejected, None)
        .await
        .unwrap();

    let outcome = env.invalidator.run(&signal).await.unwrap();
    assert_eq!(outcome.reset, 0);
    assert!(outcome.affected_verifiers.is_empty());

    let records = env.ledger.records_for_entry(entry.id).await.unwrap();
    assert!(records[0].decided);
    assert_eq!(records[0].outcome, Some(DecisionOutcome::Rejected));
    assert!(env.ledger.history_for_entry(entry.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_only_author_may_edit() {
    let env = TestEnv::new().await;
    let p = env.participants().await;
    let entry = env.entry(p.logbook_id, &p.owner, 10).await;

    let result = env
        .entries
        .update_payload(&p.supervisor, entry.id, payload(99))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_decision_requires_supervisor_grant() {
    let env = TestEnv::new().await;
    let p = env.participants().await;
    let entry = env.entry(p.logbook_id, &p.owner, 10).await;
    let contributor = env.user("contributor").await;
    env.grant(&contributor, p.logbook_id, GrantRole::Contributor)
        .await;

    for actor in [&p.owner, &contributor] {
        let result = env
            .ledger
            .record_decision(actor, entry.id, DecisionOutcome::Approved, None)
            .await;
        assert!(result.is_err());
    }
}

#[tokio::test]
async fn test_invalidation_ignores_unknown_entry_gracefully() {
    let env = TestEnv::new().await;
    let p = env.participants().await;

    let signal = EntryUpdated {
        entry_id: 424242,
        logbook_id: p.logbook_id,
        changed_fields: vec!["amount".to_string()],
        editor: p.owner.clone(),
        edited_at: Utc::now(),
    };

    let outcome = env.invalidator.run(&signal).await.unwrap();
    assert_eq!(outcome.reset, 0);
}
