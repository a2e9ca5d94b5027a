#![cfg(feature = "inmem-store")]

use std::sync::atomic::Ordering;

use bullhorn::audit::MemoryErrorLog;
use bullhorn::dispatch::{dispatch, plan_email};
use bullhorn::email::RecordingGateway;
use bullhorn::flush::{flush, recover_messages, RecoverError};
use bullhorn::models::*;
use bullhorn::repo::{inmem::InMemRepo, BroadcastRepo, MessageRepo};
use bullhorn::resolver::{resolve, BroadcastTargets};
use chrono::Utc;
use serial_test::serial;

fn repo() -> InMemRepo {
    std::env::set_var("BULLHORN_DATA_DIR", tempfile::tempdir().unwrap().path());
    InMemRepo::new()
}

async fn seed(r: &InMemRepo, username: &str, email: Option<&str>) -> i64 {
    use bullhorn::repo::DirectoryRepo;
    r.insert_user(NewUser {
        username: username.into(),
        email: email.map(String::from),
        school: None,
        school_id: None,
        location: None,
        is_admin: false,
        status: UserStatus::Active,
    })
    .await
    .unwrap()
    .id
}

/// Run the real send pipeline (resolve, dispatch, plan, persist) so flush
/// tests operate on rows shaped exactly like production ones.
async fn send_urgent(
    r: &InMemRepo,
    gw: &RecordingGateway,
    errlog: &MemoryErrorLog,
    ids: Vec<i64>,
    title: &str,
) -> Broadcast {
    let targets = BroadcastTargets { user_ids: Some(ids), filters: None };
    let res = resolve(r, &targets).await.unwrap();
    let outcome = dispatch(r, errlog, &res.recipients, title, "body", Priority::Urgent).await;
    let plan = plan_email(
        gw,
        errlog,
        &res.recipients,
        title,
        "body",
        Priority::Urgent,
        serde_json::json!({}),
    )
    .await;
    let total = res.recipients.len() as i64;
    r.insert_broadcast(NewBroadcast {
        created_by: 1,
        title: title.into(),
        content: "body".into(),
        priority: Priority::Urgent,
        scope: res.scope,
        criteria_snapshot: serde_json::json!({}),
        target_count: total,
        sent_count: outcome.sent_count,
        invalid_ids: res.invalid_ids,
        failed_user_ids: outcome.failed_user_ids,
        message_ids: outcome.message_ids,
        message_id_map: outcome.id_map,
        email: plan.state,
        audit_log_id: None,
        request_log_id: None,
        error_log_ids: vec![],
    })
    .await
    .unwrap()
}

#[tokio::test]
#[serial]
async fn dry_run_reconciliation_never_calls_the_sender() {
    let r = repo();
    let gw = RecordingGateway::new();
    let errlog = MemoryErrorLog::new();
    let a = seed(&r, "alice", Some("alice@x.io")).await;
    let b = seed(&r, "bob", Some("bob@x.io")).await;

    let bc = send_urgent(&r, &gw, &errlog, vec![a, b], "All hands").await;
    assert_eq!(bc.email.status, EmailStatus::Queued);
    assert!(bc.email.completed_at.is_none());

    let report = flush(&r, &gw, &errlog, 10, false).await.unwrap();
    assert_eq!(report.processed.len(), 1);
    assert_eq!(report.processed[0].status, EmailStatus::Sent);
    assert!(gw.sent_calls().is_empty());

    let stored = r.get_broadcast(bc.id).await.unwrap();
    assert_eq!(stored.email.status, EmailStatus::Sent);
    assert!(stored.email.completed_at.is_some());
}

#[tokio::test]
#[serial]
async fn dry_run_marks_partial_when_an_email_is_missing() {
    let r = repo();
    let gw = RecordingGateway::new();
    let errlog = MemoryErrorLog::new();
    let a = seed(&r, "alice", Some("alice@x.io")).await;
    let b = seed(&r, "bob", None).await;

    let bc = send_urgent(&r, &gw, &errlog, vec![a, b], "Downtime").await;
    let report = flush(&r, &gw, &errlog, 10, false).await.unwrap();

    assert_eq!(report.processed[0].status, EmailStatus::Partial);
    assert_eq!(report.processed[0].missing_email_user_ids, vec![b]);
    assert!(gw.sent_calls().is_empty());
}

#[tokio::test]
#[serial]
async fn forced_flush_sends_one_batch_and_persists_partial() {
    let r = repo();
    let gw = RecordingGateway::new();
    let errlog = MemoryErrorLog::new();
    let a = seed(&r, "alice", Some("alice@x.io")).await;
    let b = seed(&r, "bob", None).await;

    let bc = send_urgent(&r, &gw, &errlog, vec![a, b], "Maintenance").await;
    let report = flush(&r, &gw, &errlog, 10, true).await.unwrap();

    assert_eq!(report.processed.len(), 1);
    assert_eq!(report.processed[0].status, EmailStatus::Partial);
    assert!(report.processed[0].force);

    let calls = gw.sent_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].recipients.len(), 1);
    assert_eq!(calls[0].recipients[0].email, "alice@x.io");

    let stored = r.get_broadcast(bc.id).await.unwrap();
    assert_eq!(stored.email.status, EmailStatus::Partial);
    assert_eq!(
        stored.email.missing_email_user_ids.iter().copied().collect::<Vec<_>>(),
        vec![b]
    );
    assert_eq!(stored.email.successful_chunks, 1);
}

#[tokio::test]
#[serial]
async fn send_failure_marks_failed_and_retains_recipient_ids() {
    let r = repo();
    let gw = RecordingGateway::new();
    let errlog = MemoryErrorLog::new();
    let a = seed(&r, "alice", Some("alice@x.io")).await;

    let bc = send_urgent(&r, &gw, &errlog, vec![a], "Outage").await;
    gw.fail_send.store(true, Ordering::SeqCst);

    let report = flush(&r, &gw, &errlog, 10, true).await.unwrap();
    assert_eq!(report.processed[0].status, EmailStatus::Failed);
    assert!(report.processed[0].errors.iter().any(|e| e.contains("send rejected")));

    let stored = r.get_broadcast(bc.id).await.unwrap();
    assert_eq!(stored.email.status, EmailStatus::Failed);
    assert_eq!(stored.email.failed_chunks, 1);
    assert!(stored.email.failed_recipient_ids.contains(&a));
    assert!(errlog.entries().iter().any(|e| e.kind == "broadcast.email_send"));

    // force retry with the sender healthy again clears the failure bookkeeping
    gw.fail_send.store(false, Ordering::SeqCst);
    let report = flush(&r, &gw, &errlog, 10, true).await.unwrap();
    assert_eq!(report.processed[0].status, EmailStatus::Sent);
    let stored = r.get_broadcast(bc.id).await.unwrap();
    assert_eq!(stored.email.failed_chunks, 0);
    assert!(stored.email.failed_recipient_ids.is_empty());
}

#[tokio::test]
#[serial]
async fn sent_rows_are_skipped_and_failed_needs_force() {
    let r = repo();
    let gw = RecordingGateway::new();
    let errlog = MemoryErrorLog::new();
    let a = seed(&r, "alice", Some("alice@x.io")).await;

    let bc = send_urgent(&r, &gw, &errlog, vec![a], "First").await;
    flush(&r, &gw, &errlog, 10, false).await.unwrap(); // -> sent

    let report = flush(&r, &gw, &errlog, 10, false).await.unwrap();
    assert!(report.processed.is_empty());
    assert_eq!(report.skipped, vec![bc.id]);
    assert!(gw.sent_calls().is_empty());

    // push a second broadcast into failed, then check force gating
    gw.fail_send.store(true, Ordering::SeqCst);
    let bc2 = send_urgent(&r, &gw, &errlog, vec![a], "Second").await;
    flush(&r, &gw, &errlog, 10, true).await.unwrap(); // bc2 -> failed
    gw.fail_send.store(false, Ordering::SeqCst);

    let report = flush(&r, &gw, &errlog, 10, false).await.unwrap();
    assert!(report.skipped.contains(&bc2.id));
    let report = flush(&r, &gw, &errlog, 10, true).await.unwrap();
    assert!(report.processed.iter().any(|p| p.id == bc2.id && p.status == EmailStatus::Sent));
}

#[tokio::test]
#[serial]
async fn empty_snapshots_recover_recipients_by_content_hash() {
    let r = repo();
    let gw = RecordingGateway::new();
    let errlog = MemoryErrorLog::new();
    let a = seed(&r, "alice", Some("alice@x.io")).await;
    let b = seed(&r, "bob", None).await;

    // messages exist, but the broadcast row kept no id snapshots
    for id in [a, b] {
        r.create_message(NewMessage {
            receiver_id: id,
            title: "Window test".into(),
            content: "body".into(),
            priority: Priority::Urgent,
            kind: MESSAGE_KIND_SYSTEM.into(),
        })
        .await
        .unwrap();
    }
    let mut email = EmailDeliveryState::default();
    email.triggered = true;
    email.status = EmailStatus::Queued;
    email.attempted_recipients = 1;
    let bc = r
        .insert_broadcast(NewBroadcast {
            created_by: 1,
            title: "Window test".into(),
            content: "body".into(),
            priority: Priority::Urgent,
            scope: Scope::Custom,
            criteria_snapshot: serde_json::json!({}),
            target_count: 2,
            sent_count: 2,
            invalid_ids: vec![],
            failed_user_ids: vec![],
            message_ids: vec![],
            message_id_map: Default::default(),
            email,
            audit_log_id: None,
            request_log_id: None,
            error_log_ids: vec![],
        })
        .await
        .unwrap();

    let report = flush(&r, &gw, &errlog, 10, true).await.unwrap();
    assert_eq!(report.processed.len(), 1);
    assert_eq!(report.processed[0].id, bc.id);
    assert_eq!(report.processed[0].status, EmailStatus::Partial);
    assert_eq!(report.processed[0].missing_email_user_ids, vec![b]);
    assert_eq!(gw.sent_calls().len(), 1);
}

#[tokio::test]
#[serial]
async fn tampered_content_hash_fails_recovery() {
    let r = repo();
    let now = Utc::now();
    let broken = Broadcast {
        id: 42,
        created_at: now,
        created_by: 1,
        title: "Ghost".into(),
        content: "body".into(),
        priority: Priority::Urgent,
        scope: Scope::Custom,
        criteria_snapshot: serde_json::json!({}),
        target_count: 1,
        sent_count: 1,
        invalid_ids: vec![],
        failed_user_ids: vec![],
        failed_user_ids_truncated: false,
        message_ids_snapshot: vec![],
        message_ids_snapshot_truncated: false,
        message_id_map_snapshot: Default::default(),
        message_id_map_truncated: false,
        content_hash: "deadbeef".into(), // does not match sha256(title||content)
        email: EmailDeliveryState::default(),
        audit_log_id: None,
        request_log_id: None,
        error_log_ids: vec![],
    };
    let err = recover_messages(&r, &broken).await.unwrap_err();
    assert!(matches!(err, RecoverError::HashMismatch));
}

// The flusher takes no lock; two interleaved flushes on the same row are
// last-writer-wins. Both must finish and leave a terminal state behind.
#[tokio::test]
#[serial]
async fn concurrent_flushes_are_last_writer_wins() {
    let r = repo();
    let gw = RecordingGateway::new();
    let errlog = MemoryErrorLog::new();
    let a = seed(&r, "alice", Some("alice@x.io")).await;

    let bc = send_urgent(&r, &gw, &errlog, vec![a], "Race").await;

    let (r1, r2) = tokio::join!(
        flush(&r, &gw, &errlog, 10, false),
        flush(&r, &gw, &errlog, 10, false),
    );
    r1.unwrap();
    r2.unwrap();

    let stored = r.get_broadcast(bc.id).await.unwrap();
    assert_eq!(stored.email.status, EmailStatus::Sent);
    assert!(stored.email.completed_at.is_some());
}
