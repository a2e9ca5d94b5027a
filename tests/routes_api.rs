#![cfg(feature = "inmem-store")]

use std::sync::Arc;

use actix_web::{test, web, App};
use bullhorn::audit::{MemoryAudit, MemoryErrorLog};
use bullhorn::auth::{create_jwt, Role};
use bullhorn::email::RecordingGateway;
use bullhorn::models::{NewUser, UserStatus, ID_SNAPSHOT_CAP};
use bullhorn::repo::{inmem::InMemRepo, BroadcastRepo, DirectoryRepo, MessageRepo};
use bullhorn::{config, AppState, SecurityHeaders};
use serial_test::serial;

fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    std::env::set_var("BULLHORN_DATA_DIR", tempfile::tempdir().unwrap().path());
}

fn admin_token() -> String {
    create_jwt(1, "admin", vec![Role::Admin]).unwrap()
}

fn user_token() -> String {
    create_jwt(2, "user", vec![Role::User]).unwrap()
}

struct Harness {
    repo: Arc<InMemRepo>,
    gateway: Arc<RecordingGateway>,
    audit: Arc<MemoryAudit>,
    errors: Arc<MemoryErrorLog>,
}

fn harness() -> Harness {
    setup_env();
    Harness {
        repo: Arc::new(InMemRepo::new()),
        gateway: Arc::new(RecordingGateway::new()),
        audit: Arc::new(MemoryAudit::new()),
        errors: Arc::new(MemoryErrorLog::new()),
    }
}

impl Harness {
    fn state(&self) -> AppState {
        AppState {
            repo: self.repo.clone(),
            email_queue: self.gateway.clone(),
            email_sender: self.gateway.clone(),
            audit: self.audit.clone(),
            errors: self.errors.clone(),
        }
    }

    async fn seed(&self, username: &str, email: Option<&str>) -> i64 {
        self.repo
            .insert_user(NewUser {
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
}

macro_rules! init_app {
    ($h:expr) => {
        test::init_service(
            App::new()
                .wrap(SecurityHeaders::from_env())
                .app_data(web::Data::new($h.state()))
                .configure(config),
        )
        .await
    };
}

#[actix_web::test]
#[serial]
async fn broadcast_requires_an_authenticated_admin() {
    let h = harness();
    let app = init_app!(h);

    let body = serde_json::json!({"title": "x", "content": "y"});

    let req = test::TestRequest::post().uri("/api/v1/broadcast").set_json(&body).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    let req = test::TestRequest::post()
        .uri("/api/v1/broadcast")
        .insert_header(("Authorization", format!("Bearer {}", user_token())))
        .set_json(&body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);
}

#[actix_web::test]
#[serial]
async fn broadcast_validation_rejects_before_side_effects() {
    let h = harness();
    let app = init_app!(h);
    let auth = ("Authorization", format!("Bearer {}", admin_token()));

    for body in [
        serde_json::json!({"title": "  ", "content": "y"}),
        serde_json::json!({"title": "x".repeat(256), "content": "y"}),
        serde_json::json!({"title": "x", "content": ""}),
        serde_json::json!({"title": "x", "content": "y", "target_users": [0, -3]}),
    ] {
        let req = test::TestRequest::post()
            .uri("/api/v1/broadcast")
            .insert_header(auth.clone())
            .set_json(&body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400, "body: {body}");
    }

    // unknown priority dies in deserialization
    let req = test::TestRequest::post()
        .uri("/api/v1/broadcast")
        .insert_header(auth.clone())
        .set_json(&serde_json::json!({"title": "x", "content": "y", "priority": "shouting"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    // nothing was dispatched or queued
    assert!(h.gateway.queued_calls().is_empty());
    assert!(h.audit.entries().is_empty());
}

#[actix_web::test]
#[serial]
async fn unresolvable_recipient_set_is_404() {
    let h = harness();
    let app = init_app!(h);

    let req = test::TestRequest::post()
        .uri("/api/v1/broadcast")
        .insert_header(("Authorization", format!("Bearer {}", admin_token())))
        .set_json(&serde_json::json!({"title": "x", "content": "y", "target_users": [424242]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
#[serial]
async fn normal_priority_never_touches_the_email_queue() {
    let h = harness();
    let a = h.seed("alice", Some("alice@x.io")).await;
    let b = h.seed("bob", Some("bob@x.io")).await;
    let app = init_app!(h);

    let req = test::TestRequest::post()
        .uri("/api/v1/broadcast")
        .insert_header(("Authorization", format!("Bearer {}", admin_token())))
        .set_json(&serde_json::json!({
            "title": "Weekly digest",
            "content": "nothing urgent",
            "priority": "normal",
            "target_users": [a, b]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();

    assert_eq!(v["success"], true);
    assert_eq!(v["sent_count"], 2);
    assert_eq!(v["total_targets"], 2);
    assert_eq!(v["email_delivery"]["status"], "skipped");
    assert_eq!(v["email_delivery"]["triggered"], false);
    assert!(h.gateway.queued_calls().is_empty());
    assert_eq!(h.audit.entries().len(), 1);
    assert!(h.errors.entries().is_empty());
}

#[actix_web::test]
#[serial]
async fn urgent_broadcast_queues_then_force_flush_persists_partial() {
    let h = harness();
    let a = h.seed("alice", Some("alice@x.io")).await;
    let b = h.seed("bob", None).await; // no email
    let app = init_app!(h);
    let auth = ("Authorization", format!("Bearer {}", admin_token()));

    let req = test::TestRequest::post()
        .uri("/api/v1/broadcast")
        .insert_header(auth.clone())
        .set_json(&serde_json::json!({
            "title": "Maintenance",
            "content": "System will be down",
            "priority": "urgent",
            "target_users": [a, b]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();

    assert_eq!(v["sent_count"], 2);
    assert_eq!(v["message_id_count"], 2);
    assert_eq!(v["email_delivery"]["status"], "queued");
    assert_eq!(v["email_delivery"]["missing_email_user_ids"], serde_json::json!([b]));
    assert_eq!(v["email_delivery"]["completed_at"], serde_json::Value::Null);
    assert!(v["request_id"].as_str().unwrap().len() > 10);
    let broadcast_id = v["broadcast_id"].as_i64().unwrap();
    assert_eq!(h.gateway.queued_calls().len(), 1);

    // force flush actually sends; the row lands on partial (bob still has no
    // address)
    let req = test::TestRequest::post()
        .uri("/api/v1/broadcast/flush")
        .insert_header(auth.clone())
        .set_json(&serde_json::json!({"force": true}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["count"], 1);
    assert_eq!(v["processed"][0]["id"].as_i64().unwrap(), broadcast_id);
    assert_eq!(v["processed"][0]["status"], "partial");
    assert_eq!(v["processed"][0]["missing_email_user_ids"], serde_json::json!([b]));

    assert_eq!(h.gateway.sent_calls().len(), 1);
    let stored = h.repo.get_broadcast(broadcast_id).await.unwrap();
    assert_eq!(
        stored.email.missing_email_user_ids.iter().copied().collect::<Vec<_>>(),
        vec![b]
    );
    assert!(stored.email.completed_at.is_some());
}

#[actix_web::test]
#[serial]
async fn invalid_ids_are_reported_not_fatal() {
    let h = harness();
    let a = h.seed("alice", None).await;
    let app = init_app!(h);

    let req = test::TestRequest::post()
        .uri("/api/v1/broadcast")
        .insert_header(("Authorization", format!("Bearer {}", admin_token())))
        .set_json(&serde_json::json!({
            "title": "hello",
            "content": "world",
            "target_users": [a, 999999]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["invalid_user_ids"], serde_json::json!([999999]));
    assert_eq!(v["sent_count"], 1);
    assert_eq!(v["total_targets"], 1);
}

#[actix_web::test]
#[serial]
async fn large_broadcast_truncates_persisted_snapshots_only() {
    let h = harness();
    for i in 0..500 {
        h.seed(&format!("user-{i}"), Some(&format!("u{i}@x.io"))).await;
    }
    let app = init_app!(h);

    // no explicit targets: scope "all"
    let req = test::TestRequest::post()
        .uri("/api/v1/broadcast")
        .insert_header(("Authorization", format!("Bearer {}", admin_token())))
        .set_json(&serde_json::json!({"title": "big one", "content": "to everyone"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();

    assert_eq!(v["scope"], "all");
    assert_eq!(v["sent_count"], 500);
    // the response carries the full list
    assert_eq!(v["message_ids"].as_array().unwrap().len(), 500);

    let stored = h.repo.get_broadcast(v["broadcast_id"].as_i64().unwrap()).await.unwrap();
    assert_eq!(stored.message_ids_snapshot.len(), ID_SNAPSHOT_CAP);
    assert!(stored.message_ids_snapshot_truncated);
    assert!(stored.message_id_map_truncated);
}

#[actix_web::test]
#[serial]
async fn history_reports_read_and_unread_users() {
    let h = harness();
    let a = h.seed("alice", None).await;
    let b = h.seed("bob", None).await;
    let app = init_app!(h);
    let auth = ("Authorization", format!("Bearer {}", admin_token()));

    let req = test::TestRequest::post()
        .uri("/api/v1/broadcast")
        .insert_header(auth.clone())
        .set_json(&serde_json::json!({"title": "notice", "content": "text", "target_users": [a, b]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let broadcast_id = v["broadcast_id"].as_i64().unwrap();

    // alice reads her copy
    let stored = h.repo.get_broadcast(broadcast_id).await.unwrap();
    let alice_msg = stored.message_id_map_snapshot[&a];
    h.repo.mark_read(alice_msg).await.unwrap();

    let req = test::TestRequest::get()
        .uri("/api/v1/broadcast/history?page=1&limit=1")
        .insert_header(auth.clone())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();

    // limit is clamped to its floor of 5
    assert_eq!(v["limit"], 5);
    assert_eq!(v["total"], 1);
    let row = &v["broadcasts"][0];
    assert_eq!(row["id"].as_i64().unwrap(), broadcast_id);
    assert_eq!(row["read_users"], serde_json::json!([a]));
    assert_eq!(row["unread_users"], serde_json::json!([b]));
    assert_eq!(row["read_count"], 1);
}

#[actix_web::test]
#[serial]
async fn healthz_needs_no_auth() {
    let h = harness();
    let app = init_app!(h);

    let req = test::TestRequest::get().uri("/healthz").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
}
