use std::sync::Arc;

use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink, ErrorSink};
use crate::auth::Auth;
use crate::email::{EmailQueue, EmailSender};
use crate::error::ApiError;
use crate::flush::{self, ProcessedBroadcast};
use crate::history::{self, BroadcastSummary, HISTORY_LIMIT_DEFAULT};
use crate::models::*;
use crate::repo::Repo;
use crate::resolver::{self, BroadcastTargets, ResolveError};
use crate::{dispatch, resolver::Resolution};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/broadcast").route(web::post().to(send_broadcast)))
            .service(web::resource("/broadcast/flush").route(web::post().to(flush_broadcasts)))
            .service(web::resource("/broadcast/history").route(web::get().to(broadcast_history))),
    );
    cfg.route("/healthz", web::get().to(healthz));
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub email_queue: Arc<dyn EmailQueue>,
    pub email_sender: Arc<dyn EmailSender>,
    pub audit: Arc<dyn AuditSink>,
    pub errors: Arc<dyn ErrorSink>,
}

macro_rules! ensure_admin {
    ($auth:expr) => {
        if !$auth.0.is_admin() {
            return Err(ApiError::Forbidden);
        }
    };
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SendBroadcastRequest {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub target_users: Option<Vec<Id>>,
    #[serde(default)]
    pub target_filters: Option<Vec<RecipientFilter>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SendBroadcastResponse {
    pub success: bool,
    pub broadcast_id: Option<Id>,
    pub sent_count: i64,
    pub total_targets: i64,
    pub failed_user_ids: Vec<Id>,
    pub invalid_user_ids: Vec<Id>,
    pub scope: Scope,
    pub message_ids: Vec<Id>,
    pub message_id_count: usize,
    pub email_delivery: EmailDeliveryState,
    pub error_log_ids: Vec<Id>,
    pub request_id: String,
}

const TITLE_MAX_LEN: usize = 255;

#[utoipa::path(
    post,
    path = "/api/v1/broadcast",
    request_body = SendBroadcastRequest,
    responses(
        (status = 200, description = "Broadcast dispatched", body = SendBroadcastResponse),
        (status = 400, description = "Invalid title, content or targeting"),
        (status = 403, description = "Forbidden – Admins only"),
        (status = 404, description = "No recipients resolved")
    )
)]
pub async fn send_broadcast(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<SendBroadcastRequest>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let req = payload.into_inner();
    let request_id = Uuid::new_v4().to_string();

    // Validation rejects before any side effect.
    let title = req.title.trim();
    if title.is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".into()));
    }
    if title.chars().count() > TITLE_MAX_LEN {
        return Err(ApiError::BadRequest(format!("title exceeds {TITLE_MAX_LEN} characters")));
    }
    if req.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".into()));
    }
    let priority = req.priority.unwrap_or_default();

    let targets = BroadcastTargets {
        user_ids: req.target_users.clone(),
        filters: req.target_filters.clone(),
    };
    let Resolution { scope, recipients, invalid_ids } =
        resolver::resolve(data.repo.as_ref(), &targets)
            .await
            .map_err(|e| match e {
                ResolveError::EmptyIdList => ApiError::BadRequest(e.to_string()),
                ResolveError::Repo(_) => ApiError::Internal,
            })?;
    if recipients.is_empty() {
        return Err(ApiError::NotFound);
    }
    let total_targets = recipients.len() as i64;

    tracing::info!(
        request_id = %request_id,
        targets = total_targets,
        priority = priority.as_str(),
        "dispatching broadcast"
    );

    let outcome = dispatch::dispatch(
        data.repo.as_ref(),
        data.errors.as_ref(),
        &recipients,
        title,
        &req.content,
        priority,
    )
    .await;

    let criteria_snapshot = json!({
        "target_users": req.target_users,
        "target_filters": req.target_filters,
        "priority": priority,
    });
    let plan = dispatch::plan_email(
        data.email_queue.as_ref(),
        data.errors.as_ref(),
        &recipients,
        title,
        &req.content,
        priority,
        json!({ "request_id": request_id }),
    )
    .await;

    let admin_id = auth.0.user_id();
    let audit_log_id = data
        .audit
        .log(AuditEvent {
            action: "broadcast.send".into(),
            actor_id: admin_id,
            detail: json!({
                "scope": scope,
                "targets": total_targets,
                "sent": outcome.sent_count,
                "priority": priority,
                "request_id": request_id,
            }),
            created_at: Utc::now(),
        })
        .await;

    let mut error_log_ids = outcome.error_log_ids.clone();
    error_log_ids.extend(plan.error_log_ids.iter().copied());

    let new = NewBroadcast {
        created_by: admin_id,
        title: title.to_string(),
        content: req.content.clone(),
        priority,
        scope,
        criteria_snapshot,
        target_count: total_targets,
        sent_count: outcome.sent_count,
        invalid_ids: invalid_ids.clone(),
        failed_user_ids: outcome.failed_user_ids.clone(),
        message_ids: outcome.message_ids.clone(),
        message_id_map: outcome.id_map.clone(),
        email: plan.state.clone(),
        audit_log_id,
        request_log_id: None,
        error_log_ids: error_log_ids.clone(),
    };

    // Recipients are already notified; a record-store failure is logged, not
    // surfaced as a request failure.
    let broadcast_id = match data.repo.insert_broadcast(new).await {
        Ok(rec) => Some(rec.id),
        Err(e) => {
            if let Some(id) = data
                .errors
                .log_error(
                    "broadcast.persist",
                    &e.to_string(),
                    json!({ "request_id": request_id }),
                )
                .await
            {
                error_log_ids.push(id);
            }
            None
        }
    };

    Ok(HttpResponse::Ok().json(SendBroadcastResponse {
        success: true,
        broadcast_id,
        sent_count: outcome.sent_count,
        total_targets,
        failed_user_ids: outcome.failed_user_ids,
        invalid_user_ids: invalid_ids,
        scope,
        message_id_count: outcome.message_ids.len(),
        message_ids: outcome.message_ids,
        email_delivery: plan.state,
        error_log_ids,
        request_id,
    }))
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct FlushRequest {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub force: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FlushResponse {
    pub success: bool,
    pub processed: Vec<ProcessedBroadcast>,
    pub skipped: Vec<Id>,
    pub count: usize,
}

#[utoipa::path(
    post,
    path = "/api/v1/broadcast/flush",
    request_body = FlushRequest,
    responses(
        (status = 200, description = "Flush report", body = FlushResponse),
        (status = 403, description = "Forbidden – Admins only")
    )
)]
pub async fn flush_broadcasts(
    auth: Auth,
    data: web::Data<AppState>,
    payload: Option<web::Json<FlushRequest>>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let req = payload.map(|p| p.into_inner()).unwrap_or_default();
    let limit = req.limit.unwrap_or(flush::FLUSH_LIMIT_MAX);
    let force = req.force.unwrap_or(false);

    let report = flush::flush(
        data.repo.as_ref(),
        data.email_sender.as_ref(),
        data.errors.as_ref(),
        limit,
        force,
    )
    .await?;

    Ok(HttpResponse::Ok().json(FlushResponse {
        success: true,
        count: report.processed.len(),
        processed: report.processed,
        skipped: report.skipped,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<u64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HistoryResponse {
    pub success: bool,
    pub page: u64,
    pub limit: u32,
    pub total: u64,
    pub broadcasts: Vec<BroadcastSummary>,
}

#[utoipa::path(
    get,
    path = "/api/v1/broadcast/history",
    params(
        ("page" = Option<u64>, Query, description = "1-based page"),
        ("limit" = Option<u32>, Query, description = "Page size, clamped to [5,50]")
    ),
    responses(
        (status = 200, description = "Broadcast history page", body = HistoryResponse),
        (status = 403, description = "Forbidden – Admins only")
    )
)]
pub async fn broadcast_history(
    auth: Auth,
    data: web::Data<AppState>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(HISTORY_LIMIT_DEFAULT);

    let page = history::history(data.repo.as_ref(), page, limit).await?;
    Ok(HttpResponse::Ok().json(HistoryResponse {
        success: true,
        page: page.page,
        limit: page.limit,
        total: page.total,
        broadcasts: page.broadcasts,
    }))
}

pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}
