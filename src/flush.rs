use std::collections::BTreeSet;

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::audit::ErrorSink;
use crate::dispatch::partition_deliverable;
use crate::email::EmailSender;
use crate::models::{
    content_hash, Broadcast, EmailStatus, Id, Message, RecipientRecord, UserStatus,
};
use crate::repo::{Repo, RepoError};

pub const FLUSH_LIMIT_MIN: u32 = 1;
pub const FLUSH_LIMIT_MAX: u32 = 50;

/// Window searched around `created_at` when falling back to content-hash
/// matching. Messages of one broadcast are written in the same request, so a
/// narrow window is enough.
const RECOVERY_WINDOW_BEFORE_MIN: i64 = 2;
const RECOVERY_WINDOW_AFTER_MIN: i64 = 10;

#[derive(thiserror::Error, Debug)]
pub enum RecoverError {
    #[error("stored content hash does not match stored text")]
    HashMismatch,
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Re-locate the in-app messages belonging to a broadcast: id snapshots
/// first, content-hash window matching when the snapshots are empty. The hash
/// check guards against matching another broadcast with the same title.
pub async fn recover_messages(repo: &dyn Repo, b: &Broadcast) -> Result<Vec<Message>, RecoverError> {
    if !b.message_ids_snapshot.is_empty() {
        return Ok(repo.messages_by_ids(&b.message_ids_snapshot).await?);
    }
    if !b.message_id_map_snapshot.is_empty() {
        let ids: Vec<Id> = b.message_id_map_snapshot.values().copied().collect();
        return Ok(repo.messages_by_ids(&ids).await?);
    }
    if content_hash(&b.title, &b.content) != b.content_hash {
        return Err(RecoverError::HashMismatch);
    }
    let from = b.created_at - Duration::minutes(RECOVERY_WINDOW_BEFORE_MIN);
    let to = b.created_at + Duration::minutes(RECOVERY_WINDOW_AFTER_MIN);
    Ok(repo.find_system_messages(&b.title, from, to).await?)
}

/// Recipient user ids for a broadcast, via the id-map snapshot when present.
pub async fn recover_recipient_ids(repo: &dyn Repo, b: &Broadcast) -> Result<Vec<Id>, RecoverError> {
    if !b.message_id_map_snapshot.is_empty() {
        return Ok(b.message_id_map_snapshot.keys().copied().collect());
    }
    let messages = recover_messages(repo, b).await?;
    let ids: BTreeSet<Id> = messages.iter().map(|m| m.receiver_id).collect();
    Ok(ids.into_iter().collect())
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProcessedBroadcast {
    pub id: Id,
    pub status: EmailStatus,
    pub attempted: i64,
    pub force: bool,
    pub missing_email_user_ids: Vec<Id>,
    pub errors: Vec<String>,
}

#[derive(Debug, Default, Serialize, ToSchema)]
pub struct FlushReport {
    pub processed: Vec<ProcessedBroadcast>,
    pub skipped: Vec<Id>,
}

/// Advance queued/partial email deliveries toward a terminal state.
///
/// `force = true` actually calls the send collaborator (and may resend
/// partial/failed rows). `force = false` is reconciliation: the status is
/// derived from email-address availability alone, with zero send calls and
/// zero provider quota spent.
///
/// No lock is taken: concurrent flushes on one row are last-writer-wins.
/// Acceptable for a single admin trigger; not for concurrent workers.
pub async fn flush(
    repo: &dyn Repo,
    sender: &dyn EmailSender,
    errors: &dyn ErrorSink,
    limit: u32,
    force: bool,
) -> Result<FlushReport, RepoError> {
    let limit = limit.clamp(FLUSH_LIMIT_MIN, FLUSH_LIMIT_MAX);
    let candidates = repo.flush_candidates(limit).await?;

    let mut report = FlushReport::default();
    for b in candidates {
        let eligible = matches!(b.email.status, EmailStatus::Queued | EmailStatus::Partial)
            || (force && b.email.status == EmailStatus::Failed);
        if !eligible {
            report.skipped.push(b.id);
            continue;
        }
        match flush_one(repo, sender, errors, &b, force).await {
            Ok(p) => report.processed.push(p),
            Err(e) => {
                // one candidate never halts the batch
                errors
                    .log_error(
                        "broadcast.flush",
                        &e.to_string(),
                        json!({ "broadcast_id": b.id, "force": force }),
                    )
                    .await;
                report.skipped.push(b.id);
            }
        }
    }
    Ok(report)
}

async fn flush_one(
    repo: &dyn Repo,
    sender: &dyn EmailSender,
    errors: &dyn ErrorSink,
    b: &Broadcast,
    force: bool,
) -> Result<ProcessedBroadcast, RepoError> {
    let mut state = b.email.clone();

    let recovered = match recover_recipient_ids(repo, b).await {
        Ok(ids) => ids,
        Err(RecoverError::HashMismatch) => {
            state.push_error("recipient recovery failed: content hash mismatch");
            state.complete(EmailStatus::Failed, Utc::now());
            repo.update_email_state(b.id, &state).await?;
            return Ok(processed(b.id, &state, force));
        }
        Err(RecoverError::Repo(e)) => return Err(e),
    };

    let users = repo.users_by_ids(&recovered).await?;
    let recipients: Vec<RecipientRecord> = users
        .iter()
        .filter(|u| u.status == UserStatus::Active)
        .map(RecipientRecord::from)
        .collect();

    let (deliverable, missing) = partition_deliverable(&recipients);
    let deliverable_ids: Vec<Id> =
        recipients.iter().map(|r| r.id).filter(|id| !missing.contains(id)).collect();
    state.attempted_recipients = deliverable.len() as i64;
    state.missing_email_user_ids = missing;

    if force && !deliverable.is_empty() {
        if sender.send_broadcast(&deliverable, &b.title, &b.content, b.priority).await {
            state.successful_chunks += 1;
            state.failed_chunks = 0;
            state.failed_recipient_ids.clear();
            let status = if state.missing_email_user_ids.is_empty() {
                EmailStatus::Sent
            } else {
                EmailStatus::Partial
            };
            state.complete(status, Utc::now());
        } else {
            state.failed_chunks += 1;
            // prior failed ids are retained; the batch we failed to reach joins them
            state.failed_recipient_ids.extend(deliverable_ids);
            let msg = sender.last_error().unwrap_or_else(|| "email send failed".into());
            state.push_error(msg.clone());
            errors
                .log_error("broadcast.email_send", &msg, json!({ "broadcast_id": b.id }))
                .await;
            state.complete(EmailStatus::Failed, Utc::now());
        }
    } else {
        // dry-run reconciliation: bookkeeping from availability alone
        let status = if deliverable.is_empty() {
            EmailStatus::Skipped
        } else if state.missing_email_user_ids.is_empty() {
            EmailStatus::Sent
        } else {
            EmailStatus::Partial
        };
        state.complete(status, Utc::now());
    }

    repo.update_email_state(b.id, &state).await?;
    Ok(processed(b.id, &state, force))
}

fn processed(id: Id, state: &crate::models::EmailDeliveryState, force: bool) -> ProcessedBroadcast {
    ProcessedBroadcast {
        id,
        status: state.status,
        attempted: state.attempted_recipients,
        force,
        missing_email_user_ids: state.missing_email_user_ids.iter().copied().collect(),
        errors: state.errors.clone(),
    }
}
