use std::collections::{BTreeMap, BTreeSet};

use serde_json::json;

use crate::audit::ErrorSink;
use crate::email::{EmailQueue, EmailRecipient};
use crate::models::{
    EmailDeliveryState, EmailStatus, Id, NewMessage, Priority, RecipientRecord,
    MESSAGE_KIND_SYSTEM,
};
use crate::repo::Repo;

#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub sent_count: i64,
    pub message_ids: Vec<Id>,
    /// user id -> message id
    pub id_map: BTreeMap<Id, Id>,
    pub failed_user_ids: Vec<Id>,
    pub error_log_ids: Vec<Id>,
}

/// Fan one in-app message out per recipient. No transaction spans the loop;
/// one recipient's failure never aborts the rest.
pub async fn dispatch(
    messages: &dyn Repo,
    errors: &dyn ErrorSink,
    recipients: &[RecipientRecord],
    title: &str,
    content: &str,
    priority: Priority,
) -> DispatchOutcome {
    let mut out = DispatchOutcome::default();
    for rec in recipients {
        let new = NewMessage {
            receiver_id: rec.id,
            title: title.to_string(),
            content: content.to_string(),
            priority,
            kind: MESSAGE_KIND_SYSTEM.to_string(),
        };
        match messages.create_message(new).await {
            Ok(msg) => {
                out.sent_count += 1;
                out.message_ids.push(msg.id);
                out.id_map.insert(rec.id, msg.id);
            }
            Err(e) => {
                out.failed_user_ids.push(rec.id);
                if let Some(id) = errors
                    .log_error(
                        "broadcast.message",
                        &e.to_string(),
                        json!({ "user_id": rec.id, "title": title }),
                    )
                    .await
                {
                    out.error_log_ids.push(id);
                }
            }
        }
    }
    out
}

/// Split recipients into deliverable (usable email) and missing. Display name
/// falls back to the email address itself.
pub fn partition_deliverable(
    recipients: &[RecipientRecord],
) -> (Vec<EmailRecipient>, BTreeSet<Id>) {
    let mut deliverable = Vec::new();
    let mut missing = BTreeSet::new();
    for rec in recipients {
        match rec.email.as_deref().map(str::trim) {
            Some(email) if !email.is_empty() => {
                let name = if rec.username.trim().is_empty() {
                    email.to_string()
                } else {
                    rec.username.clone()
                };
                deliverable.push(EmailRecipient { email: email.to_string(), name });
            }
            _ => {
                missing.insert(rec.id);
            }
        }
    }
    (deliverable, missing)
}

pub struct EmailPlanOutcome {
    pub state: EmailDeliveryState,
    pub error_log_ids: Vec<Id>,
}

/// Decide whether this broadcast escalates to email and, if so, enqueue the
/// deliverable subset. Never sends anything itself.
pub async fn plan_email(
    queue: &dyn EmailQueue,
    errors: &dyn ErrorSink,
    recipients: &[RecipientRecord],
    title: &str,
    content: &str,
    priority: Priority,
    meta: serde_json::Value,
) -> EmailPlanOutcome {
    let mut state = EmailDeliveryState::default();
    let mut error_log_ids = Vec::new();

    if !priority.escalates() {
        return EmailPlanOutcome { state, error_log_ids };
    }
    state.triggered = true;

    let (deliverable, missing) = partition_deliverable(recipients);
    state.missing_email_user_ids = missing;

    if deliverable.is_empty() {
        // status stays `skipped`; nothing to hand to the queue
        return EmailPlanOutcome { state, error_log_ids };
    }

    state.attempted_recipients = deliverable.len() as i64;
    let receipt = queue
        .queue_broadcast(&deliverable, title, content, priority, &meta)
        .await;
    if receipt.queued {
        state.status = EmailStatus::Queued;
    } else {
        let msg = receipt.error.unwrap_or_else(|| "email queue refused the broadcast".into());
        state.push_error(msg.clone());
        state.status = EmailStatus::Failed;
        if let Some(id) = errors
            .log_error("broadcast.email_queue", &msg, json!({ "title": title }))
            .await
        {
            error_log_ids.push(id);
        }
    }

    EmailPlanOutcome { state, error_log_ids }
}
