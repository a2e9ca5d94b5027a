use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::flush::recover_messages;
use crate::models::{EmailStatus, Id, Priority, Scope};
use crate::repo::{Repo, RepoError};

pub const HISTORY_LIMIT_MIN: u32 = 5;
pub const HISTORY_LIMIT_MAX: u32 = 50;
pub const HISTORY_LIMIT_DEFAULT: u32 = 20;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BroadcastSummary {
    pub id: Id,
    pub created_at: DateTime<Utc>,
    pub created_by: Id,
    pub title: String,
    pub priority: Priority,
    pub scope: Scope,
    pub target_count: i64,
    pub sent_count: i64,
    pub email_status: EmailStatus,
    pub read_users: Vec<Id>,
    pub unread_users: Vec<Id>,
    pub read_count: usize,
    pub unread_count: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HistoryPage {
    pub page: u64,
    pub limit: u32,
    pub total: u64,
    pub broadcasts: Vec<BroadcastSummary>,
}

/// Read-only projection: each broadcast joined to its messages' current read
/// flags, using the same snapshot-then-hash-fallback recovery as the flusher.
/// Never mutates delivery state.
pub async fn history(repo: &dyn Repo, page: u64, limit: u32) -> Result<HistoryPage, RepoError> {
    let page = page.max(1);
    let limit = limit.clamp(HISTORY_LIMIT_MIN, HISTORY_LIMIT_MAX);
    let offset = (page - 1) * limit as u64;
    let (rows, total) = repo.broadcasts_page(offset, limit).await?;

    let mut broadcasts = Vec::with_capacity(rows.len());
    for b in rows {
        let mut read_users = Vec::new();
        let mut unread_users = Vec::new();
        match recover_messages(repo, &b).await {
            Ok(messages) => {
                for m in &messages {
                    if m.read {
                        read_users.push(m.receiver_id);
                    } else {
                        unread_users.push(m.receiver_id);
                    }
                }
                read_users.sort_unstable();
                read_users.dedup();
                unread_users.sort_unstable();
                unread_users.dedup();
            }
            Err(e) => {
                // an unrecoverable recipient set leaves the counts empty
                tracing::debug!("history recovery for broadcast {} failed: {e}", b.id);
            }
        }
        broadcasts.push(BroadcastSummary {
            id: b.id,
            created_at: b.created_at,
            created_by: b.created_by,
            title: b.title.clone(),
            priority: b.priority,
            scope: b.scope,
            target_count: b.target_count,
            sent_count: b.sent_count,
            email_status: b.email.status,
            read_count: read_users.len(),
            unread_count: unread_users.len(),
            read_users,
            unread_users,
        });
    }

    Ok(HistoryPage { page, limit, total, broadcasts })
}
