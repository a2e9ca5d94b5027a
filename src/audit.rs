use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Admin-action audit entry. Persistence beyond this write contract is owned
/// elsewhere; the engine only needs the insert id back to link it to the
/// broadcast row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub actor_id: i64,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Returns the insert id, or None when the write failed. Audit failures
    /// never fail the calling operation.
    async fn log(&self, event: AuditEvent) -> Option<i64>;
}

#[async_trait]
pub trait ErrorSink: Send + Sync {
    /// Returns the error-log insert id, or None when even that write failed.
    async fn log_error(&self, kind: &str, message: &str, context: Value) -> Option<i64>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub id: i64,
    pub kind: String,
    pub message: String,
    pub context: Value,
    pub created_at: DateTime<Utc>,
}

/// In-memory sinks, used by the inmem backend and by tests.
#[derive(Default)]
pub struct MemoryAudit {
    next_id: AtomicI64,
    entries: Mutex<Vec<(i64, AuditEvent)>>,
}

impl MemoryAudit {
    pub fn new() -> Self { Self::default() }

    pub fn entries(&self) -> Vec<(i64, AuditEvent)> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAudit {
    async fn log(&self, event: AuditEvent) -> Option<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.lock().unwrap().push((id, event));
        Some(id)
    }
}

#[derive(Default)]
pub struct MemoryErrorLog {
    next_id: AtomicI64,
    entries: Mutex<Vec<ErrorEntry>>,
}

impl MemoryErrorLog {
    pub fn new() -> Self { Self::default() }

    pub fn entries(&self) -> Vec<ErrorEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ErrorSink for MemoryErrorLog {
    async fn log_error(&self, kind: &str, message: &str, context: Value) -> Option<i64> {
        tracing::error!(kind, message, "broadcast error");
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.lock().unwrap().push(ErrorEntry {
            id,
            kind: kind.to_string(),
            message: message.to_string(),
            context,
            created_at: Utc::now(),
        });
        Some(id)
    }
}

#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::{Pool, Postgres};

    #[derive(Clone)]
    pub struct PgAudit { pool: Pool<Postgres> }

    impl PgAudit {
        pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
    }

    #[async_trait]
    impl AuditSink for PgAudit {
        async fn log(&self, event: AuditEvent) -> Option<i64> {
            let res: Result<i64, sqlx::Error> = sqlx::query_scalar(
                "INSERT INTO audit_log (action, actor_id, detail) VALUES ($1,$2,$3) RETURNING id",
            )
            .bind(&event.action)
            .bind(event.actor_id)
            .bind(&event.detail)
            .fetch_one(&self.pool)
            .await;
            match res {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!("audit insert failed: {e}");
                    None
                }
            }
        }
    }

    #[derive(Clone)]
    pub struct PgErrorLog { pool: Pool<Postgres> }

    impl PgErrorLog {
        pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
    }

    #[async_trait]
    impl ErrorSink for PgErrorLog {
        async fn log_error(&self, kind: &str, message: &str, context: Value) -> Option<i64> {
            tracing::error!(kind, message, "broadcast error");
            let res: Result<i64, sqlx::Error> = sqlx::query_scalar(
                "INSERT INTO error_log (kind, message, context) VALUES ($1,$2,$3) RETURNING id",
            )
            .bind(kind)
            .bind(message)
            .bind(&context)
            .fetch_one(&self.pool)
            .await;
            match res {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!("error-log insert failed: {e}");
                    None
                }
            }
        }
    }
}
