use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

pub type Id = i64;

/// Persisted snapshot caps. Rows stay bounded no matter how large the
/// recipient set was; the HTTP response still carries the full lists.
pub const ID_SNAPSHOT_CAP: usize = 200;
pub const ERROR_SNAPSHOT_CAP: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Only high/urgent broadcasts escalate to email.
    pub fn escalates(self) -> bool {
        matches!(self, Priority::High | Priority::Urgent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    All,
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Active,
    Disabled,
}

/// Directory entry. The directory itself is externally owned; we only read it
/// to resolve recipients (plus seed it in the in-memory backend).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub email: Option<String>,
    pub school: Option<String>,
    pub school_id: Option<Id>,
    pub location: Option<String>,
    pub is_admin: bool,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewUser {
    pub username: String,
    pub email: Option<String>,
    pub school: Option<String>,
    pub school_id: Option<Id>,
    pub location: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub status: UserStatus,
}

/// Snapshot of one resolved recipient, taken once per request and immutable
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientRecord {
    pub id: Id,
    pub username: String,
    pub email: Option<String>,
    pub school: Option<String>,
    pub school_id: Option<Id>,
    pub location: Option<String>,
    pub is_admin: bool,
    pub status: UserStatus,
}

impl From<&User> for RecipientRecord {
    fn from(u: &User) -> Self {
        RecipientRecord {
            id: u.id,
            username: u.username.clone(),
            email: u.email.clone(),
            school: u.school.clone(),
            school_id: u.school_id,
            location: u.location.clone(),
            is_admin: u.is_admin,
            status: u.status,
        }
    }
}

/// Which user fields a filter group's substring search applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SearchField {
    Username,
    Email,
    School,
    Location,
}

pub const FILTER_LIMIT_MIN: u32 = 10;
pub const FILTER_LIMIT_MAX: u32 = 500;
pub const FILTER_LIMIT_DEFAULT: u32 = 100;

/// One filter group: a closed criteria structure, one bounded directory
/// search per group. Groups are unioned by the resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct RecipientFilter {
    #[serde(default)]
    pub search: Option<String>,
    /// Defaults to all four searchable fields when empty.
    #[serde(default)]
    pub fields: Vec<SearchField>,
    #[serde(default)]
    pub school_id: Option<Id>,
    #[serde(default)]
    pub school: Option<String>,
    #[serde(default)]
    pub email_suffix: Option<String>,
    #[serde(default)]
    pub status: Option<UserStatus>,
    #[serde(default)]
    pub is_admin: Option<bool>,
    #[serde(default)]
    pub include_ids: Vec<Id>,
    #[serde(default)]
    pub exclude_ids: Vec<Id>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u64>,
}

impl RecipientFilter {
    pub fn clamped_limit(&self) -> u32 {
        self.limit
            .unwrap_or(FILTER_LIMIT_DEFAULT)
            .clamp(FILTER_LIMIT_MIN, FILTER_LIMIT_MAX)
    }

    pub fn effective_fields(&self) -> Vec<SearchField> {
        if self.fields.is_empty() {
            vec![SearchField::Username, SearchField::Email, SearchField::School, SearchField::Location]
        } else {
            self.fields.clone()
        }
    }
}

/// In-app message, owned by its recipient. Broadcasts reference messages but
/// never own them.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Message {
    pub id: Id,
    pub receiver_id: Id,
    pub title: String,
    pub content: String,
    pub priority: Priority,
    pub kind: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewMessage {
    pub receiver_id: Id,
    pub title: String,
    pub content: String,
    pub priority: Priority,
    pub kind: String,
}

pub const MESSAGE_KIND_SYSTEM: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    Skipped,
    Queued,
    Sent,
    Partial,
    Failed,
}

/// Email escalation bookkeeping embedded in each broadcast row.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EmailDeliveryState {
    pub triggered: bool,
    pub attempted_recipients: i64,
    pub successful_chunks: i64,
    pub failed_chunks: i64,
    #[schema(value_type = Vec<i64>)]
    pub failed_recipient_ids: BTreeSet<Id>,
    #[schema(value_type = Vec<i64>)]
    pub missing_email_user_ids: BTreeSet<Id>,
    pub status: EmailStatus,
    pub errors: Vec<String>,
    pub errors_truncated: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Default for EmailDeliveryState {
    fn default() -> Self {
        EmailDeliveryState {
            triggered: false,
            attempted_recipients: 0,
            successful_chunks: 0,
            failed_chunks: 0,
            failed_recipient_ids: BTreeSet::new(),
            missing_email_user_ids: BTreeSet::new(),
            status: EmailStatus::Skipped,
            errors: Vec::new(),
            errors_truncated: false,
            completed_at: None,
        }
    }
}

impl EmailDeliveryState {
    /// Append an error, keeping the list ordered, deduplicated and capped.
    pub fn push_error(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        if self.errors.iter().any(|e| *e == msg) {
            return;
        }
        if self.errors.len() >= ERROR_SNAPSHOT_CAP {
            self.errors_truncated = true;
            return;
        }
        self.errors.push(msg);
    }

    /// Terminal flush transition. The initial enqueue never stamps
    /// `completed_at`; only this does.
    pub fn complete(&mut self, status: EmailStatus, at: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(at);
    }
}

/// One durable row per broadcast attempt.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Broadcast {
    pub id: Id,
    pub created_at: DateTime<Utc>,
    pub created_by: Id,
    pub title: String,
    pub content: String,
    pub priority: Priority,
    pub scope: Scope,
    #[schema(value_type = Object)]
    pub criteria_snapshot: Value,
    pub target_count: i64,
    pub sent_count: i64,
    pub invalid_ids: Vec<Id>,
    pub failed_user_ids: Vec<Id>,
    pub failed_user_ids_truncated: bool,
    pub message_ids_snapshot: Vec<Id>,
    pub message_ids_snapshot_truncated: bool,
    /// user id -> message id, capped sample.
    #[schema(value_type = Object)]
    pub message_id_map_snapshot: BTreeMap<Id, Id>,
    pub message_id_map_truncated: bool,
    pub content_hash: String,
    pub email: EmailDeliveryState,
    pub audit_log_id: Option<Id>,
    pub request_log_id: Option<Id>,
    pub error_log_ids: Vec<Id>,
}

/// Everything the record store needs to persist one attempt. Lists arrive
/// untruncated; the store applies the snapshot caps.
#[derive(Debug, Clone)]
pub struct NewBroadcast {
    pub created_by: Id,
    pub title: String,
    pub content: String,
    pub priority: Priority,
    pub scope: Scope,
    pub criteria_snapshot: Value,
    pub target_count: i64,
    pub sent_count: i64,
    pub invalid_ids: Vec<Id>,
    pub failed_user_ids: Vec<Id>,
    pub message_ids: Vec<Id>,
    pub message_id_map: BTreeMap<Id, Id>,
    pub email: EmailDeliveryState,
    pub audit_log_id: Option<Id>,
    pub request_log_id: Option<Id>,
    pub error_log_ids: Vec<Id>,
}

impl NewBroadcast {
    /// Build the persisted row, truncating snapshot collections to their caps.
    pub fn into_record(self, id: Id, created_at: DateTime<Utc>) -> Broadcast {
        let content_hash = content_hash(&self.title, &self.content);
        let (message_ids_snapshot, message_ids_snapshot_truncated) =
            cap_list(self.message_ids, ID_SNAPSHOT_CAP);
        let (failed_user_ids, failed_user_ids_truncated) =
            cap_list(self.failed_user_ids, ERROR_SNAPSHOT_CAP);
        let (invalid_ids, _) = cap_list(self.invalid_ids, ID_SNAPSHOT_CAP);
        let map_truncated = self.message_id_map.len() > ID_SNAPSHOT_CAP;
        let message_id_map_snapshot: BTreeMap<Id, Id> =
            self.message_id_map.into_iter().take(ID_SNAPSHOT_CAP).collect();
        Broadcast {
            id,
            created_at,
            created_by: self.created_by,
            title: self.title,
            content: self.content,
            priority: self.priority,
            scope: self.scope,
            criteria_snapshot: self.criteria_snapshot,
            target_count: self.target_count,
            sent_count: self.sent_count,
            invalid_ids,
            failed_user_ids,
            failed_user_ids_truncated,
            message_ids_snapshot,
            message_ids_snapshot_truncated,
            message_id_map_snapshot,
            message_id_map_truncated: map_truncated,
            content_hash,
            email: self.email,
            audit_log_id: self.audit_log_id,
            request_log_id: self.request_log_id,
            error_log_ids: self.error_log_ids,
        }
    }
}

fn cap_list(mut v: Vec<Id>, cap: usize) -> (Vec<Id>, bool) {
    if v.len() > cap {
        v.truncate(cap);
        (v, true)
    } else {
        (v, false)
    }
}

/// hex(sha256(title || content)) — depends only on the text, so two
/// broadcasts with identical text collide. Used to re-identify a broadcast's
/// messages when id tracking is incomplete.
pub fn content_hash(title: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_deterministic_and_text_only() {
        let a = content_hash("Maintenance", "System will be down");
        let b = content_hash("Maintenance", "System will be down");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash("Maintenance", "back at noon"));
        // concatenation, not a (title, content) pair: boundary shifts collide
        assert_eq!(content_hash("ab", "c"), content_hash("a", "bc"));
    }

    #[test]
    fn push_error_dedupes_and_caps() {
        let mut st = EmailDeliveryState::default();
        st.push_error("boom");
        st.push_error("boom");
        assert_eq!(st.errors.len(), 1);
        for i in 0..ERROR_SNAPSHOT_CAP + 10 {
            st.push_error(format!("e{i}"));
        }
        assert_eq!(st.errors.len(), ERROR_SNAPSHOT_CAP);
        assert!(st.errors_truncated);
    }

    #[test]
    fn record_truncates_snapshots() {
        let new = NewBroadcast {
            created_by: 1,
            title: "t".into(),
            content: "c".into(),
            priority: Priority::Normal,
            scope: Scope::Custom,
            criteria_snapshot: serde_json::json!({}),
            target_count: 500,
            sent_count: 500,
            invalid_ids: vec![],
            failed_user_ids: vec![],
            message_ids: (1..=500).collect(),
            message_id_map: (1..=500).map(|i| (i, i + 1000)).collect(),
            email: EmailDeliveryState::default(),
            audit_log_id: None,
            request_log_id: None,
            error_log_ids: vec![],
        };
        let rec = new.into_record(7, Utc::now());
        assert_eq!(rec.message_ids_snapshot.len(), ID_SNAPSHOT_CAP);
        assert!(rec.message_ids_snapshot_truncated);
        assert_eq!(rec.message_id_map_snapshot.len(), ID_SNAPSHOT_CAP);
        assert!(rec.message_id_map_truncated);
        assert!(!rec.failed_user_ids_truncated);
    }
}
