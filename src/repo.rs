use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

use async_trait::async_trait;

/// Read side of the user directory. The directory is owned elsewhere; the
/// broadcast engine only resolves recipients against it. `insert_user` exists
/// so the in-memory backend (and tests) can seed it.
#[async_trait]
pub trait DirectoryRepo: Send + Sync {
    async fn insert_user(&self, new: NewUser) -> RepoResult<User>;
    async fn users_by_ids(&self, ids: &[Id]) -> RepoResult<Vec<User>>;
    async fn search_users(&self, filter: &RecipientFilter) -> RepoResult<Vec<User>>;
    async fn all_active_users(&self) -> RepoResult<Vec<User>>;
}

#[async_trait]
pub trait MessageRepo: Send + Sync {
    async fn create_message(&self, new: NewMessage) -> RepoResult<Message>;
    async fn messages_by_ids(&self, ids: &[Id]) -> RepoResult<Vec<Message>>;
    /// Content-hash fallback support: system messages with this exact title
    /// created inside the window.
    async fn find_system_messages(
        &self,
        title: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RepoResult<Vec<Message>>;
    async fn mark_read(&self, message_id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait BroadcastRepo: Send + Sync {
    /// Single insert per attempt; applies the snapshot caps.
    async fn insert_broadcast(&self, new: NewBroadcast) -> RepoResult<Broadcast>;
    async fn get_broadcast(&self, id: Id) -> RepoResult<Broadcast>;
    /// Oldest-first rows whose email delivery was ever enqueued (anything but
    /// `skipped`). The flusher decides per row what to do with them.
    async fn flush_candidates(&self, limit: u32) -> RepoResult<Vec<Broadcast>>;
    /// Read-modify-write without an optimistic token: concurrent flushes on
    /// the same row are last-writer-wins.
    async fn update_email_state(&self, id: Id, state: &EmailDeliveryState) -> RepoResult<()>;
    /// Newest-first page plus total row count.
    async fn broadcasts_page(&self, offset: u64, limit: u32) -> RepoResult<(Vec<Broadcast>, u64)>;
}

pub trait Repo: DirectoryRepo + MessageRepo + BroadcastRepo {}

impl<T> Repo for T where T: DirectoryRepo + MessageRepo + BroadcastRepo {}

fn filter_matches(filter: &RecipientFilter, u: &User) -> bool {
    if !filter.include_ids.is_empty() && !filter.include_ids.contains(&u.id) {
        return false;
    }
    if filter.exclude_ids.contains(&u.id) {
        return false;
    }
    if let Some(school_id) = filter.school_id {
        if u.school_id != Some(school_id) {
            return false;
        }
    }
    if let Some(ref school) = filter.school {
        if u.school.as_deref() != Some(school.as_str()) {
            return false;
        }
    }
    if let Some(ref suffix) = filter.email_suffix {
        let suffix = suffix.to_lowercase();
        match u.email.as_deref() {
            Some(e) if e.to_lowercase().ends_with(&suffix) => {}
            _ => return false,
        }
    }
    if let Some(status) = filter.status {
        if u.status != status {
            return false;
        }
    }
    if let Some(is_admin) = filter.is_admin {
        if u.is_admin != is_admin {
            return false;
        }
    }
    if let Some(ref search) = filter.search {
        let needle = search.to_lowercase();
        if !needle.is_empty() {
            let hit = filter.effective_fields().iter().any(|f| {
                let hay = match f {
                    SearchField::Username => Some(u.username.as_str()),
                    SearchField::Email => u.email.as_deref(),
                    SearchField::School => u.school.as_deref(),
                    SearchField::Location => u.location.as_deref(),
                };
                hay.map(|h| h.to_lowercase().contains(&needle)).unwrap_or(false)
            });
            if !hit {
                return false;
            }
        }
    }
    true
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::path::{Path, PathBuf};

    const SNAPSHOT_PATH: &str = "data/state.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        users: HashMap<Id, User>,
        messages: HashMap<Id, Message>,
        broadcasts: HashMap<Id, Broadcast>,
        next_id: Id,
    }

    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn snapshot_path() -> PathBuf {
            match std::env::var("BULLHORN_DATA_DIR") {
                Ok(dir) => {
                    let mut p = PathBuf::from(dir);
                    p.push("state.json");
                    p
                }
                Err(_) => PathBuf::from(SNAPSHOT_PATH),
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        log::info!("loaded snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        log::warn!("failed to parse snapshot '{}': {e}; starting empty", path.display());
                        State::default()
                    }
                },
                Err(_) => State::default(),
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(s) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, s) {
                    log::warn!("failed to write snapshot '{}': {e}", path.display());
                }
            }
        }

        pub fn new() -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }

        fn next_id(state: &mut State) -> Id {
            state.next_id += 1;
            state.next_id
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self { Self::new() }
    }

    #[async_trait]
    impl DirectoryRepo for InMemRepo {
        async fn insert_user(&self, new: NewUser) -> RepoResult<User> {
            let mut s = self.state.write().unwrap();
            if s.users.values().any(|u| u.username == new.username) {
                return Err(RepoError::Conflict);
            }
            let id = Self::next_id(&mut s);
            let user = User {
                id,
                username: new.username,
                email: new.email,
                school: new.school,
                school_id: new.school_id,
                location: new.location,
                is_admin: new.is_admin,
                status: new.status,
                created_at: Utc::now(),
            };
            s.users.insert(id, user.clone());
            drop(s);
            self.persist();
            Ok(user)
        }

        async fn users_by_ids(&self, ids: &[Id]) -> RepoResult<Vec<User>> {
            let s = self.state.read().unwrap();
            Ok(ids.iter().filter_map(|id| s.users.get(id).cloned()).collect())
        }

        async fn search_users(&self, filter: &RecipientFilter) -> RepoResult<Vec<User>> {
            let s = self.state.read().unwrap();
            let mut all: Vec<&User> = s.users.values().filter(|u| filter_matches(filter, u)).collect();
            all.sort_by_key(|u| u.id);
            let offset = filter.offset.unwrap_or(0) as usize;
            let limit = filter.clamped_limit() as usize;
            Ok(all.into_iter().skip(offset).take(limit).cloned().collect())
        }

        async fn all_active_users(&self) -> RepoResult<Vec<User>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<User> = s
                .users
                .values()
                .filter(|u| u.status == UserStatus::Active)
                .cloned()
                .collect();
            v.sort_by_key(|u| u.id);
            Ok(v)
        }
    }

    #[async_trait]
    impl MessageRepo for InMemRepo {
        async fn create_message(&self, new: NewMessage) -> RepoResult<Message> {
            let mut s = self.state.write().unwrap();
            if !s.users.contains_key(&new.receiver_id) {
                return Err(RepoError::NotFound);
            }
            let id = Self::next_id(&mut s);
            let msg = Message {
                id,
                receiver_id: new.receiver_id,
                title: new.title,
                content: new.content,
                priority: new.priority,
                kind: new.kind,
                read: false,
                created_at: Utc::now(),
                deleted_at: None,
            };
            s.messages.insert(id, msg.clone());
            drop(s);
            self.persist();
            Ok(msg)
        }

        async fn messages_by_ids(&self, ids: &[Id]) -> RepoResult<Vec<Message>> {
            let s = self.state.read().unwrap();
            Ok(ids.iter().filter_map(|id| s.messages.get(id).cloned()).collect())
        }

        async fn find_system_messages(
            &self,
            title: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> RepoResult<Vec<Message>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<Message> = s
                .messages
                .values()
                .filter(|m| {
                    m.kind == MESSAGE_KIND_SYSTEM
                        && m.title == title
                        && m.created_at >= from
                        && m.created_at <= to
                })
                .cloned()
                .collect();
            v.sort_by_key(|m| m.id);
            Ok(v)
        }

        async fn mark_read(&self, message_id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            let msg = s.messages.get_mut(&message_id).ok_or(RepoError::NotFound)?;
            msg.read = true;
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl BroadcastRepo for InMemRepo {
        async fn insert_broadcast(&self, new: NewBroadcast) -> RepoResult<Broadcast> {
            let mut s = self.state.write().unwrap();
            let id = Self::next_id(&mut s);
            let rec = new.into_record(id, Utc::now());
            s.broadcasts.insert(id, rec.clone());
            drop(s);
            self.persist();
            Ok(rec)
        }

        async fn get_broadcast(&self, id: Id) -> RepoResult<Broadcast> {
            let s = self.state.read().unwrap();
            s.broadcasts.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn flush_candidates(&self, limit: u32) -> RepoResult<Vec<Broadcast>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<Broadcast> = s
                .broadcasts
                .values()
                .filter(|b| b.email.status != EmailStatus::Skipped)
                .cloned()
                .collect();
            v.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            v.truncate(limit as usize);
            Ok(v)
        }

        async fn update_email_state(&self, id: Id, state: &EmailDeliveryState) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            let b = s.broadcasts.get_mut(&id).ok_or(RepoError::NotFound)?;
            b.email = state.clone();
            drop(s);
            self.persist();
            Ok(())
        }

        async fn broadcasts_page(&self, offset: u64, limit: u32) -> RepoResult<(Vec<Broadcast>, u64)> {
            let s = self.state.read().unwrap();
            let mut v: Vec<Broadcast> = s.broadcasts.values().cloned().collect();
            let total = v.len() as u64;
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok((
                v.into_iter().skip(offset as usize).take(limit as usize).collect(),
                total,
            ))
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::postgres::PgRow;
    use sqlx::{Pool, Postgres, QueryBuilder, Row};

    #[derive(Clone)]
    pub struct PgRepo { pool: Pool<Postgres> }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
    }

    fn internal(e: sqlx::Error) -> RepoError {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            other => RepoError::Internal(other.to_string()),
        }
    }

    fn user_from_row(row: &PgRow) -> RepoResult<User> {
        let status: String = row.try_get("status").map_err(internal)?;
        Ok(User {
            id: row.try_get("id").map_err(internal)?,
            username: row.try_get("username").map_err(internal)?,
            email: row.try_get("email").map_err(internal)?,
            school: row.try_get("school").map_err(internal)?,
            school_id: row.try_get("school_id").map_err(internal)?,
            location: row.try_get("location").map_err(internal)?,
            is_admin: row.try_get("is_admin").map_err(internal)?,
            status: serde_json::from_value(serde_json::Value::String(status))
                .map_err(|e| RepoError::Internal(e.to_string()))?,
            created_at: row.try_get("created_at").map_err(internal)?,
        })
    }

    fn message_from_row(row: &PgRow) -> RepoResult<Message> {
        let priority: String = row.try_get("priority").map_err(internal)?;
        Ok(Message {
            id: row.try_get("id").map_err(internal)?,
            receiver_id: row.try_get("receiver_id").map_err(internal)?,
            title: row.try_get("title").map_err(internal)?,
            content: row.try_get("content").map_err(internal)?,
            priority: serde_json::from_value(serde_json::Value::String(priority))
                .map_err(|e| RepoError::Internal(e.to_string()))?,
            kind: row.try_get("kind").map_err(internal)?,
            read: row.try_get("read").map_err(internal)?,
            created_at: row.try_get("created_at").map_err(internal)?,
            deleted_at: row.try_get("deleted_at").map_err(internal)?,
        })
    }

    fn broadcast_from_row(row: &PgRow) -> RepoResult<Broadcast> {
        let json = |name: &str| -> RepoResult<serde_json::Value> {
            row.try_get::<serde_json::Value, _>(name).map_err(internal)
        };
        let de = |v: serde_json::Value| -> RepoResult<_> {
            serde_json::from_value(v).map_err(|e| RepoError::Internal(e.to_string()))
        };
        let priority: String = row.try_get("priority").map_err(internal)?;
        let scope: String = row.try_get("scope").map_err(internal)?;
        Ok(Broadcast {
            id: row.try_get("id").map_err(internal)?,
            created_at: row.try_get("created_at").map_err(internal)?,
            created_by: row.try_get("created_by").map_err(internal)?,
            title: row.try_get("title").map_err(internal)?,
            content: row.try_get("content").map_err(internal)?,
            priority: serde_json::from_value(serde_json::Value::String(priority))
                .map_err(|e| RepoError::Internal(e.to_string()))?,
            scope: serde_json::from_value(serde_json::Value::String(scope))
                .map_err(|e| RepoError::Internal(e.to_string()))?,
            criteria_snapshot: json("criteria_snapshot")?,
            target_count: row.try_get("target_count").map_err(internal)?,
            sent_count: row.try_get("sent_count").map_err(internal)?,
            invalid_ids: de(json("invalid_ids")?)?,
            failed_user_ids: de(json("failed_user_ids")?)?,
            failed_user_ids_truncated: row.try_get("failed_user_ids_truncated").map_err(internal)?,
            message_ids_snapshot: de(json("message_ids_snapshot")?)?,
            message_ids_snapshot_truncated: row
                .try_get("message_ids_snapshot_truncated")
                .map_err(internal)?,
            message_id_map_snapshot: de(json("message_id_map_snapshot")?)?,
            message_id_map_truncated: row.try_get("message_id_map_truncated").map_err(internal)?,
            content_hash: row.try_get("content_hash").map_err(internal)?,
            email: de(json("email_state")?)?,
            audit_log_id: row.try_get("audit_log_id").map_err(internal)?,
            request_log_id: row.try_get("request_log_id").map_err(internal)?,
            error_log_ids: de(json("error_log_ids")?)?,
        })
    }

    const BROADCAST_COLS: &str = "id, created_at, created_by, title, content, priority, scope, \
        criteria_snapshot, target_count, sent_count, invalid_ids, failed_user_ids, \
        failed_user_ids_truncated, message_ids_snapshot, message_ids_snapshot_truncated, \
        message_id_map_snapshot, message_id_map_truncated, content_hash, email_state, \
        audit_log_id, request_log_id, error_log_ids";

    #[async_trait]
    impl DirectoryRepo for PgRepo {
        async fn insert_user(&self, new: NewUser) -> RepoResult<User> {
            let row = sqlx::query(
                "INSERT INTO users (username, email, school, school_id, location, is_admin, status) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7) RETURNING *",
            )
            .bind(&new.username)
            .bind(&new.email)
            .bind(&new.school)
            .bind(new.school_id)
            .bind(&new.location)
            .bind(new.is_admin)
            .bind(match new.status { UserStatus::Active => "active", UserStatus::Disabled => "disabled" })
            .fetch_one(&self.pool)
            .await
            .map_err(|_| RepoError::Conflict)?;
            user_from_row(&row)
        }

        async fn users_by_ids(&self, ids: &[Id]) -> RepoResult<Vec<User>> {
            let rows = sqlx::query("SELECT * FROM users WHERE id = ANY($1)")
                .bind(ids)
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?;
            rows.iter().map(user_from_row).collect()
        }

        async fn search_users(&self, filter: &RecipientFilter) -> RepoResult<Vec<User>> {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM users WHERE TRUE");
            if !filter.include_ids.is_empty() {
                qb.push(" AND id = ANY(").push_bind(filter.include_ids.clone()).push(")");
            }
            if !filter.exclude_ids.is_empty() {
                qb.push(" AND NOT (id = ANY(").push_bind(filter.exclude_ids.clone()).push("))");
            }
            if let Some(school_id) = filter.school_id {
                qb.push(" AND school_id = ").push_bind(school_id);
            }
            if let Some(ref school) = filter.school {
                qb.push(" AND school = ").push_bind(school.clone());
            }
            if let Some(ref suffix) = filter.email_suffix {
                qb.push(" AND email ILIKE ").push_bind(format!("%{}", suffix));
            }
            if let Some(status) = filter.status {
                qb.push(" AND status = ").push_bind(match status {
                    UserStatus::Active => "active",
                    UserStatus::Disabled => "disabled",
                });
            }
            if let Some(is_admin) = filter.is_admin {
                qb.push(" AND is_admin = ").push_bind(is_admin);
            }
            if let Some(ref search) = filter.search {
                if !search.is_empty() {
                    let pat = format!("%{}%", search);
                    qb.push(" AND (FALSE");
                    for f in filter.effective_fields() {
                        let col = match f {
                            SearchField::Username => "username",
                            SearchField::Email => "email",
                            SearchField::School => "school",
                            SearchField::Location => "location",
                        };
                        qb.push(format!(" OR {} ILIKE ", col)).push_bind(pat.clone());
                    }
                    qb.push(")");
                }
            }
            qb.push(" ORDER BY id");
            qb.push(" OFFSET ").push_bind(filter.offset.unwrap_or(0) as i64);
            qb.push(" LIMIT ").push_bind(filter.clamped_limit() as i64);
            let rows = qb.build().fetch_all(&self.pool).await.map_err(internal)?;
            rows.iter().map(user_from_row).collect()
        }

        async fn all_active_users(&self) -> RepoResult<Vec<User>> {
            let rows = sqlx::query("SELECT * FROM users WHERE status = 'active' ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?;
            rows.iter().map(user_from_row).collect()
        }
    }

    #[async_trait]
    impl MessageRepo for PgRepo {
        async fn create_message(&self, new: NewMessage) -> RepoResult<Message> {
            let row = sqlx::query(
                "INSERT INTO messages (receiver_id, title, content, priority, kind) \
                 VALUES ($1,$2,$3,$4,$5) RETURNING *",
            )
            .bind(new.receiver_id)
            .bind(&new.title)
            .bind(&new.content)
            .bind(new.priority.as_str())
            .bind(&new.kind)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)?;
            message_from_row(&row)
        }

        async fn messages_by_ids(&self, ids: &[Id]) -> RepoResult<Vec<Message>> {
            let rows = sqlx::query("SELECT * FROM messages WHERE id = ANY($1) ORDER BY id")
                .bind(ids)
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?;
            rows.iter().map(message_from_row).collect()
        }

        async fn find_system_messages(
            &self,
            title: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> RepoResult<Vec<Message>> {
            let rows = sqlx::query(
                "SELECT * FROM messages WHERE kind = 'system' AND title = $1 \
                 AND created_at BETWEEN $2 AND $3 ORDER BY id",
            )
            .bind(title)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
            rows.iter().map(message_from_row).collect()
        }

        async fn mark_read(&self, message_id: Id) -> RepoResult<()> {
            let res = sqlx::query("UPDATE messages SET read = TRUE WHERE id = $1")
                .bind(message_id)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BroadcastRepo for PgRepo {
        async fn insert_broadcast(&self, new: NewBroadcast) -> RepoResult<Broadcast> {
            // Caps are applied here, before the row ever hits the wire.
            let rec = new.into_record(0, Utc::now());
            let row = sqlx::query(&format!(
                "INSERT INTO broadcasts (created_by, title, content, priority, scope, \
                 criteria_snapshot, target_count, sent_count, invalid_ids, failed_user_ids, \
                 failed_user_ids_truncated, message_ids_snapshot, message_ids_snapshot_truncated, \
                 message_id_map_snapshot, message_id_map_truncated, content_hash, email_state, \
                 email_status, audit_log_id, request_log_id, error_log_ids) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21) \
                 RETURNING {BROADCAST_COLS}"
            ))
            .bind(rec.created_by)
            .bind(&rec.title)
            .bind(&rec.content)
            .bind(rec.priority.as_str())
            .bind(match rec.scope { Scope::All => "all", Scope::Custom => "custom" })
            .bind(&rec.criteria_snapshot)
            .bind(rec.target_count)
            .bind(rec.sent_count)
            .bind(serde_json::to_value(&rec.invalid_ids).unwrap_or_default())
            .bind(serde_json::to_value(&rec.failed_user_ids).unwrap_or_default())
            .bind(rec.failed_user_ids_truncated)
            .bind(serde_json::to_value(&rec.message_ids_snapshot).unwrap_or_default())
            .bind(rec.message_ids_snapshot_truncated)
            .bind(serde_json::to_value(&rec.message_id_map_snapshot).unwrap_or_default())
            .bind(rec.message_id_map_truncated)
            .bind(&rec.content_hash)
            .bind(serde_json::to_value(&rec.email).unwrap_or_default())
            .bind(email_status_str(rec.email.status))
            .bind(rec.audit_log_id)
            .bind(rec.request_log_id)
            .bind(serde_json::to_value(&rec.error_log_ids).unwrap_or_default())
            .fetch_one(&self.pool)
            .await
            .map_err(internal)?;
            broadcast_from_row(&row)
        }

        async fn get_broadcast(&self, id: Id) -> RepoResult<Broadcast> {
            let row = sqlx::query(&format!("SELECT {BROADCAST_COLS} FROM broadcasts WHERE id = $1"))
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(internal)?;
            broadcast_from_row(&row)
        }

        async fn flush_candidates(&self, limit: u32) -> RepoResult<Vec<Broadcast>> {
            let rows = sqlx::query(&format!(
                "SELECT {BROADCAST_COLS} FROM broadcasts WHERE email_status <> 'skipped' \
                 ORDER BY created_at, id LIMIT $1"
            ))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
            rows.iter().map(broadcast_from_row).collect()
        }

        async fn update_email_state(&self, id: Id, state: &EmailDeliveryState) -> RepoResult<()> {
            let res = sqlx::query(
                "UPDATE broadcasts SET email_state = $2, email_status = $3 WHERE id = $1",
            )
            .bind(id)
            .bind(serde_json::to_value(state).unwrap_or_default())
            .bind(email_status_str(state.status))
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }

        async fn broadcasts_page(&self, offset: u64, limit: u32) -> RepoResult<(Vec<Broadcast>, u64)> {
            let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM broadcasts")
                .fetch_one(&self.pool)
                .await
                .map_err(internal)?;
            let rows = sqlx::query(&format!(
                "SELECT {BROADCAST_COLS} FROM broadcasts ORDER BY created_at DESC, id DESC \
                 OFFSET $1 LIMIT $2"
            ))
            .bind(offset as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
            let v: RepoResult<Vec<Broadcast>> = rows.iter().map(broadcast_from_row).collect();
            Ok((v?, total as u64))
        }
    }

    fn email_status_str(s: EmailStatus) -> &'static str {
        match s {
            EmailStatus::Skipped => "skipped",
            EmailStatus::Queued => "queued",
            EmailStatus::Sent => "sent",
            EmailStatus::Partial => "partial",
            EmailStatus::Failed => "failed",
        }
    }
}
