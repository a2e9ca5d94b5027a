use std::collections::HashSet;

use crate::models::{Id, RecipientFilter, RecipientRecord, Scope, UserStatus};
use crate::repo::{Repo, RepoError};

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("target_users contains no valid ids")]
    EmptyIdList,
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// What an admin request asks to target. Both absent means "all active
/// users".
#[derive(Debug, Clone, Default)]
pub struct BroadcastTargets {
    pub user_ids: Option<Vec<Id>>,
    pub filters: Option<Vec<RecipientFilter>>,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub scope: Scope,
    pub recipients: Vec<RecipientRecord>,
    pub invalid_ids: Vec<Id>,
}

/// Turn a targeting request into a deduplicated recipient set. Order is not
/// contractual; an empty result is the caller's problem, not ours.
pub async fn resolve(
    directory: &dyn Repo,
    targets: &BroadcastTargets,
) -> Result<Resolution, ResolveError> {
    let explicit = targets.user_ids.as_deref().filter(|ids| !ids.is_empty());
    let filters = targets.filters.as_deref().filter(|f| !f.is_empty());

    if let Some(ids) = explicit {
        return resolve_explicit(directory, ids).await;
    }
    if let Some(groups) = filters {
        return resolve_filters(directory, groups).await;
    }

    let recipients = directory
        .all_active_users()
        .await?
        .iter()
        .map(RecipientRecord::from)
        .collect();
    Ok(Resolution { scope: Scope::All, recipients, invalid_ids: Vec::new() })
}

async fn resolve_explicit(
    directory: &dyn Repo,
    ids: &[Id],
) -> Result<Resolution, ResolveError> {
    let mut seen = HashSet::new();
    let sanitized: Vec<Id> = ids
        .iter()
        .copied()
        .filter(|&id| id > 0 && seen.insert(id))
        .collect();
    if sanitized.is_empty() {
        return Err(ResolveError::EmptyIdList);
    }

    let users = directory.users_by_ids(&sanitized).await?;
    let mut recipients = Vec::new();
    let mut resolved = HashSet::new();
    for u in &users {
        if u.status == UserStatus::Active {
            resolved.insert(u.id);
            recipients.push(RecipientRecord::from(u));
        }
    }
    let mut invalid_ids: Vec<Id> = sanitized
        .iter()
        .copied()
        .filter(|id| !resolved.contains(id))
        .collect();
    invalid_ids.sort_unstable();

    Ok(Resolution { scope: Scope::Custom, recipients, invalid_ids })
}

async fn resolve_filters(
    directory: &dyn Repo,
    groups: &[RecipientFilter],
) -> Result<Resolution, ResolveError> {
    // Union of independent bounded searches; first-seen record wins.
    let mut seen = HashSet::new();
    let mut recipients = Vec::new();
    for group in groups {
        let users = directory.search_users(group).await?;
        for u in &users {
            if u.status == UserStatus::Active && seen.insert(u.id) {
                recipients.push(RecipientRecord::from(u));
            }
        }
    }
    Ok(Resolution { scope: Scope::Custom, recipients, invalid_ids: Vec::new() })
}
