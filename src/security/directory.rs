//! Group membership synchronized from an external directory service.
//!
//! Membership fetched from the directory is cached per group with the time
//! of the last refresh. It changes only on [`MembershipCache::force_refresh`];
//! until then it is possibly stale, and past `max_age` it is reported as
//! [`Freshness::Stale`] and logged whenever it feeds a decision.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use super::principal::{GroupId, PrincipalId};
use super::privilege::Privilege;
use super::snapshot::SecuritySnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("directory has no group `{0}`")]
    UnknownGroup(String),
}

/// The directory service. Only the membership query is needed.
pub trait Directory: Send + Sync {
    fn members(&self, directory_ref: &str) -> Result<Vec<PrincipalId>, DirectoryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale { age: Duration },
    /// Never refreshed from the directory.
    Unknown,
}

#[derive(Debug, Clone)]
struct CachedMembers {
    directory_ref: String,
    members: HashSet<PrincipalId>,
    refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MembershipState {
    groups: HashMap<GroupId, CachedMembers>,
    generation: u64,
}

pub struct MembershipCache {
    directory: Arc<dyn Directory>,
    max_age: Duration,
    state: RwLock<MembershipState>,
}

impl MembershipCache {
    pub fn new(directory: Arc<dyn Directory>, max_age: Duration) -> Self {
        MembershipCache {
            directory,
            max_age,
            state: RwLock::new(MembershipState::default()),
        }
    }

    /// Re-read one group from the directory. On failure the previous
    /// membership, and its refresh time, are kept.
    pub fn force_refresh(
        &self,
        group: GroupId,
        directory_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, DirectoryError> {
        let members: HashSet<PrincipalId> = match self.directory.members(directory_ref) {
            Ok(members) => members.into_iter().collect(),
            Err(e) => {
                tracing::warn!(group = %group, directory_ref, error = %e, "directory refresh failed");
                return Err(e);
            }
        };
        let count = members.len();

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.groups.insert(
            group,
            CachedMembers {
                directory_ref: directory_ref.to_string(),
                members,
                refreshed_at: now,
            },
        );
        state.generation += 1;
        tracing::debug!(group = %group, directory_ref, members = count, "refreshed directory membership");
        Ok(count)
    }

    pub fn refreshed_at(&self, group: GroupId) -> Option<DateTime<Utc>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.groups.get(&group).map(|cached| cached.refreshed_at)
    }

    pub fn freshness(&self, group: GroupId, now: DateTime<Utc>) -> Freshness {
        match self.refreshed_at(group) {
            None => Freshness::Unknown,
            Some(at) => self.classify(now - at),
        }
    }

    fn classify(&self, age: Duration) -> Freshness {
        if age > self.max_age {
            Freshness::Stale { age }
        } else {
            Freshness::Fresh
        }
    }

    /// Cached groups older than `max_age`.
    pub fn stale_groups(&self, now: DateTime<Utc>) -> Vec<GroupId> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut stale: Vec<_> = state
            .groups
            .iter()
            .filter(|(_, cached)| now - cached.refreshed_at > self.max_age)
            .map(|(id, _)| *id)
            .collect();
        stale.sort();
        stale
    }

    pub fn members(&self, group: GroupId) -> Option<HashSet<PrincipalId>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.groups.get(&group).map(|cached| cached.members.clone())
    }

    /// Bumped on every successful refresh.
    pub fn generation(&self) -> u64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).generation
    }

    /// Replace the stored membership of every directory-linked group in
    /// `snapshot` with the cached one.
    pub(crate) fn overlay<P: Privilege>(&self, snapshot: &mut SecuritySnapshot<P>, now: DateTime<Utc>) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let linked: Vec<(GroupId, String)> = snapshot
            .groups()
            .filter_map(|(id, group)| group.directory_ref.clone().map(|r| (id, r)))
            .collect();

        for (group, directory_ref) in linked {
            let Some(cached) = state.groups.get(&group) else {
                tracing::warn!(group = %group, directory_ref = %directory_ref, "directory membership never refreshed; using stored members");
                continue;
            };
            if cached.directory_ref != directory_ref {
                tracing::warn!(group = %group, cached = %cached.directory_ref, stored = %directory_ref, "directory reference changed since last refresh; using stored members");
                continue;
            }
            if let Freshness::Stale { age } = self.classify(now - cached.refreshed_at) {
                tracing::warn!(group = %group, age_secs = age.num_seconds(), "using stale directory membership");
            }
            // the group was listed from this snapshot, so it exists
            let _ = snapshot.replace_members(group, cached.members.iter().copied());
        }
    }
}
