use crate::platform::{ModeratorSource, PlatformError};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::{PoisonError, RwLock};

/// Per-community cache of comment moderators: moderators whose permission
/// set is exactly the configured one and who are not whitelisted.
///
/// The list is recomputed at most once per TTL window (24h by default).
/// Readers share the lock; a refresh holds the write lock for the duration
/// of the fetch so concurrent workers never fetch twice for one window.
#[derive(Debug)]
pub struct ModeratorCache {
    permissions: BTreeSet<String>,
    whitelist: HashSet<String>,
    ttl: Duration,
    state: RwLock<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    members: BTreeSet<String>,
    last_refreshed: Option<DateTime<Utc>>,
}

impl CacheState {
    fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.last_refreshed
            .map(|last| now - last < ttl)
            .unwrap_or(false)
    }
}

impl ModeratorCache {
    pub fn new(permissions: &[String], whitelist: &[String]) -> Self {
        Self::with_ttl(permissions, whitelist, Duration::hours(24))
    }

    pub fn with_ttl(permissions: &[String], whitelist: &[String], ttl: Duration) -> Self {
        Self {
            permissions: permissions.iter().cloned().collect(),
            whitelist: whitelist.iter().cloned().collect(),
            ttl,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Return the comment moderators, refetching from `source` when the
    /// cached set is older than the TTL. Fetch errors leave the cache as it
    /// was so the next call tries again.
    pub fn refresh(
        &self,
        community: &str,
        source: &dyn ModeratorSource,
        now: DateTime<Utc>,
    ) -> Result<BTreeSet<String>, PlatformError> {
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if state.is_fresh(now, self.ttl) {
                return Ok(state.members.clone());
            }
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        // another worker may have refreshed while we waited for the lock
        if state.is_fresh(now, self.ttl) {
            return Ok(state.members.clone());
        }

        let members: BTreeSet<String> = source
            .moderators(community)?
            .into_iter()
            .filter(|m| !self.whitelist.contains(&m.name))
            .filter(|m| m.permissions.iter().cloned().collect::<BTreeSet<_>>() == self.permissions)
            .map(|m| m.name)
            .collect();

        log::info!("Refreshed comment mods for {community}: {members:?}");
        state.members = members.clone();
        state.last_refreshed = Some(now);
        Ok(members)
    }

    /// Current members without triggering a refresh.
    pub fn members(&self) -> BTreeSet<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .clone()
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_refreshed
    }
}
