use crate::config::Community;
use crate::moderator_cache::ModeratorCache;
use crate::platform::{BoardHistory, ModeratorSource, PlatformError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// How the dedup watermark behaves once a tracker exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkPolicy {
    /// Set once at construction and never moved.
    #[default]
    Static,
    /// Raised to the creation time of every processed event.
    Advance,
}

/// Per-community dedup watermark and comment-moderator cache.
pub struct CommunityTracker {
    community: Community,
    moderators: Arc<dyn ModeratorSource>,
    cache: ModeratorCache,
    watermark: AtomicI64,
    policy: WatermarkPolicy,
}

impl CommunityTracker {
    /// Build a tracker whose watermark comes from the newest item the bot
    /// previously posted to its own boards.
    pub fn new(
        community: Community,
        moderators: Arc<dyn ModeratorSource>,
        history: &dyn BoardHistory,
        policy: WatermarkPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self, PlatformError> {
        let watermark = initial_watermark(&community, history, now)?;
        log::info!(
            "Tracking {} from watermark {} ({policy:?})",
            community.name,
            watermark.format("%Y-%m-%d %H:%M:%S UTC")
        );
        Ok(Self::with_watermark(community, moderators, watermark, policy))
    }

    pub fn with_watermark(
        community: Community,
        moderators: Arc<dyn ModeratorSource>,
        watermark: DateTime<Utc>,
        policy: WatermarkPolicy,
    ) -> Self {
        let cache = ModeratorCache::new(
            &community.comment_mod_permissions,
            &community.comment_mod_whitelist,
        );
        Self {
            community,
            moderators,
            cache,
            watermark: AtomicI64::new(watermark.timestamp()),
            policy,
        }
    }

    pub fn community(&self) -> &Community {
        &self.community
    }

    pub fn policy(&self) -> WatermarkPolicy {
        self.policy
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.watermark.load(Ordering::Acquire), 0).unwrap_or_default()
    }

    /// Comment moderators, refreshed through the cache's TTL.
    pub fn comment_moderators(
        &self,
        now: DateTime<Utc>,
    ) -> Result<BTreeSet<String>, PlatformError> {
        self.cache
            .refresh(&self.community.name, self.moderators.as_ref(), now)
    }

    pub fn cache(&self) -> &ModeratorCache {
        &self.cache
    }

    /// Record that an event has been handled. Only moves the watermark under
    /// `WatermarkPolicy::Advance`, and never backwards.
    pub fn observe(&self, created_at: DateTime<Utc>) {
        if self.policy == WatermarkPolicy::Advance {
            self.watermark
                .fetch_max(created_at.timestamp(), Ordering::AcqRel);
        }
    }
}

/// Keeps one community's tracker across worker restarts so an advanced
/// watermark survives them. The tracker is built on first use; a failed
/// build leaves the slot empty and the next run tries again.
#[derive(Default)]
pub struct TrackerSlot {
    tracker: Mutex<Option<Arc<CommunityTracker>>>,
}

impl TrackerSlot {
    pub fn get_or_try_init(
        &self,
        init: impl FnOnce() -> Result<CommunityTracker, PlatformError>,
    ) -> Result<Arc<CommunityTracker>, PlatformError> {
        let mut slot = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tracker) = slot.as_ref() {
            return Ok(tracker.clone());
        }
        let tracker = Arc::new(init()?);
        *slot = Some(tracker.clone());
        Ok(tracker)
    }
}

/// Newest post on the mirror board, else on the removals board, else now.
/// An empty board also yields now.
pub fn initial_watermark(
    community: &Community,
    history: &dyn BoardHistory,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, PlatformError> {
    let board = community
        .mirror_board
        .as_deref()
        .or(community.removals_board.as_deref());

    match board {
        Some(board) => Ok(history.newest_post_time(board)?.unwrap_or(now)),
        None => Ok(now),
    }
}
