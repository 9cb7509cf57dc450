//! Capabilities the pipeline needs from the community platform.
//!
//! The platform SDK itself lives outside this crate; these traits are the
//! seam. `LoggingPlatform` is the offline adapter used by the binary when it
//! runs against JSON-lines feeds: it serves moderator lists from config and
//! logs every write instead of performing it.

use crate::events::{ContentKind, ContentRef, ModNote};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Failure of an outbound write call.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl WriteError {
    /// Rate limiting and transient server errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transient(_))
    }
}

/// Failure of a read/lookup call.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("lookup failed: {0}")]
    Lookup(String),
    #[error("unknown board: {0}")]
    UnknownBoard(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Moderator {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

pub trait ModeratorSource: Send + Sync {
    fn moderators(&self, community: &str) -> Result<Vec<Moderator>, PlatformError>;
}

pub trait BoardHistory: Send + Sync {
    /// Creation time of the newest post on `board`, `None` for an empty board.
    fn newest_post_time(&self, board: &str) -> Result<Option<DateTime<Utc>>, PlatformError>;
}

pub trait ModNotes: Send + Sync {
    /// Moderator notes about `user`, newest first.
    fn notes(&self, community: &str, user: &str) -> Result<Vec<ModNote>, PlatformError>;
}

pub trait PlatformWriter: Send + Sync {
    fn create_post(&self, board: &str, title: &str, url: &str) -> Result<(), WriteError>;
    fn reply(&self, target: &ContentRef, text: &str) -> Result<ContentRef, WriteError>;
    fn distinguish_sticky(&self, content: &ContentRef) -> Result<(), WriteError>;
    fn lock(&self, content: &ContentRef) -> Result<(), WriteError>;
    fn remove(&self, content: &ContentRef, reason: &str) -> Result<(), WriteError>;
    fn report(&self, content: &ContentRef, reason: &str) -> Result<(), WriteError>;
    fn reply_modmail(&self, conversation_id: &str, text: &str) -> Result<(), WriteError>;
    fn mark_read(&self, conversation_id: &str) -> Result<(), WriteError>;
}

/// Offline platform adapter: reads from configuration, logs writes.
pub struct LoggingPlatform {
    moderators: BTreeMap<String, Vec<Moderator>>,
    replies: AtomicU64,
}

impl LoggingPlatform {
    pub fn new(moderators: BTreeMap<String, Vec<Moderator>>) -> Self {
        Self {
            moderators,
            replies: AtomicU64::new(0),
        }
    }
}

impl ModeratorSource for LoggingPlatform {
    fn moderators(&self, community: &str) -> Result<Vec<Moderator>, PlatformError> {
        Ok(self.moderators.get(community).cloned().unwrap_or_default())
    }
}

impl BoardHistory for LoggingPlatform {
    fn newest_post_time(&self, board: &str) -> Result<Option<DateTime<Utc>>, PlatformError> {
        log::debug!("No post history available offline for {board}");
        Ok(None)
    }
}

impl ModNotes for LoggingPlatform {
    fn notes(&self, _community: &str, _user: &str) -> Result<Vec<ModNote>, PlatformError> {
        Ok(Vec::new())
    }
}

impl PlatformWriter for LoggingPlatform {
    fn create_post(&self, board: &str, title: &str, url: &str) -> Result<(), WriteError> {
        log::info!("Adding post to {board}: {title} ({url})");
        Ok(())
    }

    fn reply(&self, target: &ContentRef, text: &str) -> Result<ContentRef, WriteError> {
        log::info!("Replying to {}: {text}", target.id);
        let n = self.replies.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(ContentRef {
            id: format!("t1_offline{n}"),
            kind: ContentKind::Comment,
            title: None,
            score: 0,
            url: None,
            author: None,
            removed: false,
        })
    }

    fn distinguish_sticky(&self, content: &ContentRef) -> Result<(), WriteError> {
        log::info!("Distinguishing and stickying {}", content.id);
        Ok(())
    }

    fn lock(&self, content: &ContentRef) -> Result<(), WriteError> {
        log::info!("Locking {}", content.id);
        Ok(())
    }

    fn remove(&self, content: &ContentRef, reason: &str) -> Result<(), WriteError> {
        log::info!("Removing {}, reason: {reason}", content.id);
        Ok(())
    }

    fn report(&self, content: &ContentRef, reason: &str) -> Result<(), WriteError> {
        log::info!("Reporting {}, reason: {reason}", content.id);
        Ok(())
    }

    fn reply_modmail(&self, conversation_id: &str, text: &str) -> Result<(), WriteError> {
        log::info!("Responding to modmail {conversation_id}: {text}");
        Ok(())
    }

    fn mark_read(&self, conversation_id: &str) -> Result<(), WriteError> {
        log::info!("Marking modmail {conversation_id} read");
        Ok(())
    }
}
