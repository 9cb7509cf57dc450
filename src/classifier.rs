use crate::audit::AuditRow;
use crate::config::{ClassifierConfig, Community};
use crate::events::{ContentKind, ModerationEvent, ModerationKind};
use crate::executor::Effect;
use crate::platform::PlatformError;
use crate::tracker::CommunityTracker;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

const MAX_TITLE_CHARS: usize = 275;

/// Turns moderation-log events into effects.
pub struct ActionClassifier {
    ignored_actors: HashSet<String>,
    audit_excluded_actors: HashSet<String>,
}

impl ActionClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            ignored_actors: config.ignored_actors.iter().cloned().collect(),
            audit_excluded_actors: config.audit_excluded_actors.iter().cloned().collect(),
        }
    }

    /// Effects for one event. Every rule is evaluated independently, so one
    /// event may produce mirror, chat and audit effects at once.
    ///
    /// Fails only when the comment-moderator list cannot be refreshed.
    pub fn classify(
        &self,
        event: &ModerationEvent,
        tracker: &CommunityTracker,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, PlatformError> {
        if self.ignored_actors.contains(&event.actor) {
            log::debug!("Ignoring {} by automated account {}", event.action, event.actor);
            return Ok(Vec::new());
        }
        if event.created_at <= tracker.watermark() {
            log::debug!("Skipping already handled event {}", event.id);
            return Ok(Vec::new());
        }

        let community = tracker.community();
        let mut effects = Vec::new();

        match event.kind() {
            ModerationKind::Removal if event.target.kind == ContentKind::Submission => {
                self.on_removal(event, tracker, now, &mut effects)?;
            }
            ModerationKind::Approval if event.target.kind == ContentKind::Submission => {
                self.on_approval(event, tracker, now, &mut effects)?;
            }
            ModerationKind::Ban => on_ban(event, community, &mut effects),
            ModerationKind::FlairEdit => on_flair_edit(event, community, &mut effects),
            _ => {}
        }

        if community.features.audit && !self.audit_excluded_actors.contains(&event.actor) {
            effects.push(Effect::AuditAppend(AuditRow {
                community: community.name.clone(),
                timestamp: event.created_at,
                actor: event.actor.clone(),
                action: event.action.clone(),
                link: event.link().unwrap_or_default().to_string(),
                details: event.details.clone(),
                automation_rule: event.description.clone(),
            }));
        }

        Ok(effects)
    }

    fn on_removal(
        &self,
        event: &ModerationEvent,
        tracker: &CommunityTracker,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Result<(), PlatformError> {
        if event.details.as_deref() == Some("confirm_spam") {
            log::debug!("Not mirroring spam removal {}", event.id);
            return Ok(());
        }
        let Some(url) = event.target.url.clone() else {
            log::warn!("Removal {} has no content url, not mirroring", event.id);
            return Ok(());
        };

        let community = tracker.community();
        let title = mirror_title(event.target.score, event.target.title.as_deref().unwrap_or(""));
        if let Some(board) = &community.mirror_board {
            effects.push(Effect::MirrorPost {
                board: board.clone(),
                title: title.clone(),
                url: url.clone(),
            });
        }

        if tracker.comment_moderators(now)?.contains(&event.actor) {
            comment_mod_effects(event, community, "removed", title, url, effects);
        }
        Ok(())
    }

    fn on_approval(
        &self,
        event: &ModerationEvent,
        tracker: &CommunityTracker,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Result<(), PlatformError> {
        if !tracker.comment_moderators(now)?.contains(&event.actor) {
            return Ok(());
        }
        let Some(url) = event.target.url.clone() else {
            log::warn!("Approval {} has no content url, not mirroring", event.id);
            return Ok(());
        };
        let title = mirror_title(event.target.score, event.target.title.as_deref().unwrap_or(""));
        comment_mod_effects(event, tracker.community(), "approved", title, url, effects);
        Ok(())
    }
}

/// `[{score}] {title}`, cut to 275 characters plus an ellipsis.
pub fn mirror_title(score: i64, title: &str) -> String {
    let full = format!("[{score}] {title}");
    if full.chars().count() > MAX_TITLE_CHARS {
        let mut truncated: String = full.chars().take(MAX_TITLE_CHARS).collect();
        truncated.push_str("...");
        truncated
    } else {
        full
    }
}

fn comment_mod_effects(
    event: &ModerationEvent,
    community: &Community,
    verb: &str,
    title: String,
    url: String,
    effects: &mut Vec<Effect>,
) {
    if let Some(destination) = &community.removals_chat {
        effects.push(Effect::ChatNotify {
            destination: destination.clone(),
            text: format!(
                "Comment mod u/{} {verb} a post: {}\n{url}",
                event.actor,
                event.target.title.as_deref().unwrap_or("(untitled)")
            ),
        });
    }
    if let Some(board) = &community.removals_board {
        effects.push(Effect::MirrorPost {
            board: board.clone(),
            title,
            url,
        });
    }
}

fn on_ban(event: &ModerationEvent, community: &Community, effects: &mut Vec<Effect>) {
    let Some(destination) = &community.bans_chat else {
        return;
    };
    let banned = event
        .target
        .author
        .as_deref()
        .unwrap_or(event.target.short_id());
    let mut text = format!(
        "u/{banned} was banned by u/{}. Reason: {}",
        event.actor,
        event.details.as_deref().unwrap_or("none given")
    );
    if let Some(permalink) = &event.permalink {
        text.push('\n');
        text.push_str(permalink);
    }
    effects.push(Effect::ChatNotify {
        destination: destination.clone(),
        text,
    });
}

fn on_flair_edit(event: &ModerationEvent, community: &Community, effects: &mut Vec<Effect>) {
    let Some(flair) = event.details.as_deref() else {
        return;
    };
    let marker = community.flair_violation_marker.to_lowercase();
    if !flair.to_lowercase().contains(&marker) || event.target.removed {
        return;
    }

    log::info!("Flair helper: {} flaired \"{flair}\" on {}", event.actor, event.target.id);
    effects.push(Effect::RemoveContent {
        target: event.target.clone(),
        reason: "Flair helper".to_string(),
    });
    effects.push(Effect::ReplyAndLock {
        target: event.target.clone(),
        text: flair_reply(flair, &community.name),
    });
}

fn flair_reply(flair: &str, community: &str) -> String {
    format!(
        "Hi, thanks for contributing. However, your submission was removed from r/{community}.\n\n\
         > {flair}\n\n\
         You can message the mods if you feel this was in error, please include a link to \
         the submission."
    )
}
