use crate::config::{Community, ModmailConfig};
use crate::events::ModmailConversation;
use crate::executor::Effect;
use crate::platform::{ModNotes, PlatformError};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::sync::Arc;

/// Decides whether a modmail conversation gets the "please provide a link"
/// auto-reply.
pub struct ModmailResponder {
    config: ModmailConfig,
    notes: Arc<dyn ModNotes>,
}

impl ModmailResponder {
    pub fn new(config: ModmailConfig, notes: Arc<dyn ModNotes>) -> Self {
        Self { config, notes }
    }

    pub fn should_respond(
        &self,
        conversation: &ModmailConversation,
        community: &Community,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let Some(first) = conversation.messages.first() else {
            return Ok(false);
        };
        if first.is_admin || self.config.support_bots.iter().any(|bot| bot == &first.author) {
            log::debug!("Modmail {} is from {}, ignoring", conversation.id, first.author);
            return Ok(false);
        }

        if conversation.last_unread.is_none()
            || conversation.authors.len() > 1
            || conversation.last_mod_update.is_some()
        {
            return Ok(false);
        }

        let permalink = permalink_pattern(&community.name)?;
        if conversation
            .messages
            .iter()
            .any(|m| permalink.is_match(&m.body))
        {
            log::debug!("Modmail {} already links to content", conversation.id);
            return Ok(false);
        }

        let mentions_removal = conversation.messages.iter().any(|m| {
            let body = m.body.to_lowercase();
            self.config
                .removal_keywords
                .iter()
                .any(|keyword| body.contains(&keyword.to_lowercase()))
        });
        if mentions_removal {
            return Ok(true);
        }

        let Some(requester) = conversation.requester() else {
            return Ok(false);
        };
        Ok(self.recently_actioned(&community.name, requester, now)?)
    }

    /// Whether the newest human moderator note about `user` is a removal or
    /// ban from within the note window.
    fn recently_actioned(
        &self,
        community: &str,
        user: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, PlatformError> {
        let window = Duration::days(self.config.note_window_days);
        for note in self.notes.notes(community, user)? {
            if self.config.automated_note_actors.contains(&note.actor) {
                continue;
            }
            if now - note.created_at > window {
                return Ok(false);
            }
            if self.config.qualifying_note_actions.contains(&note.action) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn respond(
        &self,
        conversation: &ModmailConversation,
        community: &Community,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Effect>> {
        if !self.should_respond(conversation, community, now)? {
            return Ok(Vec::new());
        }
        Ok(vec![Effect::ModmailReply {
            conversation_id: conversation.id.clone(),
            text: self.config.reply_template.clone(),
        }])
    }
}

fn permalink_pattern(community: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r"(?i)reddit\.com/r/{}/comments/",
        regex::escape(community)
    ))
}
