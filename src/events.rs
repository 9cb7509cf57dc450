use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Anything delivered by an event stream. The id is used when reporting
/// failures for a single item.
pub trait StreamItem {
    fn item_id(&self) -> String;

    /// When the item last changed; replayed items are recognised by it.
    fn created_at(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Submission,
    Comment,
    User,
}

/// Reference to a piece of content (or a user, for bans) on the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRef {
    /// Platform fullname, e.g. `t3_abc123`.
    pub id: String,
    pub kind: ContentKind,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

impl ContentRef {
    /// The id without its type prefix (`t3_abc123` -> `abc123`).
    pub fn short_id(&self) -> &str {
        self.id
            .split_once('_')
            .map(|(_, id)| id)
            .unwrap_or(self.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationKind {
    Removal,
    Approval,
    Ban,
    FlairEdit,
    Other,
}

impl ModerationKind {
    /// Map a moderation-log action name onto the kinds the classifier cares about.
    pub fn from_action(action: &str) -> Self {
        match action {
            "removelink" | "removecomment" | "spamlink" | "spamcomment" => Self::Removal,
            "approvelink" | "approvecomment" => Self::Approval,
            "banuser" => Self::Ban,
            "editflair" => Self::FlairEdit,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationEvent {
    pub id: String,
    /// Raw moderation-log action name (`removelink`, `banuser`, ...).
    pub action: String,
    pub actor: String,
    pub target: ContentRef,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub details: Option<String>,
    /// Free text attached by upstream automation (e.g. the rule that fired).
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub permalink: Option<String>,
}

impl ModerationEvent {
    pub fn kind(&self) -> ModerationKind {
        ModerationKind::from_action(&self.action)
    }

    /// Best link for humans: the event permalink, else the target's url.
    pub fn link(&self) -> Option<&str> {
        self.permalink.as_deref().or(self.target.url.as_deref())
    }
}

impl StreamItem for ModerationEvent {
    fn item_id(&self) -> String {
        format!("{} ({} on {})", self.id, self.action, self.target.id)
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModmailMessage {
    pub author: String,
    pub body: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModmailConversation {
    pub id: String,
    pub messages: Vec<ModmailMessage>,
    #[serde(default)]
    pub authors: Vec<String>,
    /// The non-moderator user the conversation is with.
    #[serde(default)]
    pub participant: Option<String>,
    /// `None` once the conversation has been read.
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub last_unread: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub last_mod_update: Option<DateTime<Utc>>,
}

impl ModmailConversation {
    pub fn first_author(&self) -> Option<&str> {
        self.messages.first().map(|m| m.author.as_str())
    }

    /// The requester: explicit participant, else the first author.
    pub fn requester(&self) -> Option<&str> {
        self.participant.as_deref().or_else(|| self.first_author())
    }
}

impl StreamItem for ModmailConversation {
    fn item_id(&self) -> String {
        format!("modmail {}", self.id)
    }

    /// Newest message, so a conversation with a new reply counts as new.
    fn created_at(&self) -> DateTime<Utc> {
        self.messages
            .iter()
            .map(|m| m.created_at)
            .max()
            .or(self.last_unread)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModNote {
    pub actor: String,
    pub action: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub body: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn content_ref(&self) -> ContentRef {
        ContentRef {
            id: self.id.clone(),
            kind: ContentKind::Comment,
            title: None,
            score: 0,
            url: self.url.clone(),
            author: Some(self.author.clone()),
            removed: false,
        }
    }
}

impl StreamItem for Comment {
    fn item_id(&self) -> String {
        format!("comment {}", self.id)
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_action() {
        assert_eq!(ModerationKind::from_action("removelink"), ModerationKind::Removal);
        assert_eq!(ModerationKind::from_action("approvecomment"), ModerationKind::Approval);
        assert_eq!(ModerationKind::from_action("banuser"), ModerationKind::Ban);
        assert_eq!(ModerationKind::from_action("editflair"), ModerationKind::FlairEdit);
        assert_eq!(ModerationKind::from_action("wikirevise"), ModerationKind::Other);
    }

    #[test]
    fn test_event_parses_from_modlog_json() {
        let line = r#"{"id":"ModAction_1","action":"removelink","actor":"alice",
            "target":{"id":"t3_abc123","kind":"submission","title":"Foo","score":42,
            "url":"https://www.reddit.com/r/collapse/comments/abc123/foo/"},
            "created_at":1700000000}"#;
        let event: ModerationEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.kind(), ModerationKind::Removal);
        assert_eq!(event.target.short_id(), "abc123");
        assert_eq!(event.created_at.timestamp(), 1_700_000_000);
        assert!(event.permalink.is_none());
        assert_eq!(
            event.link(),
            Some("https://www.reddit.com/r/collapse/comments/abc123/foo/")
        );
    }

    #[test]
    fn test_conversation_requester_falls_back_to_first_author() {
        let conversation: ModmailConversation = serde_json::from_str(
            r#"{"id":"c1","messages":[{"author":"bob","body":"hi","created_at":1}]}"#,
        )
        .unwrap();
        assert_eq!(conversation.requester(), Some("bob"));
        assert!(conversation.last_unread.is_none());
    }
}
