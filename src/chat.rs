use crate::platform::WriteError;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Longest message a chat webhook accepts.
const MAX_MESSAGE_CHARS: usize = 2000;

/// A chat server plus channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatDestination {
    pub server: String,
    pub channel: String,
}

impl ChatDestination {
    pub fn new(server: &str, channel: &str) -> Self {
        Self {
            server: server.to_string(),
            channel: channel.to_string(),
        }
    }

    /// Key used for webhook lookups: `server/channel`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.server, self.channel)
    }
}

impl fmt::Display for ChatDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.server, self.channel)
    }
}

pub trait ChatSender: Send + Sync {
    fn send(&self, destination: &ChatDestination, text: &str) -> Result<(), WriteError>;
}

/// Chat sender that only writes to the log.
#[derive(Debug, Default)]
pub struct LogChat;

impl ChatSender for LogChat {
    fn send(&self, destination: &ChatDestination, text: &str) -> Result<(), WriteError> {
        log::info!("[chat {destination}] {text}");
        Ok(())
    }
}

/// Posts messages to per-channel incoming webhooks.
pub struct WebhookChat {
    client: Client,
    webhooks: HashMap<String, Url>,
}

#[derive(Serialize)]
struct WebhookMessage<'a> {
    content: &'a str,
}

impl WebhookChat {
    pub fn new(webhooks: &BTreeMap<String, String>) -> anyhow::Result<Self> {
        let mut parsed = HashMap::new();
        for (key, raw) in webhooks {
            let url = Url::parse(raw)
                .map_err(|e| anyhow::anyhow!("invalid webhook url for {key}: {e}"))?;
            parsed.insert(key.clone(), url);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("modwarden/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            webhooks: parsed,
        })
    }
}

impl ChatSender for WebhookChat {
    fn send(&self, destination: &ChatDestination, text: &str) -> Result<(), WriteError> {
        let url = self.webhooks.get(&destination.key()).ok_or_else(|| {
            WriteError::Rejected(format!("no webhook configured for {destination}"))
        })?;

        let content = truncate_message(text);
        let response = self
            .client
            .post(url.clone())
            .json(&WebhookMessage { content: &content })
            .send()
            .map_err(|e| WriteError::Transient(e.to_string()))?;

        classify_status(response.status())
    }
}

fn classify_status(status: StatusCode) -> Result<(), WriteError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Err(WriteError::RateLimited(status.to_string()))
    } else if status.is_server_error() {
        Err(WriteError::Transient(status.to_string()))
    } else {
        Err(WriteError::Rejected(status.to_string()))
    }
}

fn truncate_message(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        text.to_string()
    } else {
        let mut truncated: String = text.chars().take(MAX_MESSAGE_CHARS - 3).collect();
        truncated.push_str("...");
        truncated
    }
}

/// Surfaces failures on the error channel. Never fails itself: if the chat
/// call does not go through, the failure is only logged.
pub struct ErrorNotifier {
    chat: Arc<dyn ChatSender>,
    destination: Option<ChatDestination>,
}

impl ErrorNotifier {
    pub fn new(chat: Arc<dyn ChatSender>, destination: Option<ChatDestination>) -> Self {
        Self { chat, destination }
    }

    pub fn notify(&self, message: &str) {
        log::error!("{message}");
        let full_message = format!(
            "modwarden has had an exception. This can normally be ignored, \
             but if it's occurring frequently, may indicate a script error.\n{message}"
        );
        self.post(&full_message);
    }

    pub fn announce_online(&self, dry_run: bool) {
        let message = format!("I am online for modwarden, is_dry_run={dry_run}");
        log::info!("{message}");
        self.post(&message);
    }

    fn post(&self, text: &str) {
        if let Some(destination) = &self.destination {
            if let Err(e) = self.chat.send(destination, text) {
                log::warn!("Failed to post to error channel {destination}: {e}");
            }
        }
    }
}
