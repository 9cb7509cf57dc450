//! In-crate fakes shared by the unit tests.

use crate::audit::{AuditRow, AuditSink};
use crate::chat::{ChatDestination, ChatSender};
use crate::clock::Clock;
use crate::events::{ContentKind, ContentRef, ModNote};
use crate::platform::{
    BoardHistory, ModNotes, Moderator, ModeratorSource, PlatformError, PlatformWriter, WriteError,
};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Clock whose sleeps advance time instantly and are recorded.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn starting_at(secs: i64) -> Self {
        Self {
            now: Mutex::new(at(secs)),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(duration).unwrap();
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        self.advance(duration);
    }
}

#[derive(Default)]
pub struct RecordingChat {
    messages: Mutex<Vec<(ChatDestination, String)>>,
    attempts: AtomicUsize,
    failing: bool,
}

impl RecordingChat {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<(ChatDestination, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl ChatSender for RecordingChat {
    fn send(&self, destination: &ChatDestination, text: &str) -> Result<(), WriteError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(WriteError::Rejected("chat is down".into()));
        }
        self.messages
            .lock()
            .unwrap()
            .push((destination.clone(), text.to_string()));
        Ok(())
    }
}

pub struct StaticModerators {
    moderators: Mutex<Vec<Moderator>>,
    calls: AtomicUsize,
    fail_next: AtomicBool,
}

impl StaticModerators {
    pub fn new(moderators: Vec<Moderator>) -> Self {
        Self {
            moderators: Mutex::new(moderators),
            calls: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn named(names_and_perms: &[(&str, &[&str])]) -> Self {
        Self::new(
            names_and_perms
                .iter()
                .map(|(name, perms)| Moderator {
                    name: name.to_string(),
                    permissions: perms.iter().map(|p| p.to_string()).collect(),
                })
                .collect(),
        )
    }

    pub fn set(&self, moderators: Vec<Moderator>) {
        *self.moderators.lock().unwrap() = moderators;
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModeratorSource for StaticModerators {
    fn moderators(&self, _community: &str) -> Result<Vec<Moderator>, PlatformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PlatformError::Lookup("moderator list unavailable".into()));
        }
        Ok(self.moderators.lock().unwrap().clone())
    }
}

pub struct StaticHistory {
    newest: HashMap<String, DateTime<Utc>>,
    failing: bool,
}

impl StaticHistory {
    pub fn new(entries: &[(&str, i64)]) -> Self {
        Self {
            newest: entries
                .iter()
                .map(|(board, secs)| (board.to_string(), at(*secs)))
                .collect(),
            failing: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            newest: HashMap::new(),
            failing: true,
        }
    }
}

impl BoardHistory for StaticHistory {
    fn newest_post_time(&self, board: &str) -> Result<Option<DateTime<Utc>>, PlatformError> {
        if self.failing {
            return Err(PlatformError::UnknownBoard(board.to_string()));
        }
        Ok(self.newest.get(board).copied())
    }
}

#[derive(Default)]
pub struct StaticNotes {
    notes: Vec<ModNote>,
    failing: bool,
}

impl StaticNotes {
    pub fn new(notes: Vec<ModNote>) -> Self {
        Self {
            notes,
            failing: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            notes: Vec::new(),
            failing: true,
        }
    }
}

impl ModNotes for StaticNotes {
    fn notes(&self, _community: &str, _user: &str) -> Result<Vec<ModNote>, PlatformError> {
        if self.failing {
            return Err(PlatformError::Lookup("notes unavailable".into()));
        }
        Ok(self.notes.clone())
    }
}

/// Records every write call as a short string; can be scripted to fail.
#[derive(Default)]
pub struct RecordingPlatform {
    calls: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<WriteError>>,
}

impl RecordingPlatform {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Queue failures returned by the next write calls, in order.
    pub fn fail_with(&self, errors: Vec<WriteError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    fn record(&self, call: String) -> Result<(), WriteError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl PlatformWriter for RecordingPlatform {
    fn create_post(&self, board: &str, title: &str, url: &str) -> Result<(), WriteError> {
        self.record(format!("post {board} {title} {url}"))
    }

    fn reply(&self, target: &ContentRef, text: &str) -> Result<ContentRef, WriteError> {
        self.record(format!("reply {} {text}", target.id))?;
        Ok(ContentRef {
            id: format!("t1_reply_to_{}", target.short_id()),
            kind: ContentKind::Comment,
            title: None,
            score: 0,
            url: None,
            author: None,
            removed: false,
        })
    }

    fn distinguish_sticky(&self, content: &ContentRef) -> Result<(), WriteError> {
        self.record(format!("distinguish {}", content.id))
    }

    fn lock(&self, content: &ContentRef) -> Result<(), WriteError> {
        self.record(format!("lock {}", content.id))
    }

    fn remove(&self, content: &ContentRef, reason: &str) -> Result<(), WriteError> {
        self.record(format!("remove {} {reason}", content.id))
    }

    fn report(&self, content: &ContentRef, reason: &str) -> Result<(), WriteError> {
        self.record(format!("report {} {reason}", content.id))
    }

    fn reply_modmail(&self, conversation_id: &str, text: &str) -> Result<(), WriteError> {
        self.record(format!("modmail {conversation_id} {text}"))
    }

    fn mark_read(&self, conversation_id: &str) -> Result<(), WriteError> {
        self.record(format!("read {conversation_id}"))
    }
}

#[derive(Default)]
pub struct MemoryAuditSink {
    rows: Mutex<Vec<AuditRow>>,
    last: Option<DateTime<Utc>>,
}

impl MemoryAuditSink {
    pub fn with_last_recorded(last: DateTime<Utc>) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            last: Some(last),
        }
    }

    pub fn rows(&self) -> Vec<AuditRow> {
        self.rows.lock().unwrap().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, row: &AuditRow) -> Result<(), WriteError> {
        self.rows.lock().unwrap().push(row.clone());
        Ok(())
    }

    fn last_recorded(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(self.last)
    }
}
