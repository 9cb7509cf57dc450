use crate::chat::ErrorNotifier;
use crate::classifier::ActionClassifier;
use crate::clock::Clock;
use crate::config::Community;
use crate::events::{Comment, ModerationEvent, ModmailConversation, StreamItem};
use crate::executor::EffectExecutor;
use crate::feed::EventSource;
use crate::modmail::ModmailResponder;
use crate::supervisor::{StopSignal, Task};
use crate::toxicity::CommentScreener;
use crate::tracker::CommunityTracker;
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Per-item processing for one stream category.
pub trait EventHandler: Send + Sync {
    type Item: StreamItem;

    fn handle(&self, item: &Self::Item) -> anyhow::Result<()>;
}

/// Remembers which items a stream has already delivered, across
/// subscriptions, so the backlog replayed after a restart is not handled
/// twice. Tracks the newest `created_at` seen plus the ids seen at that
/// second.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    seen: Mutex<Option<(DateTime<Utc>, HashSet<String>)>>,
}

impl ReplayGuard {
    /// Records the item and returns whether it had not been seen before.
    pub fn first_sighting(&self, created_at: DateTime<Utc>, id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        match seen.as_mut() {
            Some((newest, _)) if created_at < *newest => false,
            Some((newest, ids)) if created_at == *newest => ids.insert(id.to_string()),
            _ => {
                *seen = Some((created_at, HashSet::from([id.to_string()])));
                true
            }
        }
    }
}

/// Consumes one subscription of an event source. Failures of single items
/// are reported and skipped; the stream ending or failing ends the run.
pub struct StreamWorker<S, H> {
    name: String,
    source: Arc<S>,
    handler: Arc<H>,
    notifier: Arc<ErrorNotifier>,
    replay: Option<Arc<ReplayGuard>>,
}

impl<S, H> StreamWorker<S, H> {
    pub fn new(name: &str, source: Arc<S>, handler: Arc<H>, notifier: Arc<ErrorNotifier>) -> Self {
        Self {
            name: name.to_string(),
            source,
            handler,
            notifier,
            replay: None,
        }
    }

    /// Skip items the guard has already seen. Share one guard between the
    /// instances a supervisor builds for the same stream.
    pub fn with_replay_guard(mut self, replay: Arc<ReplayGuard>) -> Self {
        self.replay = Some(replay);
        self
    }

    fn is_replayed(&self, item: &impl StreamItem) -> bool {
        match &self.replay {
            Some(replay) => !replay.first_sighting(item.created_at(), &item.item_id()),
            None => false,
        }
    }
}

impl<S, H> StreamWorker<S, H>
where
    S: EventSource,
    S::Item: StreamItem,
    H: EventHandler<Item = S::Item>,
{
    fn guard(&self, item: &S::Item) {
        if let Err(e) = self.handler.handle(item) {
            self.notifier.notify(&format!(
                "Exception in {} loop for {}: {e:?}",
                self.name,
                item.item_id()
            ));
        }
    }
}

impl<S, H> Task for StreamWorker<S, H>
where
    S: EventSource,
    S::Item: StreamItem,
    H: EventHandler<Item = S::Item>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run_once(&mut self, stop: &StopSignal) -> anyhow::Result<()> {
        let stream = self
            .source
            .subscribe(stop)
            .with_context(|| format!("Failed to subscribe {}", self.name))?;

        for item in stream {
            if stop.is_stopped() {
                return Ok(());
            }
            match item {
                Ok(item) if self.is_replayed(&item) => {
                    log::debug!("Skipping replayed {}", item.item_id());
                }
                Ok(item) => self.guard(&item),
                Err(e) if !e.is_fatal() => self
                    .notifier
                    .notify(&format!("Skipping unreadable item in {}: {e}", self.name)),
                Err(e) => return Err(e).with_context(|| format!("Stream {} failed", self.name)),
            }
        }

        if stop.is_stopped() {
            return Ok(());
        }
        anyhow::bail!("stream {} exhausted", self.name)
    }
}

/// Moderation-log events: classify, apply, then mark handled.
pub struct ModLogHandler {
    tracker: Arc<CommunityTracker>,
    classifier: ActionClassifier,
    executor: Arc<EffectExecutor>,
    clock: Arc<dyn Clock>,
}

impl ModLogHandler {
    pub fn new(
        tracker: Arc<CommunityTracker>,
        classifier: ActionClassifier,
        executor: Arc<EffectExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tracker,
            classifier,
            executor,
            clock,
        }
    }
}

impl EventHandler for ModLogHandler {
    type Item = ModerationEvent;

    fn handle(&self, event: &ModerationEvent) -> anyhow::Result<()> {
        let effects = self
            .classifier
            .classify(event, &self.tracker, self.clock.now())
            .context("Failed to refresh comment moderators")?;
        self.executor.apply_all(effects);
        self.tracker.observe(event.created_at);
        Ok(())
    }
}

pub struct ModmailHandler {
    community: Community,
    responder: ModmailResponder,
    executor: Arc<EffectExecutor>,
    clock: Arc<dyn Clock>,
}

impl ModmailHandler {
    pub fn new(
        community: Community,
        responder: ModmailResponder,
        executor: Arc<EffectExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            community,
            responder,
            executor,
            clock,
        }
    }
}

impl EventHandler for ModmailHandler {
    type Item = ModmailConversation;

    fn handle(&self, conversation: &ModmailConversation) -> anyhow::Result<()> {
        let effects = self
            .responder
            .respond(conversation, &self.community, self.clock.now())?;
        self.executor.apply_all(effects);
        Ok(())
    }
}

pub struct CommentHandler {
    community: Community,
    screener: CommentScreener,
    executor: Arc<EffectExecutor>,
}

impl CommentHandler {
    pub fn new(
        community: Community,
        screener: CommentScreener,
        executor: Arc<EffectExecutor>,
    ) -> Self {
        Self {
            community,
            screener,
            executor,
        }
    }
}

impl EventHandler for CommentHandler {
    type Item = Comment;

    fn handle(&self, comment: &Comment) -> anyhow::Result<()> {
        self.executor
            .apply_all(self.screener.screen(comment, &self.community));
        Ok(())
    }
}
