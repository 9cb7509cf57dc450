use crate::audit::{AuditRecorder, AuditRow};
use crate::chat::{ChatDestination, ChatSender};
use crate::dispatcher::{CallClass, Dispatched, RateLimitedDispatcher};
use crate::events::ContentRef;
use crate::platform::PlatformWriter;
use std::sync::Arc;

/// An external write decided by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    MirrorPost {
        board: String,
        title: String,
        url: String,
    },
    ChatNotify {
        destination: ChatDestination,
        text: String,
    },
    RemoveContent {
        target: ContentRef,
        reason: String,
    },
    /// Reply, distinguish + sticky the reply, then lock it.
    ReplyAndLock {
        target: ContentRef,
        text: String,
    },
    ReportContent {
        target: ContentRef,
        reason: String,
    },
    /// Reply to a modmail conversation and mark it read.
    ModmailReply {
        conversation_id: String,
        text: String,
    },
    AuditAppend(AuditRow),
}

impl Effect {
    pub fn label(&self) -> String {
        match self {
            Effect::MirrorPost { board, title, .. } => format!("post to {board}: {title}"),
            Effect::ChatNotify { destination, .. } => format!("chat to {destination}"),
            Effect::RemoveContent { target, reason } => format!("remove {} ({reason})", target.id),
            Effect::ReplyAndLock { target, .. } => format!("reply and lock on {}", target.id),
            Effect::ReportContent { target, reason } => format!("report {} ({reason})", target.id),
            Effect::ModmailReply {
                conversation_id, ..
            } => format!("modmail reply to {conversation_id}"),
            Effect::AuditAppend(row) => format!("audit {} by {}", row.action, row.actor),
        }
    }
}

/// Applies effects for one community through the shared dispatch gates.
///
/// Failed effects are dropped: the dispatcher has already reported them on
/// the error channel.
pub struct EffectExecutor {
    platform: Arc<dyn PlatformWriter>,
    platform_gate: Arc<RateLimitedDispatcher>,
    chat: Arc<dyn ChatSender>,
    chat_gate: Arc<RateLimitedDispatcher>,
    audit: Option<(AuditRecorder, RateLimitedDispatcher)>,
}

impl EffectExecutor {
    pub fn new(
        platform: Arc<dyn PlatformWriter>,
        platform_gate: Arc<RateLimitedDispatcher>,
        chat: Arc<dyn ChatSender>,
        chat_gate: Arc<RateLimitedDispatcher>,
    ) -> Self {
        Self {
            platform,
            platform_gate,
            chat,
            chat_gate,
            audit: None,
        }
    }

    /// Route `AuditAppend` effects to `recorder` through their own gate.
    pub fn with_audit(mut self, recorder: AuditRecorder, gate: RateLimitedDispatcher) -> Self {
        self.audit = Some((recorder, gate));
        self
    }

    pub fn apply_all(&self, effects: Vec<Effect>) {
        for effect in effects {
            self.apply(effect);
        }
    }

    pub fn apply(&self, effect: Effect) {
        let label = effect.label();
        log::debug!("Applying {label}");

        let outcome = match effect {
            Effect::MirrorPost { board, title, url } => {
                log::info!("Adding post to {board}: {title}");
                self.platform_gate
                    .call(&label, CallClass::Write, || {
                        self.platform.create_post(&board, &title, &url)
                    })
                    .map(|_| ())
            }
            Effect::ChatNotify { destination, text } => self
                .chat_gate
                .call(&label, CallClass::Acknowledge, || {
                    self.chat.send(&destination, &text)
                })
                .map(|_| ()),
            Effect::RemoveContent { target, reason } => {
                log::info!("Removing content {}, reason: {reason}", target.id);
                self.platform_gate
                    .call(&label, CallClass::Write, || self.platform.remove(&target, &reason))
                    .map(|_| ())
            }
            Effect::ReplyAndLock { target, text } => self.reply_and_lock(&label, &target, &text),
            Effect::ReportContent { target, reason } => self
                .platform_gate
                .call(&label, CallClass::Write, || self.platform.report(&target, &reason))
                .map(|_| ()),
            Effect::ModmailReply {
                conversation_id,
                text,
            } => {
                log::info!("Responding to modmail {conversation_id}");
                self.modmail_reply(&label, &conversation_id, &text)
            }
            Effect::AuditAppend(row) => {
                self.append_audit(&label, &row);
                Ok(())
            }
        };

        if let Err(e) = outcome {
            log::debug!("Dropped {label}: {e}");
        }
    }

    fn reply_and_lock(
        &self,
        label: &str,
        target: &ContentRef,
        text: &str,
    ) -> Result<(), crate::dispatcher::DispatchError> {
        log::info!("Writing removal comment for {}", target.id);
        let reply = match self
            .platform_gate
            .call(label, CallClass::Write, || self.platform.reply(target, text))?
        {
            Dispatched::Completed(reply) => reply,
            Dispatched::Skipped => return Ok(()),
        };

        self.platform_gate
            .call(&format!("distinguish {}", reply.id), CallClass::Acknowledge, || {
                self.platform.distinguish_sticky(&reply)
            })?;
        self.platform_gate
            .call(&format!("lock {}", reply.id), CallClass::Acknowledge, || {
                self.platform.lock(&reply)
            })?;
        Ok(())
    }

    fn modmail_reply(
        &self,
        label: &str,
        conversation_id: &str,
        text: &str,
    ) -> Result<(), crate::dispatcher::DispatchError> {
        let sent = self.platform_gate.call(label, CallClass::Write, || {
            self.platform.reply_modmail(conversation_id, text)
        })?;
        if sent == Dispatched::Skipped {
            return Ok(());
        }
        self.platform_gate
            .call(&format!("mark {conversation_id} read"), CallClass::Acknowledge, || {
                self.platform.mark_read(conversation_id)
            })?;
        Ok(())
    }

    fn append_audit(&self, label: &str, row: &AuditRow) {
        let Some((recorder, gate)) = &self.audit else {
            log::debug!("No audit sink configured, not recording {label}");
            return;
        };
        if !recorder.should_record(row) {
            log::debug!("Audit row already recorded, skipping {label}");
            return;
        }
        if let Err(e) = gate.call(label, CallClass::Acknowledge, || recorder.sink().append(row)) {
            log::debug!("Dropped {label}: {e}");
        }
    }
}
