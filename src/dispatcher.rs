use crate::chat::ErrorNotifier;
use crate::clock::{elapsed, Clock};
use crate::config::DispatchConfig;
use crate::platform::WriteError;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Process-wide dry-run switch. Cloned into every dispatcher and toggled by
/// the operator while workers are running.
#[derive(Debug, Clone, Default)]
pub struct DryRun(Arc<AtomicBool>);

impl DryRun {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set(&self, enabled: bool) -> bool {
        self.0.swap(enabled, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    /// Content-producing calls (posts, replies, removals).
    Write,
    /// Cheap follow-ups such as mark-read, distinguish or lock.
    Acknowledge,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Dispatched<T> {
    Completed(T),
    /// Dry run: nothing was sent.
    Skipped,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{label} failed after {attempts} attempts: {source}")]
    Exhausted {
        label: String,
        attempts: u32,
        #[source]
        source: WriteError,
    },
    #[error("{label} was rejected: {source}")]
    Rejected {
        label: String,
        #[source]
        source: WriteError,
    },
}

/// Throttled, retrying gate for one external write destination.
///
/// Calls through a gate are spaced at least `write_spacing_secs` apart
/// (`acknowledge_spacing_secs` for acknowledge-class calls). Transient
/// failures are retried with `base^k` second delays; once retries run out,
/// or on a permanent failure, the error channel is told once and the call is
/// dropped.
pub struct RateLimitedDispatcher {
    name: String,
    config: DispatchConfig,
    dry_run: DryRun,
    clock: Arc<dyn Clock>,
    notifier: Arc<ErrorNotifier>,
    last_call: Mutex<Option<DateTime<Utc>>>,
}

impl RateLimitedDispatcher {
    pub fn new(
        name: &str,
        config: DispatchConfig,
        dry_run: DryRun,
        clock: Arc<dyn Clock>,
        notifier: Arc<ErrorNotifier>,
    ) -> Self {
        Self {
            name: name.to_string(),
            config,
            dry_run,
            clock,
            notifier,
            last_call: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dry_run(&self) -> &DryRun {
        &self.dry_run
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        Duration::from_secs(self.config.backoff_base_secs.saturating_pow(retry))
    }

    pub fn call<T>(
        &self,
        label: &str,
        class: CallClass,
        mut op: impl FnMut() -> Result<T, WriteError>,
    ) -> Result<Dispatched<T>, DispatchError> {
        if self.dry_run.is_enabled() {
            log::info!("DRY RUN [{}]: {label}", self.name);
            return Ok(Dispatched::Skipped);
        }

        let mut retries = 0;
        loop {
            let error = match self.throttled(class, &mut op) {
                Ok(value) => return Ok(Dispatched::Completed(value)),
                Err(e) => e,
            };

            if error.is_transient() && retries < self.config.max_retries {
                retries += 1;
                let delay = self.backoff_delay(retries);
                log::warn!(
                    "[{}] {label} failed ({error}), retrying in {} seconds...",
                    self.name,
                    delay.as_secs()
                );
                self.clock.sleep(delay);
                continue;
            }

            let failure = if error.is_transient() {
                DispatchError::Exhausted {
                    label: label.to_string(),
                    attempts: retries + 1,
                    source: error,
                }
            } else {
                DispatchError::Rejected {
                    label: label.to_string(),
                    source: error,
                }
            };
            self.notifier
                .notify(&format!("[{}] dropping call: {failure}", self.name));
            return Err(failure);
        }
    }

    fn spacing(&self, class: CallClass) -> Duration {
        match class {
            CallClass::Write => Duration::from_secs(self.config.write_spacing_secs),
            CallClass::Acknowledge => Duration::from_secs(self.config.acknowledge_spacing_secs),
        }
    }

    /// Wait out the spacing since the previous call, then run `op`. The gate
    /// is held for the whole call and stamped when the call returns.
    fn throttled<T>(
        &self,
        class: CallClass,
        op: &mut impl FnMut() -> Result<T, WriteError>,
    ) -> Result<T, WriteError> {
        let spacing = self.spacing(class);
        let mut last_call = self.last_call.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last_call {
            let since = elapsed(previous, self.clock.now());
            if since < spacing {
                self.clock.sleep(spacing - since);
            }
        }
        let result = op();
        *last_call = Some(self.clock.now());
        result
    }
}
