use crate::chat::ErrorNotifier;
use crate::config::SupervisorConfig;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Cooperative cancellation flag that can also be waited on.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<(Mutex<bool>, Condvar)>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (stopped, wake) = &*self.0;
        *stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        wake.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.0 .0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`. Returns true if stop was signalled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (stopped, wake) = &*self.0;
        let guard = stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = wake
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// A unit of long-running work the supervisor keeps alive.
pub trait Task: Send {
    fn name(&self) -> &str;

    /// Run until the work is done (`Ok`), it fails (`Err`), or `stop` is
    /// signalled. Returning `Ok` ends supervision of the task.
    fn run_once(&mut self, stop: &StopSignal) -> anyhow::Result<()>;
}

/// Builds a fresh task for every run. A failing factory counts as a fault.
pub type TaskFactory = Arc<dyn Fn() -> anyhow::Result<Box<dyn Task>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Faulted,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub delay: Duration,
    /// `None` restarts forever.
    pub max_restarts: Option<u32>,
}

impl RestartPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            delay: Duration::from_secs(config.restart_delay_secs),
            max_restarts: config.max_restarts,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

struct Shared {
    state: Mutex<WorkerState>,
    restarts: AtomicU32,
}

impl Shared {
    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Runs a task on its own thread and restarts it after failures and panics.
pub struct Supervisor {
    name: String,
    factory: TaskFactory,
    policy: RestartPolicy,
    notifier: Arc<ErrorNotifier>,
    shared: Arc<Shared>,
    stop: StopSignal,
    handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(
        name: &str,
        factory: TaskFactory,
        policy: RestartPolicy,
        notifier: Arc<ErrorNotifier>,
    ) -> Self {
        Self {
            name: name.to_string(),
            factory,
            policy,
            notifier,
            shared: Arc::new(Shared {
                state: Mutex::new(WorkerState::Idle),
                restarts: AtomicU32::new(0),
            }),
            stop: StopSignal::new(),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.handle.is_some() {
            anyhow::bail!("worker {} is already started", self.name);
        }

        self.stop = StopSignal::new();
        self.shared.set_state(WorkerState::Running);

        let worker = SupervisedLoop {
            name: self.name.clone(),
            factory: self.factory.clone(),
            policy: self.policy.clone(),
            notifier: self.notifier.clone(),
            shared: self.shared.clone(),
            stop: self.stop.clone(),
        };
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker.run())?;

        log::info!("Started worker {}", self.name);
        self.handle = Some(handle);
        Ok(())
    }

    /// Signal the worker to stop; does not wait for it.
    pub fn stop(&self) {
        log::info!("Stopping worker {}", self.name);
        self.stop.stop();
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Worker thread {} panicked outside its task", self.name);
            }
        }
        self.shared.set_state(WorkerState::Stopped);
    }

    /// Stop, wait, and start a fresh task instance from the same factory.
    pub fn restart(&mut self) -> anyhow::Result<()> {
        log::info!("Restarting worker {}...", self.name);
        self.stop();
        self.join();
        self.start()
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restarts performed after faults since the supervisor was created.
    pub fn restarts(&self) -> u32 {
        self.shared.restarts.load(Ordering::SeqCst)
    }
}

struct SupervisedLoop {
    name: String,
    factory: TaskFactory,
    policy: RestartPolicy,
    notifier: Arc<ErrorNotifier>,
    shared: Arc<Shared>,
    stop: StopSignal,
}

impl SupervisedLoop {
    fn run(self) {
        let mut restarts = 0;
        while !self.stop.is_stopped() {
            self.shared.set_state(WorkerState::Running);

            let outcome = catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<()> {
                let mut task = (self.factory)()?;
                log::debug!("Running task {}", task.name());
                task.run_once(&self.stop)
            }));
            let failure = match outcome {
                Ok(Ok(())) => break,
                Ok(Err(e)) => format!("{e:?}"),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            if self.stop.is_stopped() {
                log::debug!("Worker {} ended while stopping: {failure}", self.name);
                break;
            }

            self.shared.set_state(WorkerState::Faulted);
            self.notifier
                .notify(&format!("Exception in worker {}: {failure}", self.name));

            if let Some(max) = self.policy.max_restarts {
                if restarts >= max {
                    log::error!(
                        "Worker {} failed {} times, giving up",
                        self.name,
                        restarts + 1
                    );
                    break;
                }
            }
            if self.stop.wait_timeout(self.policy.delay) {
                break;
            }

            restarts += 1;
            self.shared.restarts.fetch_add(1, Ordering::SeqCst);
            log::info!("Restarting worker {}...", self.name);
        }
        self.shared.set_state(WorkerState::Stopped);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
