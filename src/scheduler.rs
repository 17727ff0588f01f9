//! # Task Scheduler
//! Bounded worker pool over a FIFO wait queue of keyed, cancellable work items.
//!
//! - `enqueue` never blocks; a key already waiting or running is rejected, so each key
//!   has at most one live run.
//! - `cancel` drops a waiting item before it starts, or signals a running item's token.
//! - Every failure, panic or cancellation of a work item reaches its `on_error` handler
//!   exactly once, and the worker slot is released on every path.
//! - A finished item's handler runs in the same critical section that releases its key,
//!   so whatever the handler records is visible no earlier than the key is free again.
//!
//! Handlers (`on_success`, `on_error`, `on_admitted`) run while the scheduler's state
//! lock is held, so they must not call back into the scheduler.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::gauge;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a unit of work reports when it does not complete normally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,
    #[error("{message}")]
    Failed {
        message: String,
        cause: Option<String>,
    },
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn failed(err: &(dyn std::error::Error + 'static)) -> Self {
        TaskError::Failed {
            message: err.to_string(),
            cause: err.source().map(ToString::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("task {0} is already waiting or in progress")]
    AlreadyQueued(String),
    #[error("task {0} is neither waiting nor in progress")]
    NotFound(String),
    #[error("scheduler is shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Item was still waiting and has been dropped without running.
    RemovedWaiting,
    /// Item is running; its token was cancelled and it will unwind at its next check.
    CancellationRequested,
}

type TaskAction<T> = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<T, TaskError>> + Send>;
type SuccessHandler<T> = Box<dyn FnOnce(T) + Send>;
type ErrorHandler = Box<dyn FnOnce(TaskError) + Send>;
type AdmissionHook = Box<dyn FnOnce() + Send>;

/// A keyed unit of work producing `T` on success.
pub struct WorkItem<K, T = ()> {
    key: K,
    action: TaskAction<T>,
    on_success: Option<SuccessHandler<T>>,
    on_error: Option<ErrorHandler>,
    on_admitted: Option<AdmissionHook>,
}

impl<K, T: Send + 'static> WorkItem<K, T> {
    pub fn new<F, Fut>(key: K, action: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        Self {
            key,
            action: Box::new(move |token| action(token).boxed()),
            on_success: None,
            on_error: None,
            on_admitted: None,
        }
    }

    /// Called with the action's value once it completes normally.
    pub fn on_success(mut self, handler: impl FnOnce(T) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(handler));
        self
    }

    /// Called once if the action fails, panics, or is cancelled (waiting or running).
    pub fn on_error(mut self, handler: impl FnOnce(TaskError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(handler));
        self
    }

    /// Called after the duplicate check passes, before any worker can pick the item up.
    pub fn on_admitted(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_admitted = Some(Box::new(hook));
        self
    }
}

struct State<K, T> {
    waiting: VecDeque<WorkItem<K, T>>,
    running: HashMap<K, CancellationToken>,
}

impl<K, T> State<K, T> {
    fn publish_gauges(&self) {
        gauge!("scheduler_waiting").set(self.waiting.len() as f64);
        gauge!("scheduler_running").set(self.running.len() as f64);
    }
}

struct Shared<K, T> {
    state: Mutex<State<K, T>>,
    notify: Notify,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; all clones drive the same pool.
pub struct TaskScheduler<K, T = ()> {
    shared: Arc<Shared<K, T>>,
}

impl<K, T> Clone for TaskScheduler<K, T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, T> TaskScheduler<K, T>
where
    K: Eq + Hash + Clone + Display + Send + 'static,
    T: Send + 'static,
{
    /// Spawn `workers` (at least one) worker tasks on the current Tokio runtime.
    pub fn start(workers: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                waiting: VecDeque::new(),
                running: HashMap::new(),
            }),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        });

        let workers = workers.max(1);
        let handles = (0..workers)
            .map(|n| tokio::spawn(worker_loop(shared.clone(), n)))
            .collect();
        *shared.workers.lock() = handles;

        info!(target: "scheduler", workers, "task scheduler started");
        Self { shared }
    }

    pub fn enqueue(&self, mut item: WorkItem<K, T>) -> Result<(), SchedulerError> {
        let mut state = self.shared.state.lock();
        // Checked under the lock: `shutdown` drains the queue under it after cancelling.
        if self.shared.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        if state.running.contains_key(&item.key) || state.waiting.iter().any(|w| w.key == item.key)
        {
            return Err(SchedulerError::AlreadyQueued(item.key.to_string()));
        }

        if let Some(hook) = item.on_admitted.take() {
            hook();
        }
        debug!(target: "scheduler", key = %item.key, "task admitted");
        state.waiting.push_back(item);
        state.publish_gauges();
        drop(state);

        self.shared.notify.notify_one();
        Ok(())
    }

    pub fn cancel(&self, key: &K) -> Result<CancelOutcome, SchedulerError> {
        let mut state = self.shared.state.lock();

        if let Some(pos) = state.waiting.iter().position(|w| &w.key == key) {
            if let Some(item) = state.waiting.remove(pos) {
                info!(target: "scheduler", key = %key, "waiting task removed");
                // Under the lock: the key must not be re-admitted before its terminal report.
                if let Some(handler) = item.on_error {
                    handler(TaskError::Cancelled);
                }
            }
            state.publish_gauges();
            return Ok(CancelOutcome::RemovedWaiting);
        }

        if let Some(token) = state.running.get(key) {
            if !token.is_cancelled() {
                info!(target: "scheduler", key = %key, "cancellation requested");
                token.cancel();
            }
            return Ok(CancelOutcome::CancellationRequested);
        }

        Err(SchedulerError::NotFound(key.to_string()))
    }

    /// Keys waiting to start, in admission order.
    pub fn list_waiting(&self) -> Vec<K> {
        self.shared
            .state
            .lock()
            .waiting
            .iter()
            .map(|w| w.key.clone())
            .collect()
    }

    pub fn list_running(&self) -> Vec<K> {
        self.shared.state.lock().running.keys().cloned().collect()
    }

    /// Running keys whose cancellation was requested but which have not unwound yet.
    pub fn list_cancellation_requested(&self) -> Vec<K> {
        self.shared
            .state
            .lock()
            .running
            .iter()
            .filter(|(_, t)| t.is_cancelled())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn contains(&self, key: &K) -> bool {
        let state = self.shared.state.lock();
        state.running.contains_key(key) || state.waiting.iter().any(|w| &w.key == key)
    }

    /// Stop accepting work, drop waiting items (reporting them cancelled) and cancel
    /// everything running. Workers exit once their current item unwinds.
    pub fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();

        let mut state = self.shared.state.lock();
        let drained: Vec<WorkItem<K, T>> = state.waiting.drain(..).collect();
        for item in drained {
            if let Some(handler) = item.on_error {
                handler(TaskError::Cancelled);
            }
        }
        state.publish_gauges();
        info!(target: "scheduler", running = state.running.len(), "task scheduler shutting down");
    }

    /// Wait for all workers to exit. Call after [`TaskScheduler::shutdown`].
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.workers.lock());
        for h in handles {
            if let Err(e) = h.await {
                error!(target: "scheduler", error = %e, "worker exited abnormally");
            }
        }
    }
}

async fn worker_loop<K, T>(shared: Arc<Shared<K, T>>, worker: usize)
where
    K: Eq + Hash + Clone + Display + Send + 'static,
    T: Send + 'static,
{
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        let next = {
            let mut state = shared.state.lock();
            let next = state.waiting.pop_front().map(|item| {
                let token = shared.shutdown.child_token();
                state.running.insert(item.key.clone(), token.clone());
                (item, token)
            });
            if next.is_some() {
                state.publish_gauges();
                if !state.waiting.is_empty() {
                    // Notify holds a single permit; pass the wake-up on.
                    shared.notify.notify_one();
                }
            }
            next
        };

        match next {
            Some((item, token)) => run_item(&shared, worker, item, token).await,
            None => {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = shared.notify.notified() => {}
                }
            }
        }
    }
    debug!(target: "scheduler", worker, "worker stopped");
}

async fn run_item<K, T>(
    shared: &Shared<K, T>,
    worker: usize,
    item: WorkItem<K, T>,
    token: CancellationToken,
) where
    K: Eq + Hash + Clone + Display + Send + 'static,
    T: Send + 'static,
{
    let WorkItem {
        key,
        action,
        on_success,
        on_error,
        ..
    } = item;
    info!(target: "scheduler", key = %key, worker, "task started");

    // Run on its own task so a panic surfaces as a JoinError instead of killing the worker.
    let result = match tokio::spawn(async move { action(token).await }).await {
        Ok(r) => r,
        Err(join_err) => Err(TaskError::Panicked(join_err.to_string())),
    };

    match &result {
        Ok(_) => info!(target: "scheduler", key = %key, "task finished"),
        Err(TaskError::Cancelled) => info!(target: "scheduler", key = %key, "task cancelled"),
        Err(other) => warn!(target: "scheduler", key = %key, error = %other, "task failed"),
    }

    // Report and release in one critical section so a re-enqueue of the key sees either
    // the old run still in progress or its outcome already reported.
    let mut state = shared.state.lock();
    match result {
        Ok(value) => {
            if let Some(handler) = on_success {
                handler(value);
            }
        }
        Err(err) => match on_error {
            Some(handler) => handler(err),
            None => debug!(target: "scheduler", key = %key, "no error handler registered"),
        },
    }
    state.running.remove(&key);
    state.publish_gauges();
}
