use crate::bus::EventBus;
use crate::error::TaskError;
use crate::tasks::store::TaskStore;
use crate::tasks::types::{TaskInfo, TaskOptions, TaskState};
use crate::tasks::worker::{ScheduledTask, ScheduledTaskWorker, WorkerSettings};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Messages from workers and their triggers back to the manager.
#[derive(Debug)]
pub(crate) enum ManagerCommand {
    Queue { key: String, options: TaskOptions },
    Completed { key: String },
}

/// Registry of scheduled task workers and the pending-run queue.
///
/// The queue and the idle check that guards it share one lock. A worker clears
/// its active run before reporting completion, so an entry is either started
/// directly or is visible to the drain that follows the run.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    workers: RwLock<Vec<ScheduledTaskWorker>>,
    queue: Mutex<VecDeque<(String, TaskOptions)>>,
    store: TaskStore,
    bus: EventBus,
    settings: WorkerSettings,
    commands_tx: mpsc::UnboundedSender<ManagerCommand>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<ManagerCommand>>>,
    shutdown: CancellationToken,
}

impl TaskManager {
    pub fn new(store: TaskStore, bus: EventBus, settings: WorkerSettings) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ManagerInner {
                workers: RwLock::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                store,
                bus,
                settings,
                commands_tx,
                commands_rx: Mutex::new(Some(commands_rx)),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    fn is_started(&self) -> bool {
        self.inner.commands_rx.lock().is_none()
    }

    /// Starts the command loop and arms every registered worker's triggers
    /// with the startup flag set. Calling it twice is a no-op.
    pub fn start(&self) {
        let Some(mut commands) = self.inner.commands_rx.lock().take() else {
            warn!("Task manager already started");
            return;
        };

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.inner.shutdown.cancelled() => break,
                    command = commands.recv() => match command {
                        Some(ManagerCommand::Queue { key, options }) => {
                            manager.queue_task(&key, options);
                        }
                        Some(ManagerCommand::Completed { key }) => {
                            debug!("{} finished, draining queue", key);
                            manager.execute_queued_tasks();
                        }
                        None => break,
                    },
                }
            }
        });

        let workers = self.workers();
        for worker in &workers {
            worker.reload_triggers(true);
        }
        info!("Task manager started with {} tasks", workers.len());
    }

    /// Registers workers for `tasks`. Keys are not checked for duplicates:
    /// a second task with a known key gets its own worker, but lookups by key
    /// always resolve to the first one.
    pub fn add_tasks(&self, tasks: Vec<Arc<dyn ScheduledTask>>) {
        let started = self.is_started();
        let added: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                ScheduledTaskWorker::new(
                    task,
                    self.inner.store.clone(),
                    self.inner.bus.clone(),
                    self.inner.commands_tx.clone(),
                    self.inner.settings.clone(),
                )
            })
            .collect();

        if started {
            for worker in &added {
                worker.reload_triggers(true);
            }
        }
        self.inner.workers.write().extend(added);
    }

    pub fn workers(&self) -> Vec<ScheduledTaskWorker> {
        self.inner.workers.read().clone()
    }

    pub fn get_worker(&self, key: &str) -> Option<ScheduledTaskWorker> {
        self.inner
            .workers
            .read()
            .iter()
            .find(|w| w.key() == key)
            .cloned()
    }

    fn require_worker(&self, key: &str) -> Result<ScheduledTaskWorker, TaskError> {
        self.get_worker(key)
            .ok_or_else(|| TaskError::UnknownTask(key.to_string()))
    }

    /// Starts the task now if its worker is idle, otherwise leaves one pending
    /// entry for it. A pending entry for the same key is replaced in place, so
    /// it keeps its position and takes the newest options.
    pub fn queue_task(&self, key: &str, options: TaskOptions) {
        let Some(worker) = self.get_worker(key) else {
            warn!("Unable to queue unknown task {}", key);
            return;
        };

        let mut queue = self.inner.queue.lock();
        if worker.state() == TaskState::Idle {
            match worker.execute(options.clone()) {
                Ok(()) => return,
                Err(e @ TaskError::ShuttingDown(_)) => {
                    debug!("Not queueing: {}", e);
                    return;
                }
                Err(e) => debug!("{}, queueing instead", e),
            }
        }

        if let Some(entry) = queue.iter_mut().find(|(k, _)| k == key) {
            debug!("Replacing queued run of {}", key);
            entry.1 = options;
        } else {
            debug!("Queueing {} behind the active run", key);
            queue.push_back((key.to_string(), options));
        }
    }

    /// Requests cancellation of the active run and queues a fresh one, which
    /// starts once the cancelled run has fully exited.
    pub fn cancel_if_running_and_queue(&self, key: &str, options: TaskOptions) {
        if let Some(worker) = self.get_worker(key) {
            worker.cancel_if_running();
        }
        self.queue_task(key, options);
    }

    pub fn execute(&self, key: &str, options: TaskOptions) -> Result<(), TaskError> {
        self.require_worker(key)?.execute(options)
    }

    pub fn cancel(&self, key: &str) -> Result<(), TaskError> {
        self.require_worker(key)?.cancel()
    }

    pub fn cancel_if_running(&self, key: &str) {
        match self.get_worker(key) {
            Some(worker) => worker.cancel_if_running(),
            None => warn!("Unable to cancel unknown task {}", key),
        }
    }

    /// Drains the pending queue and starts every idle worker found in it.
    /// Entries for workers that are still busy go back on the queue.
    pub(crate) fn execute_queued_tasks(&self) {
        let mut queue = self.inner.queue.lock();
        if queue.is_empty() {
            return;
        }
        let drained = dedup_latest(queue.drain(..));

        for (key, options) in drained {
            let Some(worker) = self.get_worker(&key) else {
                warn!("Dropping queued run of unknown task {}", key);
                continue;
            };
            if worker.state() != TaskState::Idle {
                queue.push_back((key, options));
                continue;
            }
            match worker.execute(options.clone()) {
                Ok(()) => {}
                Err(e @ TaskError::ShuttingDown(_)) => debug!("Dropping queued run: {}", e),
                Err(e) => {
                    warn!("Unable to start queued {}: {}", key, e);
                    queue.push_back((key, options));
                }
            }
        }
    }

    /// Snapshot of the pending queue, in order.
    pub fn pending(&self) -> Vec<(String, TaskOptions)> {
        self.inner.queue.lock().iter().cloned().collect()
    }

    pub fn task_infos(&self) -> Vec<TaskInfo> {
        self.workers().iter().map(|w| w.info()).collect()
    }

    /// Stops the command loop and shuts every worker down, aborting runs
    /// that are still active.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for worker in self.workers() {
            worker.shutdown().await;
        }
        self.inner.queue.lock().clear();
        info!("Task manager stopped");
    }
}

/// Collapses entries by key, keeping first-appearance order and the last
/// options seen for each key.
fn dedup_latest(
    entries: impl IntoIterator<Item = (String, TaskOptions)>,
) -> Vec<(String, TaskOptions)> {
    let mut out: Vec<(String, TaskOptions)> = Vec::new();
    for (key, options) in entries {
        match out.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = options,
            None => out.push((key, options)),
        }
    }
    out
}
