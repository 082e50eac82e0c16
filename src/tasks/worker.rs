//! Per-task execution wrapper.
//!
//! A [`ScheduledTaskWorker`] owns one [`ScheduledTask`], its live triggers and
//! the state of its single active run. State is derived from the run's
//! cancellation token:
//!
//! | token              | state        |
//! |--------------------|--------------|
//! | none               | `Idle`       |
//! | held, not signalled | `Running`    |
//! | held, signalled    | `Cancelling` |
//!
//! Every run ends with a persisted [`TaskResult`], a `Completed` event on the
//! bus and a completion message to the manager.

use crate::bus::{EventBus, TaskEvent};
use crate::error::TaskError;
use crate::tasks::manager::ManagerCommand;
use crate::tasks::store::TaskStore;
use crate::tasks::triggers::{Trigger, TriggerFired, TriggerTimer};
use crate::tasks::types::{
    TaskCompletionStatus, TaskInfo, TaskOptions, TaskResult, TaskState, TaskTriggerInfo,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A unit of schedulable work.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    /// Stable identity of the task type. The worker id is derived from it.
    fn key(&self) -> &str;
    fn name(&self) -> &str;
    fn category(&self) -> &str;
    fn description(&self) -> &str;
    fn default_triggers(&self) -> Vec<TaskTriggerInfo>;

    fn is_hidden(&self) -> bool {
        false
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn is_logged(&self) -> bool {
        true
    }

    /// Runs the task. Implementations should check `cancel` between units of
    /// work and return [`TaskError::Cancelled`] once they observe it.
    async fn execute(&self, progress: ProgressSink, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Push channel for run progress, in percent.
#[derive(Clone)]
pub struct ProgressSink {
    report: Arc<dyn Fn(f64) + Send + Sync>,
}

impl ProgressSink {
    pub fn new(report: impl Fn(f64) + Send + Sync + 'static) -> Self {
        Self {
            report: Arc::new(report),
        }
    }

    /// Values outside 0..=100 are clamped; NaN is dropped.
    pub fn report(&self, percent: f64) {
        if percent.is_nan() {
            return;
        }
        (self.report)(percent.clamp(0.0, 100.0));
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Pause between a trigger firing and the trigger being re-armed.
    pub trigger_settle: Duration,
    /// How long shutdown waits for an in-flight run to exit.
    pub dispose_wait: Duration,
    pub startup_delay: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            trigger_settle: Duration::from_secs(1),
            dispose_wait: Duration::from_secs(2),
            startup_delay: Duration::from_secs(3),
        }
    }
}

/// Stable worker id: name-based UUID of the task key, so history files
/// survive restarts.
pub fn worker_id(key: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
        .simple()
        .to_string()
}

#[derive(Clone)]
pub struct ScheduledTaskWorker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    task: Arc<dyn ScheduledTask>,
    id: String,
    store: TaskStore,
    bus: EventBus,
    commands: mpsc::UnboundedSender<ManagerCommand>,
    settings: WorkerSettings,
    run: Mutex<RunState>,
    last_result: Mutex<LastResult>,
    triggers: Mutex<Vec<Arc<TriggerTimer>>>,
    fired_tx: mpsc::UnboundedSender<TriggerFired>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct RunState {
    active: Option<ActiveRun>,
    next_run_id: u64,
}

struct ActiveRun {
    run_id: u64,
    token: CancellationToken,
    started_at: DateTime<Utc>,
    progress: Option<f64>,
    handle: Option<JoinHandle<()>>,
    max_runtime: Option<JoinHandle<()>>,
    /// Set by shutdown, which then owns recording the result.
    tearing_down: bool,
}

enum LastResult {
    NotLoaded,
    Loaded(Option<TaskResult>),
}

impl ScheduledTaskWorker {
    pub(crate) fn new(
        task: Arc<dyn ScheduledTask>,
        store: TaskStore,
        bus: EventBus,
        commands: mpsc::UnboundedSender<ManagerCommand>,
        settings: WorkerSettings,
    ) -> Self {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let worker = Self {
            inner: Arc::new(WorkerInner {
                id: worker_id(task.key()),
                task,
                store,
                bus,
                commands,
                settings,
                run: Mutex::new(RunState::default()),
                last_result: Mutex::new(LastResult::NotLoaded),
                triggers: Mutex::new(Vec::new()),
                fired_tx,
                shutdown: CancellationToken::new(),
            }),
        };
        tokio::spawn(worker.clone().listen_for_triggers(fired_rx));
        worker
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn key(&self) -> &str {
        self.inner.task.key()
    }

    pub fn name(&self) -> &str {
        self.inner.task.name()
    }

    pub fn task(&self) -> &Arc<dyn ScheduledTask> {
        &self.inner.task
    }

    pub fn state(&self) -> TaskState {
        match &self.inner.run.lock().active {
            None => TaskState::Idle,
            Some(run) if run.token.is_cancelled() => TaskState::Cancelling,
            Some(_) => TaskState::Running,
        }
    }

    pub fn current_progress(&self) -> Option<f64> {
        self.inner.run.lock().active.as_ref().and_then(|r| r.progress)
    }

    /// Last run result; read from the store on first access and cached.
    pub fn last_result(&self) -> Option<TaskResult> {
        let mut cached = self.inner.last_result.lock();
        match &*cached {
            LastResult::Loaded(result) => result.clone(),
            LastResult::NotLoaded => {
                let result = self.inner.store.load_result(&self.inner.id);
                *cached = LastResult::Loaded(result.clone());
                result
            }
        }
    }

    pub fn info(&self) -> TaskInfo {
        let task = &self.inner.task;
        TaskInfo {
            id: self.inner.id.clone(),
            key: task.key().to_string(),
            name: task.name().to_string(),
            category: task.category().to_string(),
            description: task.description().to_string(),
            state: self.state(),
            current_progress: self.current_progress(),
            last_execution_result: self.last_result(),
            triggers: self.triggers(),
            is_hidden: task.is_hidden(),
        }
    }

    /// Starts a run. Fails if one is already active or the worker is
    /// shutting down.
    pub fn execute(&self, options: TaskOptions) -> Result<(), TaskError> {
        let mut run = self.inner.run.lock();
        if self.inner.shutdown.is_cancelled() {
            return Err(TaskError::ShuttingDown(self.name().to_string()));
        }
        if run.active.is_some() {
            return Err(TaskError::AlreadyRunning(self.name().to_string()));
        }

        let token = CancellationToken::new();
        let max_runtime = options.max_runtime().map(|limit| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                debug!("max runtime of {:?} reached, cancelling", limit);
                token.cancel();
            })
        });

        run.next_run_id += 1;
        let run_id = run.next_run_id;
        let started_at = Utc::now();

        if self.inner.task.is_logged() {
            info!("Executing {}", self.name());
        }
        self.inner.bus.publish(TaskEvent::Executing {
            key: self.key().to_string(),
            name: self.name().to_string(),
        });

        // The completion path takes this lock, so the run cannot finish
        // before it is recorded as active.
        let handle = tokio::spawn(self.clone().run_task(run_id, started_at, token.clone()));
        run.active = Some(ActiveRun {
            run_id,
            token,
            started_at,
            progress: None,
            handle: Some(handle),
            max_runtime,
            tearing_down: false,
        });
        Ok(())
    }

    /// Signals cancellation of the active run. Errors if idle.
    pub fn cancel(&self) -> Result<(), TaskError> {
        match &self.inner.run.lock().active {
            Some(run) => {
                info!("Cancelling {}", self.name());
                run.token.cancel();
                Ok(())
            }
            None => Err(TaskError::NotRunning(self.name().to_string())),
        }
    }

    pub fn cancel_if_running(&self) {
        if let Some(run) = &self.inner.run.lock().active {
            info!("Cancelling {}", self.name());
            run.token.cancel();
        }
    }

    async fn run_task(self, run_id: u64, started_at: DateTime<Utc>, token: CancellationToken) {
        let progress = {
            let worker = self.clone();
            ProgressSink::new(move |percent| worker.on_progress(run_id, percent))
        };
        let task = Arc::clone(&self.inner.task);
        let body_token = token.clone();
        let outcome = tokio::spawn(async move { task.execute(progress, body_token).await }).await;

        let (status, error) = classify_outcome(outcome, &token);
        if let Some((message, _)) = &error {
            error!("Error executing {}: {}", self.name(), message);
        }
        self.on_task_completed(run_id, started_at, Utc::now(), status, error);
    }

    fn on_progress(&self, run_id: u64, percent: f64) {
        {
            let mut run = self.inner.run.lock();
            match run.active.as_mut() {
                Some(active) if active.run_id == run_id => active.progress = Some(percent),
                _ => return,
            }
        }
        self.inner.bus.publish(TaskEvent::Progress {
            key: self.key().to_string(),
            percent,
        });
    }

    fn on_task_completed(
        &self,
        run_id: u64,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        status: TaskCompletionStatus,
        error: Option<(String, String)>,
    ) {
        let result = {
            let mut run = self.inner.run.lock();
            match &run.active {
                Some(active) if active.run_id == run_id && !active.tearing_down => {}
                // Shutdown records this run as aborted.
                _ => return,
            }
            if let Some(active) = run.active.take() {
                if let Some(timer) = active.max_runtime {
                    timer.abort();
                }
            }
            let result = self.build_result(started_at, ended_at, status, error);
            self.persist_result(&result);
            result
        };

        if self.inner.task.is_logged() {
            info!(
                "{} {:?} after {}ms",
                self.name(),
                result.status,
                result.duration().num_milliseconds()
            );
        }
        self.inner.bus.publish(TaskEvent::Completed(result));
        let _ = self.inner.commands.send(ManagerCommand::Completed {
            key: self.key().to_string(),
        });
    }

    fn build_result(
        &self,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        status: TaskCompletionStatus,
        error: Option<(String, String)>,
    ) -> TaskResult {
        let (error_message, long_error_message) = match error {
            Some((message, detail)) => (Some(message), Some(detail)),
            None => (None, None),
        };
        TaskResult {
            id: self.inner.id.clone(),
            key: self.key().to_string(),
            name: self.name().to_string(),
            start_time_utc: started_at,
            end_time_utc: ended_at,
            status,
            error_message,
            long_error_message,
        }
    }

    fn persist_result(&self, result: &TaskResult) {
        if let Err(e) = self.inner.store.save_result(&self.inner.id, result) {
            error!("Failed to save result for {}: {:#}", self.name(), e);
        }
        *self.inner.last_result.lock() = LastResult::Loaded(Some(result.clone()));
    }

    pub fn triggers(&self) -> Vec<TaskTriggerInfo> {
        self.inner
            .triggers
            .lock()
            .iter()
            .map(|t| t.trigger().info())
            .collect()
    }

    /// Armed fire time of each live trigger, in registration order.
    pub fn next_fires(&self) -> Vec<Option<DateTime<Utc>>> {
        self.inner
            .triggers
            .lock()
            .iter()
            .map(|t| t.next_fire())
            .collect()
    }

    /// Replaces the trigger set. Every descriptor is validated before anything
    /// changes; on success the old triggers are stopped, the new set is
    /// persisted and started.
    pub fn set_triggers(&self, infos: Vec<TaskTriggerInfo>) -> Result<(), TaskError> {
        let triggers = infos
            .iter()
            .map(Trigger::from_info)
            .collect::<Result<Vec<_>, _>>()?;

        let mut current = self.inner.triggers.lock();
        for timer in current.drain(..) {
            timer.stop();
        }
        if let Err(e) = self.inner.store.save_triggers(&self.inner.id, &infos) {
            error!("Failed to save triggers for {}: {:#}", self.name(), e);
        }
        *current = triggers.into_iter().map(TriggerTimer::new).collect();
        self.start_timers(&current, false);
        Ok(())
    }

    /// Stops the live triggers and rebuilds them from the store, falling back
    /// to the task defaults. Descriptors that fail validation are skipped.
    pub fn reload_triggers(&self, is_startup: bool) {
        let infos = self
            .inner
            .store
            .load_triggers(&self.inner.id)
            .unwrap_or_else(|| self.inner.task.default_triggers());

        let mut timers = Vec::with_capacity(infos.len());
        for info in &infos {
            match Trigger::from_info(info) {
                Ok(trigger) => timers.push(TriggerTimer::new(trigger)),
                Err(e) => warn!("Skipping trigger for {}: {}", self.name(), e),
            }
        }

        let mut current = self.inner.triggers.lock();
        for timer in current.drain(..) {
            timer.stop();
        }
        *current = timers;
        self.start_timers(&current, is_startup);
    }

    fn start_timers(&self, timers: &[Arc<TriggerTimer>], is_startup: bool) {
        if !self.inner.task.is_enabled() {
            debug!("{} is disabled, triggers not started", self.name());
            return;
        }
        let last_result = self.last_result();
        for timer in timers {
            timer.start(
                last_result.as_ref(),
                self.name(),
                is_startup,
                self.inner.settings.startup_delay,
                self.inner.fired_tx.clone(),
            );
        }
    }

    pub fn stop_triggers(&self) {
        for timer in self.inner.triggers.lock().iter() {
            timer.stop();
        }
    }

    async fn listen_for_triggers(self, mut fired_rx: mpsc::UnboundedReceiver<TriggerFired>) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                fired = fired_rx.recv() => match fired {
                    Some(fired) => {
                        tokio::spawn(self.clone().on_trigger_fired(fired.timer));
                    }
                    None => break,
                },
            }
        }
    }

    async fn on_trigger_fired(self, timer: Arc<TriggerTimer>) {
        info!("{} trigger fired for {}", timer.trigger(), self.name());
        let _ = self.inner.commands.send(ManagerCommand::Queue {
            key: self.key().to_string(),
            options: timer.trigger().options(),
        });

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.inner.settings.trigger_settle) => {}
        }

        let still_registered = self
            .inner
            .triggers
            .lock()
            .iter()
            .any(|t| Arc::ptr_eq(t, &timer));
        if still_registered && self.inner.task.is_enabled() {
            timer.start(
                self.last_result().as_ref(),
                self.name(),
                false,
                self.inner.settings.startup_delay,
                self.inner.fired_tx.clone(),
            );
        }
    }

    /// Stops triggers and tears down an in-flight run. The run is cancelled
    /// and given `dispose_wait` to exit; either way it is recorded as aborted.
    /// The worker reports Cancelling until then.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.stop_triggers();

        let teardown = {
            let mut run = self.inner.run.lock();
            run.active.as_mut().map(|active| {
                active.tearing_down = true;
                active.token.cancel();
                if let Some(timer) = active.max_runtime.take() {
                    timer.abort();
                }
                (active.run_id, active.started_at, active.handle.take())
            })
        };
        let Some((run_id, started_at, handle)) = teardown else {
            return;
        };

        info!("Stopping {} while running", self.name());
        if let Some(handle) = handle {
            if tokio::time::timeout(self.inner.settings.dispose_wait, handle)
                .await
                .is_err()
            {
                warn!("{} did not exit within {:?}", self.name(), self.inner.settings.dispose_wait);
            }
        }

        let result = {
            let mut run = self.inner.run.lock();
            if !matches!(&run.active, Some(active) if active.run_id == run_id) {
                return;
            }
            run.active = None;
            let result = self.build_result(
                started_at,
                Utc::now(),
                TaskCompletionStatus::Aborted,
                None,
            );
            self.persist_result(&result);
            result
        };
        self.inner.bus.publish(TaskEvent::Completed(result));
    }
}

fn classify_outcome(
    outcome: Result<anyhow::Result<()>, JoinError>,
    token: &CancellationToken,
) -> (TaskCompletionStatus, Option<(String, String)>) {
    match outcome {
        Ok(Ok(())) => (TaskCompletionStatus::Completed, None),
        Ok(Err(e)) => {
            let cooperative = matches!(e.downcast_ref::<TaskError>(), Some(TaskError::Cancelled));
            if cooperative || token.is_cancelled() {
                (TaskCompletionStatus::Cancelled, None)
            } else {
                (
                    TaskCompletionStatus::Failed,
                    Some((e.to_string(), format!("{e:?}"))),
                )
            }
        }
        Err(e) if e.is_panic() => (
            TaskCompletionStatus::Failed,
            Some(("task panicked".to_string(), e.to_string())),
        ),
        Err(_) => (TaskCompletionStatus::Aborted, None),
    }
}
