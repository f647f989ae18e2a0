//! Asynchronous status polling for tasks running on agents.
//!
//! The [`StatusPoller`] keeps a table of [`TrackedTask`]s. On every tick it
//! queries the [`StatusSource`] for each task that is still pending or
//! processing, concurrently, and turns the answers into lifecycle events on
//! the [`EventBus`]. A task whose status checks keep failing is forced to
//! `failed` once `max_retries` consecutive checks have errored. Every terminal
//! transition is reported back to the source exactly once. Terminal tasks
//! stay queryable for a grace period and are then dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_agents::AgentRegistry;
use conductor_core::{
    ConductorError, ConductorResult, Event, EventBus, StatusReport, TaskStatus,
};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `[poller]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Delay between the end of one tick and the start of the next.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Consecutive failed checks after which a task is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// How long a terminal task stays queryable.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

fn default_interval_ms() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    3
}

fn default_grace_period_ms() -> u64 {
    5000
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_retries: default_max_retries(),
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

/// A task the poller is watching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedTask {
    /// Id of the task on the executing agent.
    pub task_id: Uuid,
    /// Agent executing the task.
    pub agent: String,
    /// Last known status.
    pub status: TaskStatus,
    /// Last reported progress in `0.0..=1.0`.
    pub progress: Option<f32>,
    /// Result reported with completion.
    pub result: Option<serde_json::Value>,
    /// Last reported or check error.
    pub error: Option<String>,
    /// Consecutive failed status checks.
    pub retries: u32,
    /// Session whose subscribers receive this task's events.
    pub session_id: Option<Uuid>,
    /// When the task was handed to the agent.
    pub started_at: DateTime<Utc>,
    /// Time of the last status or progress change.
    pub updated_at: DateTime<Utc>,
}

impl TrackedTask {
    /// Pending task on `agent`, started now.
    pub fn new(task_id: Uuid, agent: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            agent: agent.into(),
            status: TaskStatus::Pending,
            progress: None,
            result: None,
            error: None,
            retries: 0,
            session_id: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Time since the task was handed to the agent.
    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    /// Set the initial status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Route events to one session.
    pub fn with_session(mut self, session_id: Option<Uuid>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Backdate the start, e.g. to when the task was dispatched.
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }
}

/// Where task status comes from.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Current status of `task` as its agent sees it.
    async fn check(&self, task: &TrackedTask) -> ConductorResult<StatusReport>;

    /// Called once when `task` becomes completed or failed, including tasks
    /// forced to failed after too many failed checks.
    fn finished(&self, _task: &TrackedTask) {}
}

/// Asks the agent executing the task, and folds finished tasks into the
/// agent's metrics.
pub struct AgentStatusSource {
    registry: Arc<AgentRegistry>,
}

impl AgentStatusSource {
    /// Source backed by the agents of `registry`.
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl StatusSource for AgentStatusSource {
    async fn check(&self, task: &TrackedTask) -> ConductorResult<StatusReport> {
        let handle = self
            .registry
            .handle(&task.agent)
            .ok_or_else(|| ConductorError::AgentNotFound(task.agent.clone()))?;
        handle.task_status(task.task_id).await
    }

    fn finished(&self, task: &TrackedTask) {
        self.registry.record_outcome(
            &task.agent,
            task.status == TaskStatus::Completed,
            task.elapsed(),
        );
    }
}

/// Poller counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollMetrics {
    /// Completed ticks.
    pub cycles: u64,
    /// Running mean tick duration.
    pub avg_cycle_ms: f64,
    /// Failed status checks across all cycles.
    pub errors: u64,
    /// End of the last tick.
    pub last_cycle_at: Option<DateTime<Utc>>,
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Polls in-flight tasks and publishes their lifecycle events.
pub struct StatusPoller {
    config: PollerConfig,
    source: Arc<dyn StatusSource>,
    events: Arc<EventBus>,
    tasks: Arc<RwLock<HashMap<Uuid, TrackedTask>>>,
    metrics: parking_lot::Mutex<PollMetrics>,
    running: parking_lot::Mutex<Option<RunningLoop>>,
}

impl StatusPoller {
    /// Idle poller; call [`start`](Self::start) to begin ticking.
    pub fn new(config: PollerConfig, source: Arc<dyn StatusSource>, events: Arc<EventBus>) -> Self {
        Self {
            config,
            source,
            events,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            metrics: parking_lot::Mutex::new(PollMetrics::default()),
            running: parking_lot::Mutex::new(None),
        }
    }

    /// Settings in use.
    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Track a task, replacing any entry with the same id.
    pub async fn add_task(&self, task: TrackedTask) {
        debug!(task_id = %task.task_id, agent = %task.agent, "Tracking task");
        self.tasks.write().await.insert(task.task_id, task);
    }

    /// Stop tracking a task.
    pub async fn remove_task(&self, task_id: Uuid) -> Option<TrackedTask> {
        self.tasks.write().await.remove(&task_id)
    }

    /// Copy of one tracked task.
    pub async fn get(&self, task_id: Uuid) -> Option<TrackedTask> {
        self.tasks.read().await.get(&task_id).cloned()
    }

    /// Copy of every tracked task.
    pub async fn list(&self) -> Vec<TrackedTask> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// Number of tracked tasks, terminal ones in their grace period included.
    pub async fn tracked_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> PollMetrics {
        self.metrics.lock().clone()
    }

    /// Run one polling tick over every pending or processing task.
    pub async fn poll_once(&self) {
        let started = Instant::now();

        let due: Vec<TrackedTask> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status.is_in_flight())
            .cloned()
            .collect();

        let checks = join_all(due.iter().map(|t| self.source.check(t))).await;

        let mut events = Vec::new();
        let mut finished = Vec::new();
        let mut errors = 0u64;
        {
            let mut tasks = self.tasks.write().await;
            for (checked, result) in due.iter().zip(checks) {
                // Removed or finished while the check was running.
                let Some(task) = tasks.get_mut(&checked.task_id) else {
                    continue;
                };
                if !task.status.is_in_flight() {
                    continue;
                }
                match result {
                    Ok(report) => {
                        task.retries = 0;
                        apply_report(task, report, &mut events);
                    }
                    Err(e) => {
                        errors += 1;
                        task.retries += 1;
                        task.error = Some(e.to_string());
                        warn!(
                            task_id = %task.task_id,
                            agent = %task.agent,
                            retries = task.retries,
                            error = %e,
                            "Status check failed"
                        );
                        if task.retries >= self.config.max_retries {
                            let previous = task.status;
                            task.status = TaskStatus::Failed;
                            task.updated_at = Utc::now();
                            events.push(Event::TaskUpdated {
                                task_id: task.task_id,
                                status: TaskStatus::Failed,
                                previous,
                                progress: task.progress,
                            });
                            events.push(Event::TaskFailed {
                                task_id: task.task_id,
                                error: e.to_string(),
                                retries: task.retries,
                            });
                        }
                    }
                }
                if task.status.is_terminal() {
                    finished.push(task.clone());
                }
            }
        }

        for event in events {
            self.events.publish(event);
        }
        for task in finished {
            self.source.finished(&task);
            self.schedule_removal(task.task_id);
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut metrics = self.metrics.lock();
        metrics.cycles += 1;
        let avg = metrics.avg_cycle_ms;
        metrics.avg_cycle_ms = avg + (elapsed_ms - avg) / metrics.cycles as f64;
        metrics.errors += errors;
        metrics.last_cycle_at = Some(Utc::now());
    }

    fn schedule_removal(&self, task_id: Uuid) {
        let tasks = Arc::clone(&self.tasks);
        let grace = Duration::from_millis(self.config.grace_period_ms);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut tasks = tasks.write().await;
            if tasks.get(&task_id).is_some_and(|t| t.status.is_terminal()) {
                tasks.remove(&task_id);
                debug!(%task_id, "Dropped finished task");
            }
        });
    }

    /// Start the polling loop. Returns false if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.cancel.is_cancelled()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let poller = Arc::clone(self);
        let interval = Duration::from_millis(self.config.interval_ms);
        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Status poller started");
            while !token.is_cancelled() {
                poller.poll_once().await;
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("Status poller stopped");
        });

        *running = Some(RunningLoop { cancel, handle });
        true
    }

    /// Stop the loop and wait for the current tick to finish.
    pub async fn stop(&self) -> bool {
        let running = self.running.lock().take();
        match running {
            Some(RunningLoop { cancel, handle }) => {
                cancel.cancel();
                if let Err(e) = handle.await {
                    warn!(error = %e, "Status poller task ended abnormally");
                }
                true
            }
            None => false,
        }
    }

    /// True while the loop is running.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.cancel.is_cancelled())
    }
}

fn apply_report(task: &mut TrackedTask, report: StatusReport, events: &mut Vec<Event>) {
    // A task being analyzed on the agent side is still running from our point of view.
    let status = match report.status {
        TaskStatus::Analyzing => TaskStatus::Processing,
        other => other,
    };
    let previous = task.status;
    let progress_changed = report.progress.is_some() && report.progress != task.progress;

    if report.progress.is_some() {
        task.progress = report.progress;
    }
    if report.result.is_some() {
        task.result = report.result;
    }
    if report.error.is_some() {
        task.error = report.error;
    }

    if status != previous {
        task.status = status;
        task.updated_at = Utc::now();
        events.push(Event::TaskUpdated {
            task_id: task.task_id,
            status,
            previous,
            progress: task.progress,
        });
        match status {
            TaskStatus::Completed => events.push(Event::TaskCompleted {
                task_id: task.task_id,
                result: task.result.clone(),
            }),
            TaskStatus::Failed => events.push(Event::TaskFailed {
                task_id: task.task_id,
                error: task
                    .error
                    .clone()
                    .unwrap_or_else(|| "task failed".to_string()),
                retries: task.retries,
            }),
            _ => {}
        }
    } else if progress_changed {
        task.updated_at = Utc::now();
        events.push(Event::TaskProgress {
            task_id: task.task_id,
            progress: task.progress,
            message: status.to_string(),
        });
    }
}
