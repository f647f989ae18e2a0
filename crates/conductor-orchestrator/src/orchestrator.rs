use crate::provider::{GenerationProvider, GenerationRequest};
use crate::retry::{with_retry, RetryPolicy};
use crate::workers::{SelectionStrategy, WorkerClaim, WorkerPool};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_agents::{AgentRegistry, RegistrySnapshot};
use conductor_core::{
    ConductorError, ConductorResult, Decomposition, Event, EventBus, ExecutionPlan, Subtask,
    SubtaskResult, Task, TaskStatus,
};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DECOMPOSE_INSTRUCTIONS: &str = "You split a compound task into subtasks. \
Give every subtask a short unique id, a type, a description, the ids it depends on and the \
capabilities it needs. Put subtasks without dependencies in executionPlan.parallelizable and \
the rest in executionPlan.sequential, ordered so that every dependency comes first.";

const AGGREGATE_INSTRUCTIONS: &str = "You combine the results of the subtasks of a compound \
task into one answer for the original request. Mention failed subtasks.";

/// Poll interval while waiting on an agent that accepted a subtask asynchronously.
const SUBTASK_POLL_INTERVAL: Duration = Duration::from_millis(250);
const SUBTASK_POLL_LIMIT: u32 = 240;

/// `[orchestrator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How a worker is picked among eligible ones.
    #[serde(default)]
    pub strategy: SelectionStrategy,
    /// Claim attempts before a subtask fails with `NoWorkerAvailable`.
    #[serde(default = "default_worker_wait_attempts")]
    pub worker_wait_attempts: u32,
    /// Delay between claim attempts.
    #[serde(default = "default_worker_wait_backoff_ms")]
    pub worker_wait_backoff_ms: u64,
    /// Subtasks one worker may hold at once.
    #[serde(default = "default_max_concurrent_per_worker")]
    pub max_concurrent_per_worker: u32,
    /// Retry policy for decomposition and aggregation calls.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_worker_wait_attempts() -> u32 {
    10
}

fn default_worker_wait_backoff_ms() -> u64 {
    500
}

fn default_max_concurrent_per_worker() -> u32 {
    3
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            worker_wait_attempts: default_worker_wait_attempts(),
            worker_wait_backoff_ms: default_worker_wait_backoff_ms(),
            max_concurrent_per_worker: default_max_concurrent_per_worker(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Runs one subtask on a claimed worker.
#[async_trait]
pub trait SubtaskExecutor: Send + Sync {
    /// `inputs` holds the outputs of the subtask's dependencies, by subtask id.
    async fn execute(
        &self,
        worker_id: &str,
        parent: &Task,
        subtask: &Subtask,
        inputs: &HashMap<String, serde_json::Value>,
    ) -> ConductorResult<serde_json::Value>;
}

/// Executes subtasks on the registered agent whose name is the worker id.
pub struct AgentExecutor {
    registry: Arc<AgentRegistry>,
}

impl AgentExecutor {
    /// Executor dispatching through `registry`.
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    fn child_task(
        worker_id: &str,
        parent: &Task,
        subtask: &Subtask,
        inputs: &HashMap<String, serde_json::Value>,
    ) -> Task {
        let mut child = Task::new(&subtask.description)
            .with_target(worker_id)
            .with_capabilities(subtask.required_capabilities.iter().cloned());
        child.session_id = parent.session_id;
        child
            .metadata
            .insert("parentTaskId".into(), serde_json::json!(parent.id));
        child
            .metadata
            .insert("subtaskId".into(), serde_json::json!(subtask.id));
        child
            .metadata
            .insert("subtaskType".into(), serde_json::json!(subtask.subtask_type));
        if !inputs.is_empty() {
            child
                .metadata
                .insert("dependencyResults".into(), serde_json::json!(inputs));
        }
        child
    }
}

#[async_trait]
impl SubtaskExecutor for AgentExecutor {
    async fn execute(
        &self,
        worker_id: &str,
        parent: &Task,
        subtask: &Subtask,
        inputs: &HashMap<String, serde_json::Value>,
    ) -> ConductorResult<serde_json::Value> {
        let handle = self
            .registry
            .handle(worker_id)
            .ok_or_else(|| ConductorError::AgentNotFound(worker_id.to_string()))?;
        let child = Self::child_task(worker_id, parent, subtask, inputs);

        self.registry.task_started(worker_id);
        let started = Instant::now();
        let result: ConductorResult<serde_json::Value> = async {
            let response = handle.process(&child).await?;
            if !response.status.is_in_flight() {
                return if response.success {
                    Ok(response.output)
                } else {
                    Err(ConductorError::Agent(
                        response.error.unwrap_or_else(|| "subtask failed".into()),
                    ))
                };
            }
            // Accepted for later completion: wait on the agent's own status.
            for _ in 0..SUBTASK_POLL_LIMIT {
                tokio::time::sleep(SUBTASK_POLL_INTERVAL).await;
                let report = handle.task_status(child.id).await?;
                match report.status {
                    TaskStatus::Completed => {
                        return Ok(report.result.unwrap_or(serde_json::Value::Null))
                    }
                    TaskStatus::Failed => {
                        return Err(ConductorError::Agent(
                            report.error.unwrap_or_else(|| "subtask failed".into()),
                        ))
                    }
                    _ => {}
                }
            }
            Err(ConductorError::Agent(format!(
                "subtask '{}' did not finish on {worker_id}",
                subtask.id
            )))
        }
        .await;
        self.registry
            .record_outcome(worker_id, result.is_ok(), started.elapsed());
        result
    }
}

/// Stage a compound task is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationPhase {
    /// Waiting on the provider for a plan.
    Decomposing,
    /// Running subtasks.
    Executing,
    /// Merging subtask outputs.
    Aggregating,
}

/// Live tracking record of one compound task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationState {
    /// Parent task id.
    pub task_id: Uuid,
    /// Overall status.
    pub status: TaskStatus,
    /// Current stage.
    pub phase: OrchestrationPhase,
    /// Subtasks in the plan; zero until decomposed.
    pub subtask_count: usize,
    /// Subtasks that have finished, successfully or not.
    pub completed_subtasks: usize,
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// Metadata copied from the parent task.
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CancelOutcome {
    /// Tracking was dropped.
    Cancelled,
    /// Nothing was tracked under that id.
    NotFound,
}

/// Result of a full decompose → coordinate → aggregate run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationOutcome {
    /// Parent task id.
    pub task_id: Uuid,
    /// True when every subtask succeeded.
    pub success: bool,
    /// Aggregated output.
    pub output: serde_json::Value,
    /// Per-subtask results in plan order.
    pub subtasks: Vec<SubtaskResult>,
    /// Wall time of the whole run.
    pub duration_ms: u64,
}

/// Orchestration counters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorMetrics {
    /// Runs begun.
    pub runs_started: u64,
    /// Runs that produced an outcome.
    pub runs_completed: u64,
    /// Runs that returned an error, including cancelled ones.
    pub runs_failed: u64,
    /// Subtasks that returned output.
    pub subtasks_succeeded: u64,
    /// Subtasks that failed or found no worker.
    pub subtasks_failed: u64,
    /// Runs currently tracked.
    pub active: usize,
}

#[derive(Default)]
struct Counters {
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    subtasks_succeeded: AtomicU64,
    subtasks_failed: AtomicU64,
}

/// Decomposes compound tasks and drives their subtasks across the worker pool.
pub struct TaskOrchestrator {
    provider: Arc<dyn GenerationProvider>,
    executor: Arc<dyn SubtaskExecutor>,
    pool: Arc<WorkerPool>,
    events: Arc<EventBus>,
    config: OrchestratorConfig,
    active: RwLock<HashMap<Uuid, OrchestrationState>>,
    cancelled: RwLock<HashSet<Uuid>>,
    counters: Counters,
}

impl TaskOrchestrator {
    /// Orchestrator with an empty worker pool built from `config.strategy`.
    pub fn new(
        config: OrchestratorConfig,
        provider: Arc<dyn GenerationProvider>,
        executor: Arc<dyn SubtaskExecutor>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            provider,
            executor,
            pool: Arc::new(WorkerPool::new(config.strategy)),
            events,
            config,
            active: RwLock::new(HashMap::new()),
            cancelled: RwLock::new(HashSet::new()),
            counters: Counters::default(),
        }
    }

    /// The worker pool.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Refresh the worker pool from the registry.
    pub fn sync_workers(&self, snapshot: &RegistrySnapshot) {
        self.pool
            .sync_from_snapshot(snapshot, self.config.max_concurrent_per_worker);
    }

    /// Ask the provider to split `task` into subtasks and a valid plan.
    pub async fn decompose(&self, task: &Task) -> ConductorResult<Decomposition> {
        let mut prompt = format!("Task: {}", task.message);
        if !task.required_capabilities.is_empty() {
            prompt.push_str(&format!(
                "\nRequired capabilities: {}",
                task.required_capabilities.join(", ")
            ));
        }
        let mut capabilities: Vec<String> = self
            .pool
            .workers()
            .into_iter()
            .filter(|w| w.available)
            .flat_map(|w| w.capabilities)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        capabilities.sort();
        if !capabilities.is_empty() {
            prompt.push_str(&format!(
                "\nAvailable capabilities: {}",
                capabilities.join(", ")
            ));
        }
        let request =
            GenerationRequest::new(DECOMPOSE_INSTRUCTIONS, prompt).with_schema(decomposition_schema());

        let result: ConductorResult<Decomposition> = async {
            let value = with_retry(&self.config.retry, "decompose", || {
                self.provider.generate(&request)
            })
            .await?;
            let decomposition: Decomposition = serde_json::from_value(value)?;
            if decomposition.subtasks.is_empty() {
                return Err(ConductorError::InvalidPlan(
                    "decomposition has no subtasks".into(),
                ));
            }
            decomposition
                .execution_plan
                .validate(&decomposition.subtasks)?;
            Ok(decomposition)
        }
        .await;

        match result {
            Ok(decomposition) => {
                info!(
                    task_id = %task.id,
                    subtasks = decomposition.subtasks.len(),
                    parallel = decomposition.execution_plan.parallelizable.len(),
                    "Decomposition complete"
                );
                Ok(decomposition)
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Decomposition failed");
                Err(ConductorError::DecompositionFailed(Box::new(e)))
            }
        }
    }

    /// Execute `subtasks` following `plan`: the parallel phase concurrently,
    /// then the sequential phase in order. A sequential subtask whose
    /// dependencies have not all succeeded fails the run before dispatch.
    pub async fn coordinate(
        &self,
        task: &Task,
        subtasks: &[Subtask],
        plan: &ExecutionPlan,
    ) -> ConductorResult<Vec<SubtaskResult>> {
        plan.check_known(subtasks)?;
        let by_id: HashMap<&str, &Subtask> =
            subtasks.iter().map(|s| (s.id.as_str(), s)).collect();
        let lookup = |id: &String| {
            by_id
                .get(id.as_str())
                .copied()
                .ok_or_else(|| ConductorError::InvalidPlan(format!("unknown subtask '{id}'")))
        };

        let mut completed: HashSet<String> = HashSet::new();
        let mut outputs: HashMap<String, serde_json::Value> = HashMap::new();
        let mut results = Vec::with_capacity(plan.len());

        let parallel: Vec<&Subtask> = plan
            .parallelizable
            .iter()
            .map(&lookup)
            .collect::<ConductorResult<_>>()?;
        if let Some(blocked) = parallel.iter().find(|s| !s.dependencies.is_empty()) {
            return Err(ConductorError::DependencyNotMet {
                subtask: blocked.id.clone(),
                missing: blocked.dependencies.clone(),
            });
        }

        let no_inputs = HashMap::new();
        let parallel_results =
            join_all(parallel.iter().map(|s| self.dispatch(task, s, &no_inputs))).await;
        for result in parallel_results {
            let result = result?;
            self.record_subtask(task.id, &result, &mut completed, &mut outputs);
            results.push(result);
        }

        for id in &plan.sequential {
            self.ensure_not_cancelled(task.id)?;
            let subtask = lookup(id)?;
            let missing = subtask.missing_dependencies(&completed);
            if !missing.is_empty() {
                warn!(task_id = %task.id, subtask = %subtask.id, ?missing, "Dependencies not met");
                return Err(ConductorError::DependencyNotMet {
                    subtask: subtask.id.clone(),
                    missing,
                });
            }
            let inputs: HashMap<String, serde_json::Value> = subtask
                .dependencies
                .iter()
                .filter_map(|d| outputs.get(d).map(|o| (d.clone(), o.clone())))
                .collect();
            let result = self.dispatch(task, subtask, &inputs).await?;
            self.record_subtask(task.id, &result, &mut completed, &mut outputs);
            results.push(result);
        }

        Ok(results)
    }

    fn record_subtask(
        &self,
        task_id: Uuid,
        result: &SubtaskResult,
        completed: &mut HashSet<String>,
        outputs: &mut HashMap<String, serde_json::Value>,
    ) {
        if result.success {
            self.counters.subtasks_succeeded.fetch_add(1, Ordering::Relaxed);
            completed.insert(result.subtask_id.clone());
            outputs.insert(result.subtask_id.clone(), result.output.clone());
        } else {
            self.counters.subtasks_failed.fetch_add(1, Ordering::Relaxed);
        }

        let progress = {
            let mut active = self.active.write();
            active.get_mut(&task_id).map(|state| {
                state.completed_subtasks += 1;
                (state.completed_subtasks, state.subtask_count)
            })
        };
        if let Some((done, total)) = progress {
            self.events.publish(Event::TaskProgress {
                task_id,
                progress: Some(0.3 + 0.5 * done as f32 / total.max(1) as f32),
                message: format!("subtask {} finished ({done}/{total})", result.subtask_id),
            });
        }
    }

    fn ensure_not_cancelled(&self, task_id: Uuid) -> ConductorResult<()> {
        if self.cancelled.read().contains(&task_id) {
            Err(ConductorError::Cancelled(task_id))
        } else {
            Ok(())
        }
    }

    /// Claim a worker, run the subtask on it and release the worker.
    async fn dispatch(
        &self,
        task: &Task,
        subtask: &Subtask,
        inputs: &HashMap<String, serde_json::Value>,
    ) -> ConductorResult<SubtaskResult> {
        let claim = self.acquire_worker(task.id, subtask).await?;
        let worker_id = claim.worker_id().to_string();
        debug!(task_id = %task.id, subtask = %subtask.id, worker = %worker_id, "Dispatching subtask");

        let started = Instant::now();
        let outcome = self
            .executor
            .execute(&worker_id, task, subtask, inputs)
            .await;
        drop(claim);
        let duration_ms = started.elapsed().as_millis() as u64;

        Ok(match outcome {
            Ok(output) => SubtaskResult {
                subtask_id: subtask.id.clone(),
                worker: Some(worker_id),
                success: true,
                output,
                error: None,
                duration_ms,
            },
            Err(e) => {
                warn!(task_id = %task.id, subtask = %subtask.id, error = %e, "Subtask failed");
                SubtaskResult {
                    subtask_id: subtask.id.clone(),
                    worker: Some(worker_id),
                    success: false,
                    output: serde_json::Value::Null,
                    error: Some(e.to_string()),
                    duration_ms,
                }
            }
        })
    }

    /// Claim a worker for `subtask`, waiting a bounded number of attempts.
    /// A cancelled run never claims; a claim won while the run was being
    /// cancelled is handed back before the subtask is dispatched.
    async fn acquire_worker(
        &self,
        task_id: Uuid,
        subtask: &Subtask,
    ) -> ConductorResult<WorkerClaim<'_>> {
        let attempts = self.config.worker_wait_attempts.max(1);
        let backoff = Duration::from_millis(self.config.worker_wait_backoff_ms);
        for attempt in 1..=attempts {
            self.ensure_not_cancelled(task_id)?;
            if let Some((worker_id, claim_id)) = self
                .pool
                .try_claim(&subtask.required_capabilities, task_id)
            {
                let claim = WorkerClaim::new(&self.pool, worker_id, claim_id);
                self.ensure_not_cancelled(task_id)?;
                return Ok(claim);
            }
            if attempt < attempts {
                debug!(subtask = %subtask.id, attempt, "No free worker, waiting");
                tokio::time::sleep(backoff).await;
            }
        }
        Err(ConductorError::NoWorkerAvailable {
            subtask: subtask.id.clone(),
            attempts,
        })
    }

    /// Ask the provider to merge subtask results into a final answer.
    pub async fn aggregate(
        &self,
        task: &Task,
        results: &[SubtaskResult],
    ) -> ConductorResult<serde_json::Value> {
        let prompt = format!(
            "Original task: {}\nSubtask results: {}",
            task.message,
            serde_json::to_string(results)?
        );
        let request = GenerationRequest::new(AGGREGATE_INSTRUCTIONS, prompt).with_schema(
            serde_json::json!({
                "type": "object",
                "properties": {"summary": {"type": "string"}},
                "required": ["summary"]
            }),
        );
        with_retry(&self.config.retry, "aggregate", || {
            self.provider.generate(&request)
        })
        .await
        .map_err(|e| {
            error!(task_id = %task.id, error = %e, "Aggregation failed");
            ConductorError::AggregationFailed(Box::new(e))
        })
    }

    /// Decompose, coordinate and aggregate `task`, tracking it while it runs.
    pub async fn run(&self, task: &Task) -> ConductorResult<OrchestrationOutcome> {
        let started = Instant::now();
        self.counters.runs_started.fetch_add(1, Ordering::Relaxed);
        self.active.write().insert(
            task.id,
            OrchestrationState {
                task_id: task.id,
                status: TaskStatus::Processing,
                phase: OrchestrationPhase::Decomposing,
                subtask_count: 0,
                completed_subtasks: 0,
                started_at: Utc::now(),
                metadata: task.metadata.clone(),
            },
        );
        info!(task_id = %task.id, "Orchestration started");

        let result = self.run_phases(task).await;
        {
            let mut active = self.active.write();
            active.remove(&task.id);
            self.cancelled.write().remove(&task.id);
        }

        match result {
            Ok((output, subtasks)) => {
                self.counters.runs_completed.fetch_add(1, Ordering::Relaxed);
                let success = subtasks.iter().all(|r| r.success);
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(task_id = %task.id, success, duration_ms, "Orchestration complete");
                Ok(OrchestrationOutcome {
                    task_id: task.id,
                    success,
                    output,
                    subtasks,
                    duration_ms,
                })
            }
            Err(e) => {
                self.counters.runs_failed.fetch_add(1, Ordering::Relaxed);
                error!(task_id = %task.id, error = %e, "Orchestration failed");
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        task: &Task,
    ) -> ConductorResult<(serde_json::Value, Vec<SubtaskResult>)> {
        self.progress(task.id, 0.1, "decomposing");
        let decomposition = self.decompose(task).await?;
        self.ensure_not_cancelled(task.id)?;

        self.set_phase(task.id, OrchestrationPhase::Executing, decomposition.subtasks.len());
        self.progress(task.id, 0.3, "executing subtasks");
        let results = self
            .coordinate(task, &decomposition.subtasks, &decomposition.execution_plan)
            .await?;
        self.ensure_not_cancelled(task.id)?;

        self.set_phase(task.id, OrchestrationPhase::Aggregating, decomposition.subtasks.len());
        self.progress(task.id, 0.8, "aggregating results");
        let output = self.aggregate(task, &results).await?;
        self.progress(task.id, 1.0, "complete");
        Ok((output, results))
    }

    fn set_phase(&self, task_id: Uuid, phase: OrchestrationPhase, subtask_count: usize) {
        if let Some(state) = self.active.write().get_mut(&task_id) {
            state.phase = phase;
            state.subtask_count = subtask_count;
        }
    }

    fn progress(&self, task_id: Uuid, progress: f32, message: &str) {
        self.events.publish(Event::TaskProgress {
            task_id,
            progress: Some(progress),
            message: message.to_string(),
        });
    }

    /// Stop tracking an orchestration. Subtasks waiting for a worker give up
    /// and nothing further is dispatched; a worker running one of its
    /// subtasks is released when that subtask returns.
    pub fn cancel(&self, task_id: Uuid) -> CancelOutcome {
        {
            let mut active = self.active.write();
            if active.remove(&task_id).is_none() {
                return CancelOutcome::NotFound;
            }
            self.cancelled.write().insert(task_id);
        }
        let busy = self.pool.bound_to(task_id);
        info!(%task_id, ?busy, "Orchestration cancelled");
        CancelOutcome::Cancelled
    }

    /// Tracking record of a live run.
    pub fn state(&self, task_id: Uuid) -> Option<OrchestrationState> {
        self.active.read().get(&task_id).cloned()
    }

    /// Every live run.
    pub fn active(&self) -> Vec<OrchestrationState> {
        self.active.read().values().cloned().collect()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> OrchestratorMetrics {
        OrchestratorMetrics {
            runs_started: self.counters.runs_started.load(Ordering::Relaxed),
            runs_completed: self.counters.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.counters.runs_failed.load(Ordering::Relaxed),
            subtasks_succeeded: self.counters.subtasks_succeeded.load(Ordering::Relaxed),
            subtasks_failed: self.counters.subtasks_failed.load(Ordering::Relaxed),
            active: self.active.read().len(),
        }
    }
}

fn decomposition_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "subtasks": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "string"},
                        "type": {"type": "string"},
                        "description": {"type": "string"},
                        "dependencies": {"type": "array", "items": {"type": "string"}},
                        "requiredCapabilities": {"type": "array", "items": {"type": "string"}},
                        "estimatedDurationMs": {"type": "integer"}
                    },
                    "required": ["id", "description"]
                }
            },
            "executionPlan": {
                "type": "object",
                "properties": {
                    "parallelizable": {"type": "array", "items": {"type": "string"}},
                    "sequential": {"type": "array", "items": {"type": "string"}}
                }
            }
        },
        "required": ["subtasks", "executionPlan"]
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::workers::Worker;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Provider that replays canned answers in order.
    struct CannedProvider {
        answers: Mutex<VecDeque<ConductorResult<serde_json::Value>>>,
        calls: AtomicU64,
    }

    impl CannedProvider {
        fn new(answers: Vec<ConductorResult<serde_json::Value>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl GenerationProvider for CannedProvider {
        async fn generate(&self, _request: &GenerationRequest) -> ConductorResult<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ConductorError::Provider("no more answers".into())))
        }
    }

    /// Records dispatches; subtasks whose id starts with "fail" error.
    #[derive(Default)]
    struct RecordingExecutor {
        dispatched: Mutex<Vec<(String, String)>>,
        inputs: Mutex<HashMap<String, Vec<String>>>,
    }

    #[async_trait]
    impl SubtaskExecutor for RecordingExecutor {
        async fn execute(
            &self,
            worker_id: &str,
            _parent: &Task,
            subtask: &Subtask,
            inputs: &HashMap<String, serde_json::Value>,
        ) -> ConductorResult<serde_json::Value> {
            self.dispatched
                .lock()
                .push((subtask.id.clone(), worker_id.to_string()));
            let mut keys: Vec<String> = inputs.keys().cloned().collect();
            keys.sort();
            self.inputs.lock().insert(subtask.id.clone(), keys);
            if subtask.id.starts_with("fail") {
                Err(ConductorError::Agent("boom".into()))
            } else {
                Ok(serde_json::json!({ "done": subtask.id }))
            }
        }
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            worker_wait_attempts: 3,
            worker_wait_backoff_ms: 1,
            retry: RetryPolicy {
                max_retries: 2,
                backoff_base_ms: 1,
                backoff_max_ms: 2,
            },
            ..OrchestratorConfig::default()
        }
    }

    fn orchestrator(
        provider: Arc<CannedProvider>,
        executor: Arc<RecordingExecutor>,
        workers: &[&str],
    ) -> TaskOrchestrator {
        let orch = TaskOrchestrator::new(
            fast_config(),
            provider,
            executor,
            Arc::new(EventBus::new()),
        );
        for w in workers {
            orch.pool().add_worker(Worker::new(*w, ["general"], 2));
        }
        orch
    }

    fn plan(parallel: &[&str], sequential: &[&str]) -> ExecutionPlan {
        ExecutionPlan::new(
            parallel.iter().map(|s| s.to_string()).collect(),
            sequential.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_unmet_dependency_is_never_dispatched() {
        let executor = Arc::new(RecordingExecutor::default());
        let orch = orchestrator(
            Arc::new(CannedProvider::new(vec![])),
            executor.clone(),
            &["w1"],
        );
        let subtasks = vec![
            Subtask::new("s1", "first"),
            Subtask::new("s2", "second").with_dependencies(["s1"]),
        ];

        let err = orch
            .coordinate(&Task::new("t"), &subtasks, &plan(&[], &["s2"]))
            .await
            .unwrap_err();

        match err {
            ConductorError::DependencyNotMet { subtask, missing } => {
                assert_eq!(subtask, "s2");
                assert_eq!(missing, vec!["s1".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(executor.dispatched.lock().is_empty());
    }

    #[tokio::test]
    async fn test_coordinate_passes_dependency_outputs() {
        let executor = Arc::new(RecordingExecutor::default());
        let orch = orchestrator(
            Arc::new(CannedProvider::new(vec![])),
            executor.clone(),
            &["w1", "w2"],
        );
        let subtasks = vec![
            Subtask::new("a", "a"),
            Subtask::new("b", "b"),
            Subtask::new("c", "c").with_dependencies(["a", "b"]),
        ];

        let results = orch
            .coordinate(&Task::new("t"), &subtasks, &plan(&["a", "b"], &["c"]))
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(results[2].subtask_id, "c");
        assert_eq!(
            executor.inputs.lock().get("c").unwrap(),
            &vec!["a".to_string(), "b".to_string()]
        );
        assert!(orch.pool().workers().iter().all(|w| w.active_tasks == 0));
    }

    #[tokio::test]
    async fn test_failed_subtask_blocks_dependents() {
        let executor = Arc::new(RecordingExecutor::default());
        let orch = orchestrator(
            Arc::new(CannedProvider::new(vec![])),
            executor.clone(),
            &["w1"],
        );
        let subtasks = vec![
            Subtask::new("fail-a", "a"),
            Subtask::new("b", "b").with_dependencies(["fail-a"]),
        ];

        let err = orch
            .coordinate(&Task::new("t"), &subtasks, &plan(&["fail-a"], &["b"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::DependencyNotMet { .. }));
        assert_eq!(executor.dispatched.lock().len(), 1);
        assert_eq!(orch.metrics().subtasks_failed, 1);
    }

    #[tokio::test]
    async fn test_unknown_plan_id_is_invalid() {
        let orch = orchestrator(
            Arc::new(CannedProvider::new(vec![])),
            Arc::new(RecordingExecutor::default()),
            &["w1"],
        );
        let err = orch
            .coordinate(&Task::new("t"), &[Subtask::new("a", "a")], &plan(&["a", "ghost"], &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::InvalidPlan(_)));
    }

    #[tokio::test]
    async fn test_no_worker_available_after_attempts() {
        let orch = orchestrator(
            Arc::new(CannedProvider::new(vec![])),
            Arc::new(RecordingExecutor::default()),
            &["w1"],
        );
        let subtasks = vec![Subtask::new("a", "a").with_capabilities(["gpu"])];
        let err = orch
            .coordinate(&Task::new("t"), &subtasks, &plan(&["a"], &[]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConductorError::NoWorkerAvailable { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_decompose_retries_then_validates() {
        let answer = serde_json::json!({
            "subtasks": [
                {"id": "a", "description": "a"},
                {"id": "b", "description": "b", "dependencies": ["a"]}
            ],
            "executionPlan": {"parallelizable": ["a"], "sequential": ["b"]}
        });
        let provider = Arc::new(CannedProvider::new(vec![
            Err(ConductorError::Provider("503".into())),
            Ok(answer),
        ]));
        let orch = orchestrator(provider.clone(), Arc::new(RecordingExecutor::default()), &[]);

        let decomposition = orch.decompose(&Task::new("t")).await.unwrap();
        assert_eq!(decomposition.subtasks.len(), 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_decompose_rejects_invalid_plan() {
        let answer = serde_json::json!({
            "subtasks": [{"id": "a", "description": "a"}],
            "executionPlan": {"parallelizable": [], "sequential": []}
        });
        let orch = orchestrator(
            Arc::new(CannedProvider::new(vec![Ok(answer)])),
            Arc::new(RecordingExecutor::default()),
            &[],
        );
        let err = orch.decompose(&Task::new("t")).await.unwrap_err();
        match err {
            ConductorError::DecompositionFailed(source) => {
                assert!(matches!(*source, ConductorError::InvalidPlan(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_end_to_end_and_aggregation_failure() {
        let decomposition = serde_json::json!({
            "subtasks": [{"id": "a", "description": "a"}],
            "executionPlan": {"parallelizable": ["a"], "sequential": []}
        });
        let provider = Arc::new(CannedProvider::new(vec![
            Ok(decomposition.clone()),
            Ok(serde_json::json!({"summary": "all done"})),
            Ok(decomposition),
            Err(ConductorError::Validation("bad request".into())),
        ]));
        let orch = orchestrator(provider, Arc::new(RecordingExecutor::default()), &["w1"]);

        let outcome = orch.run(&Task::new("t")).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output["summary"], "all done");
        assert_eq!(outcome.subtasks.len(), 1);

        let err = orch.run(&Task::new("t2")).await.unwrap_err();
        assert!(matches!(err, ConductorError::AggregationFailed(_)));

        let metrics = orch.metrics();
        assert_eq!(metrics.runs_started, 2);
        assert_eq!(metrics.runs_completed, 1);
        assert_eq!(metrics.runs_failed, 1);
        assert_eq!(metrics.active, 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let orch = orchestrator(
            Arc::new(CannedProvider::new(vec![])),
            Arc::new(RecordingExecutor::default()),
            &[],
        );
        assert_eq!(orch.cancel(Uuid::new_v4()), CancelOutcome::NotFound);
    }

    /// Holds every subtask until the test opens the gate.
    #[derive(Default)]
    struct GatedExecutor {
        started: tokio::sync::Notify,
        gate: tokio::sync::Notify,
        dispatched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SubtaskExecutor for GatedExecutor {
        async fn execute(
            &self,
            _worker_id: &str,
            _parent: &Task,
            subtask: &Subtask,
            _inputs: &HashMap<String, serde_json::Value>,
        ) -> ConductorResult<serde_json::Value> {
            self.dispatched.lock().push(subtask.id.clone());
            self.started.notify_one();
            self.gate.notified().await;
            Ok(serde_json::json!({ "done": subtask.id }))
        }
    }

    /// Single-slot worker `w1` and a provider answering with `decomposition`.
    fn gated_orchestrator(
        decomposition: serde_json::Value,
        executor: Arc<GatedExecutor>,
    ) -> Arc<TaskOrchestrator> {
        let config = OrchestratorConfig {
            worker_wait_attempts: 500,
            worker_wait_backoff_ms: 2,
            ..fast_config()
        };
        let orch = TaskOrchestrator::new(
            config,
            Arc::new(CannedProvider::new(vec![Ok(decomposition)])),
            executor,
            Arc::new(EventBus::new()),
        );
        orch.pool().add_worker(Worker::new("w1", ["general"], 1));
        Arc::new(orch)
    }

    #[tokio::test]
    async fn test_cancel_while_subtask_waits_for_worker() {
        let executor = Arc::new(GatedExecutor::default());
        let orch = gated_orchestrator(
            serde_json::json!({
                "subtasks": [{"id": "a", "description": "a"}, {"id": "b", "description": "b"}],
                "executionPlan": {"parallelizable": ["a", "b"], "sequential": []}
            }),
            executor.clone(),
        );
        let task = Task::new("t");
        let run = tokio::spawn({
            let orch = orch.clone();
            let task = task.clone();
            async move { orch.run(&task).await }
        });

        // One subtask holds w1, the other is waiting for it.
        executor.started.notified().await;
        assert_eq!(orch.cancel(task.id), CancelOutcome::Cancelled);
        assert!(orch.active().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The running subtask still owns w1.
        assert!(orch.pool().try_claim(&[], Uuid::new_v4()).is_none());
        assert_eq!(orch.pool().bound_to(task.id), vec!["w1".to_string()]);

        executor.gate.notify_one();
        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, ConductorError::Cancelled(id) if id == task.id));
        assert_eq!(executor.dispatched.lock().len(), 1);

        let w1 = orch.pool().get("w1").unwrap();
        assert_eq!(w1.active_tasks, 0);
        assert!(w1.slots.is_empty());
        assert!(orch.pool().try_claim(&[], Uuid::new_v4()).is_some());
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_sequential_phase() {
        let executor = Arc::new(GatedExecutor::default());
        let orch = gated_orchestrator(
            serde_json::json!({
                "subtasks": [
                    {"id": "a", "description": "a"},
                    {"id": "b", "description": "b", "dependencies": ["a"]}
                ],
                "executionPlan": {"parallelizable": ["a"], "sequential": ["b"]}
            }),
            executor.clone(),
        );
        let task = Task::new("t");
        let run = tokio::spawn({
            let orch = orch.clone();
            let task = task.clone();
            async move { orch.run(&task).await }
        });

        executor.started.notified().await;
        assert_eq!(orch.state(task.id).unwrap().phase, OrchestrationPhase::Executing);
        assert_eq!(orch.cancel(task.id), CancelOutcome::Cancelled);
        assert!(orch.state(task.id).is_none());
        assert_eq!(orch.cancel(task.id), CancelOutcome::NotFound);

        executor.gate.notify_one();
        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, ConductorError::Cancelled(_)));
        assert_eq!(*executor.dispatched.lock(), vec!["a".to_string()]);

        assert!(orch.pool().workers().iter().all(|w| w.active_tasks == 0));
        let metrics = orch.metrics();
        assert_eq!(metrics.runs_failed, 1);
        assert_eq!(metrics.active, 0);
    }

    #[tokio::test]
    async fn test_agent_executor_builds_child_task() {
        use conductor_agents::LocalAgent;
        use conductor_core::AgentDescriptor;

        let registry = Arc::new(AgentRegistry::new(Arc::new(EventBus::new())));
        registry
            .register(Arc::new(LocalAgent::new(
                AgentDescriptor::new("w1", "assistant"),
                |task| {
                    Ok(serde_json::json!({
                        "target": task.target_agent,
                        "deps": task.metadata.get("dependencyResults").cloned(),
                        "subtask": task.metadata.get("subtaskId").cloned(),
                    }))
                },
            )))
            .unwrap();
        let executor = AgentExecutor::new(registry.clone());
        let inputs = HashMap::from([("a".to_string(), serde_json::json!({"x": 1}))]);

        let output = executor
            .execute("w1", &Task::new("parent"), &Subtask::new("b", "do b"), &inputs)
            .await
            .unwrap();

        assert_eq!(output["target"], "w1");
        assert_eq!(output["subtask"], "b");
        assert_eq!(output["deps"]["a"]["x"], 1);
        assert_eq!(registry.get("w1").unwrap().metrics.total_tasks, 1);
    }
}
