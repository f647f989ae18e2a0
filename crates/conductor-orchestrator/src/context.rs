use crate::orchestrator::{
    AgentExecutor, CancelOutcome, OrchestratorConfig, OrchestratorMetrics, TaskOrchestrator,
};
use crate::poller::{AgentStatusSource, PollMetrics, PollerConfig, StatusPoller, TrackedTask};
use crate::provider::{GenerationProvider, GenerationRequest};
use conductor_agents::{
    AgentRegistry, AgentSelector, Discovery, DiscoveryConfig, DiscoveryReport, SelectionConfig,
};
use conductor_core::{
    ConductorError, ConductorResult, EventBus, Intent, Task, TaskOutcome, TaskRequest,
    TaskStatus,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const INTENT_INSTRUCTIONS: &str = "Classify the purpose of the user's request as one of \
extraction, analysis, general or code. If one of the listed agents is clearly the best fit, \
name it as suggestedAgent.";

/// Name reported as the executing agent of compound tasks.
pub const ORCHESTRATOR_AGENT: &str = "orchestrator";

/// Everything needed to build a [`Conductor`].
#[derive(Debug, Clone, Default)]
pub struct ConductorSettings {
    /// Status poller settings.
    pub poller: PollerConfig,
    /// Compound-task orchestration settings.
    pub orchestrator: OrchestratorConfig,
    /// Intent routes used by the selector.
    pub selection: SelectionConfig,
    /// Endpoints queried by [`Conductor::discover`].
    pub discovery: DiscoveryConfig,
    /// Classify intent through the provider before selecting an agent.
    pub analyze_intent: bool,
}

/// Point-in-time view of the whole system, served by `/metrics`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    /// Registered agents.
    pub agents: usize,
    /// Registered agents currently healthy.
    pub healthy_agents: usize,
    /// Tasks known to the poller.
    pub tracked_tasks: usize,
    /// Event bus subscribers.
    pub subscribers: usize,
    /// Submissions that returned an error, selection failures included.
    pub submit_failures: u64,
    /// Poller counters.
    pub poller: PollMetrics,
    /// Orchestrator counters.
    pub orchestrator: OrchestratorMetrics,
}

/// The task-orchestration context: one per process, shared as `Arc`.
pub struct Conductor {
    registry: Arc<AgentRegistry>,
    selector: AgentSelector,
    poller: Arc<StatusPoller>,
    orchestrator: Arc<TaskOrchestrator>,
    provider: Arc<dyn GenerationProvider>,
    discovery: Discovery,
    analyze_intent: bool,
    background: CancellationToken,
    submit_failures: AtomicU64,
}

impl Conductor {
    /// Wire the poller and orchestrator to `registry` and `provider`.
    pub fn new(
        registry: Arc<AgentRegistry>,
        provider: Arc<dyn GenerationProvider>,
        settings: ConductorSettings,
    ) -> ConductorResult<Self> {
        let events = Arc::clone(registry.events());
        let poller = Arc::new(StatusPoller::new(
            settings.poller,
            Arc::new(AgentStatusSource::new(Arc::clone(&registry))),
            Arc::clone(&events),
        ));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            settings.orchestrator,
            Arc::clone(&provider),
            Arc::new(AgentExecutor::new(Arc::clone(&registry))),
            events,
        ));
        Ok(Self {
            selector: AgentSelector::new(settings.selection.intent_routes),
            discovery: Discovery::new(&settings.discovery)?,
            registry,
            poller,
            orchestrator,
            provider,
            analyze_intent: settings.analyze_intent,
            background: CancellationToken::new(),
            submit_failures: AtomicU64::new(0),
        })
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The bus shared by registry, poller and orchestrator.
    pub fn events(&self) -> &Arc<EventBus> {
        self.registry.events()
    }

    /// Selection and negotiation rules.
    pub fn selector(&self) -> &AgentSelector {
        &self.selector
    }

    /// Poller tracking tasks accepted for later completion.
    pub fn poller(&self) -> &Arc<StatusPoller> {
        &self.poller
    }

    /// Orchestrator running compound tasks.
    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    /// Run an initial health pass, then start the health monitor and the poller.
    pub async fn start(&self, health_interval: Duration) {
        let summary = self.registry.check_health().await;
        info!(
            healthy = summary.healthy,
            unhealthy = summary.unhealthy,
            "Initial health check complete"
        );
        self.registry
            .spawn_health_monitor(health_interval, self.background.child_token());
        self.poller.start();
    }

    /// Stop background work and unregister every agent.
    pub async fn shutdown(&self) {
        self.background.cancel();
        self.poller.stop().await;
        self.registry.shutdown_all().await;
        info!("Conductor shut down");
    }

    /// Register every agent published at the configured discovery endpoints.
    pub async fn discover(&self) -> DiscoveryReport {
        self.discovery.discover(&self.registry).await
    }

    /// Route a task to an agent, or orchestrate it when it is compound.
    /// Every error counts towards `submit_failures`.
    pub async fn submit(&self, request: TaskRequest) -> ConductorResult<TaskOutcome> {
        let result = self.submit_inner(request).await;
        if let Err(e) = &result {
            self.submit_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Task submission failed");
        }
        result
    }

    async fn submit_inner(&self, request: TaskRequest) -> ConductorResult<TaskOutcome> {
        if request.message.trim().is_empty() {
            return Err(ConductorError::Validation("message must not be empty".into()));
        }
        let mut task = Task::from_request(request);
        info!(task_id = %task.id, compound = task.compound, "Task submitted");

        if task.compound {
            return self.run_compound(task).await;
        }

        if self.analyze_intent && task.target_agent.is_none() {
            task.set_status(TaskStatus::Analyzing);
            task.intent = self.analyze(&task).await;
        }

        let agent = self.selector.select(&self.registry.snapshot(), &task)?;
        self.dispatch(task, &agent).await
    }

    /// Send `task` to `agent` and fold the answer into a [`TaskOutcome`].
    /// Tasks the agent accepts for later completion are handed to the poller,
    /// which records their outcome in the agent's metrics once they finish.
    pub async fn dispatch(&self, mut task: Task, agent: &str) -> ConductorResult<TaskOutcome> {
        let handle = self
            .registry
            .handle(agent)
            .ok_or_else(|| ConductorError::AgentNotFound(agent.to_string()))?;
        task.set_status(TaskStatus::Processing);
        info!(task_id = %task.id, agent = %agent, "Dispatching task");

        self.registry.task_started(agent);
        let dispatched_at = Utc::now();
        let started = Instant::now();
        let result = handle.process(&task).await;
        let elapsed = started.elapsed();

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.registry.record_outcome(agent, false, elapsed);
                warn!(task_id = %task.id, agent = %agent, error = %e, "Agent call failed");
                return Err(e);
            }
        };
        if response.status.is_in_flight() {
            self.poller
                .add_task(
                    TrackedTask::new(task.id, agent)
                        .with_status(response.status)
                        .with_session(task.session_id)
                        .with_started_at(dispatched_at),
                )
                .await;
        } else {
            self.registry.record_outcome(agent, response.success, elapsed);
        }

        Ok(TaskOutcome {
            task_id: task.id,
            agent: agent.to_string(),
            success: response.success,
            status: response.status,
            output: response.output,
            error: response.error,
            duration_ms: elapsed.as_millis() as u64,
        })
    }

    async fn run_compound(&self, task: Task) -> ConductorResult<TaskOutcome> {
        self.orchestrator.sync_workers(&self.registry.snapshot());
        let outcome = self.orchestrator.run(&task).await?;
        Ok(TaskOutcome {
            task_id: task.id,
            agent: ORCHESTRATOR_AGENT.to_string(),
            success: outcome.success,
            status: if outcome.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            },
            error: (!outcome.success).then(|| "one or more subtasks failed".to_string()),
            output: serde_json::json!({
                "result": outcome.output,
                "subtasks": outcome.subtasks,
            }),
            duration_ms: outcome.duration_ms,
        })
    }

    /// Ask the provider for the task's intent; `None` when it cannot say.
    async fn analyze(&self, task: &Task) -> Option<Intent> {
        let agents: Vec<String> = self
            .registry
            .list()
            .iter()
            .map(|a| format!("{} ({})", a.name(), a.descriptor.agent_type))
            .collect();
        let request = GenerationRequest::new(
            INTENT_INSTRUCTIONS,
            format!("Agents: {}\nRequest: {}", agents.join(", "), task.message),
        )
        .with_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "kind": {"enum": ["extraction", "analysis", "general", "code"]},
                "suggestedAgent": {"type": "string"},
                "confidence": {"type": "number"}
            },
            "required": ["kind"]
        }));

        let parsed = self
            .provider
            .generate(&request)
            .await
            .and_then(|value| serde_json::from_value::<Intent>(value).map_err(Into::into));
        match parsed {
            Ok(intent) => {
                info!(task_id = %task.id, kind = ?intent.kind, "Intent analyzed");
                Some(intent)
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Intent analysis failed, continuing without");
                None
            }
        }
    }

    /// Cancel an orchestration, or stop tracking a polled task.
    pub async fn cancel(&self, task_id: Uuid) -> CancelOutcome {
        match self.orchestrator.cancel(task_id) {
            CancelOutcome::Cancelled => CancelOutcome::Cancelled,
            CancelOutcome::NotFound => match self.poller.remove_task(task_id).await {
                Some(tracked) => {
                    if tracked.status.is_in_flight() {
                        self.registry.task_abandoned(&tracked.agent);
                    }
                    CancelOutcome::Cancelled
                }
                None => CancelOutcome::NotFound,
            },
        }
    }

    /// Gather counters from every component.
    pub async fn metrics(&self) -> SystemMetrics {
        let agents = self.registry.list();
        SystemMetrics {
            healthy_agents: agents.iter().filter(|a| a.is_healthy()).count(),
            agents: agents.len(),
            tracked_tasks: self.poller.tracked_count().await,
            subscribers: self.events().subscriber_count(),
            submit_failures: self.submit_failures.load(Ordering::Relaxed),
            poller: self.poller.metrics(),
            orchestrator: self.orchestrator.metrics(),
        }
    }
}
