//! Task orchestration for Conductor: status polling, worker pool and
//! compound-task coordination.
//!
//! Implements the orchestrator-workers pattern: a compound task is decomposed
//! into subtasks by the generation provider, dispatched across a bounded
//! worker pool respecting dependencies, and aggregated into one answer.
//!
//! # Main types
//!
//! - [`Conductor`] — The owned context tying registry, selector, poller and orchestrator together.
//! - [`StatusPoller`] — Tracks in-flight tasks and publishes their lifecycle events.
//! - [`TaskOrchestrator`] — Decompose → coordinate → aggregate pipeline.
//! - [`WorkerPool`] — Worker selection (round-robin or least-loaded) with atomic claims.
//! - [`GenerationProvider`] — Text-generation backend used for planning and aggregation.

/// The task-orchestration context.
pub mod context;
/// Compound-task decomposition, coordination and aggregation.
pub mod orchestrator;
/// Asynchronous status polling.
pub mod poller;
/// Generation provider trait and the messages-API implementation.
pub mod provider;
/// Exponential-backoff retries.
pub mod retry;
/// Worker pool and selection strategies.
pub mod workers;

pub use context::{Conductor, ConductorSettings, SystemMetrics, ORCHESTRATOR_AGENT};
pub use orchestrator::{
    AgentExecutor, CancelOutcome, OrchestrationOutcome, OrchestrationPhase, OrchestrationState,
    OrchestratorConfig, OrchestratorMetrics, SubtaskExecutor, TaskOrchestrator,
};
pub use poller::{
    AgentStatusSource, PollMetrics, PollerConfig, StatusPoller, StatusSource, TrackedTask,
};
pub use provider::{
    extract_json, GenerationProvider, GenerationRequest, MessagesApiProvider, ProviderConfig,
};
pub use retry::{with_retry, RetryPolicy};
pub use workers::{SelectionStrategy, Slot, Worker, WorkerPool};
