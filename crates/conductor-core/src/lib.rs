//! Core types and error definitions for Conductor.
//!
//! This crate provides the foundational types shared across all Conductor crates:
//! the error taxonomy, the agent and task data model, compound-task plans and
//! the observer bus that carries lifecycle events.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.
//! - [`AgentInfo`] — Registered agent: descriptor, health and rolling metrics.
//! - [`Task`] — A work item routed to an agent.
//! - [`Subtask`] / [`ExecutionPlan`] — Decomposition of a compound task.
//! - [`EventBus`] — Subscribe/unsubscribe observer for [`Event`]s.

/// Agent identity, health and metrics.
pub mod agent;
/// Error taxonomy.
pub mod error;
/// Lifecycle events and the observer bus.
pub mod event;
/// Subtasks, execution plans and plan validation.
pub mod plan;
/// Tasks, requests and agent responses.
pub mod task;

pub use agent::{AgentDescriptor, AgentInfo, AgentMetrics, HealthStatus};
pub use error::{ConductorError, ConductorResult, ErrorKind};
pub use event::{Event, EventBus, EventSink, SubscriptionId};
pub use plan::{Decomposition, ExecutionPlan, Subtask, SubtaskResult};
pub use task::{
    AgentResponse, Intent, IntentKind, StatusReport, Task, TaskOutcome, TaskRequest, TaskStatus,
};
