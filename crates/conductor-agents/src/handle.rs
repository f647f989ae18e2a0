use async_trait::async_trait;
use conductor_core::{AgentDescriptor, AgentResponse, ConductorResult, StatusReport, Task};
use uuid::Uuid;

/// A pluggable unit of execution capability.
///
/// Each kind of agent (remote HTTP agent, in-process agent, test double)
/// implements this trait; the registry stores handles and the selector only
/// ever looks at descriptors.
///
/// To add a new kind of agent:
/// 1. Implement `AgentHandle` for your struct
/// 2. Register an `Arc` of it with [`AgentRegistry::register`](crate::AgentRegistry::register)
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Name, type and capabilities of this agent.
    fn descriptor(&self) -> &AgentDescriptor;

    /// Process a task. Agents that finish later return a `Pending`/`Processing`
    /// response and answer [`task_status`](Self::task_status) until done.
    async fn process(&self, task: &Task) -> ConductorResult<AgentResponse>;

    /// Check liveness. `Ok` means healthy.
    async fn health_check(&self) -> ConductorResult<()>;

    /// Report the status of a task previously accepted by [`process`](Self::process).
    async fn task_status(&self, task_id: Uuid) -> ConductorResult<StatusReport>;

    /// Called once when the agent is unregistered.
    async fn shutdown(&self) -> ConductorResult<()> {
        Ok(())
    }
}
