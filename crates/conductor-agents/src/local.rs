use crate::handle::AgentHandle;
use async_trait::async_trait;
use conductor_core::{
    AgentDescriptor, AgentResponse, ConductorError, ConductorResult, StatusReport, Task,
    TaskStatus,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Function run by a [`LocalAgent`] for every task.
pub type LocalHandler = Arc<dyn Fn(&Task) -> ConductorResult<serde_json::Value> + Send + Sync>;

/// In-process agent backed by a plain function.
///
/// Answers synchronously and remembers the final status of every task it has
/// processed so [`AgentHandle::task_status`] can report it later.
pub struct LocalAgent {
    descriptor: AgentDescriptor,
    handler: LocalHandler,
    healthy: AtomicBool,
    processed: AtomicUsize,
    shutdowns: AtomicUsize,
    reports: RwLock<HashMap<Uuid, StatusReport>>,
}

impl LocalAgent {
    /// Healthy agent running `handler` for every task.
    pub fn new<F>(descriptor: AgentDescriptor, handler: F) -> Self
    where
        F: Fn(&Task) -> ConductorResult<serde_json::Value> + Send + Sync + 'static,
    {
        Self {
            descriptor,
            handler: Arc::new(handler),
            healthy: AtomicBool::new(true),
            processed: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            reports: RwLock::new(HashMap::new()),
        }
    }

    /// Agent that answers `{"agent": <name>, "echo": <message>}`.
    pub fn echo(descriptor: AgentDescriptor) -> Self {
        let name = descriptor.name.clone();
        Self::new(descriptor, move |task| {
            Ok(serde_json::json!({ "agent": name, "echo": task.message }))
        })
    }

    /// Make health checks pass or fail.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of tasks handed to [`process`](AgentHandle::process).
    pub fn processed_count(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Times [`shutdown`](AgentHandle::shutdown) was called.
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentHandle for LocalAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn process(&self, task: &Task) -> ConductorResult<AgentResponse> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        let (response, report) = match (self.handler)(task) {
            Ok(output) => (
                AgentResponse::completed(output.clone()),
                StatusReport::new(TaskStatus::Completed)
                    .with_progress(1.0)
                    .with_result(output),
            ),
            Err(e) => {
                let mut report = StatusReport::new(TaskStatus::Failed);
                report.error = Some(e.to_string());
                (AgentResponse::failed(e.to_string()), report)
            }
        };
        self.reports.write().insert(task.id, report);
        Ok(response)
    }

    async fn health_check(&self) -> ConductorResult<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConductorError::AgentUnavailable(self.descriptor.name.clone()))
        }
    }

    async fn task_status(&self, task_id: Uuid) -> ConductorResult<StatusReport> {
        self.reports
            .read()
            .get(&task_id)
            .cloned()
            .ok_or(ConductorError::TaskNotFound(task_id))
    }

    async fn shutdown(&self) -> ConductorResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
