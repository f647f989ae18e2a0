use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted, not started.
    #[default]
    Pending,
    /// Intent is being classified.
    Analyzing,
    /// Running on an agent.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    /// Completed or failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Statuses the poller keeps checking.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Processing)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Analyzing => "analyzing",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Classified purpose of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    /// Pull structured facts out of text.
    Extraction,
    /// Find patterns or draw conclusions.
    Analysis,
    /// Anything else.
    General,
    /// Write or review code.
    Code,
}

/// Provider verdict on what a task is for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    /// Classified purpose.
    pub kind: IntentKind,
    /// Agent the provider thinks fits best.
    #[serde(default)]
    pub suggested_agent: Option<String>,
    /// Provider confidence in `0.0..=1.0`.
    #[serde(default)]
    pub confidence: f32,
}

/// Canonical parameters for submitting a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Task text.
    pub message: String,
    /// Send to this agent instead of selecting one.
    #[serde(default)]
    pub agent: Option<String>,
    /// Capabilities the chosen agent must have.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Decompose into subtasks instead of routing to a single agent.
    #[serde(default)]
    pub compound: bool,
    /// Session that receives the task's events.
    #[serde(default)]
    pub session_id: Option<Uuid>,
    /// Forwarded to the agent untouched.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskRequest {
    /// Request for `message` with no constraints.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Force a specific agent, bypassing selection.
    pub fn for_agent(message: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            agent: Some(agent.into()),
            ..Self::new(message)
        }
    }
}

/// A work item routed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique id, also used by agents to report status.
    pub id: Uuid,
    /// Task text.
    pub message: String,
    /// Agent the task must go to, if forced.
    #[serde(default)]
    pub target_agent: Option<String>,
    /// Filled in by intent analysis.
    #[serde(default)]
    pub intent: Option<Intent>,
    /// Capabilities the handling agent must have.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Run through the orchestrator.
    #[serde(default)]
    pub compound: bool,
    /// Session that receives the task's events.
    #[serde(default)]
    pub session_id: Option<Uuid>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last status change.
    pub updated_at: DateTime<Utc>,
    /// Status checks that failed in a row.
    #[serde(default)]
    pub retries: u32,
    /// Provenance and caller data.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Task {
    /// Pending task with a fresh id.
    pub fn new(message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            message: message.into(),
            target_agent: None,
            intent: None,
            required_capabilities: Vec::new(),
            status: TaskStatus::Pending,
            compound: false,
            session_id: None,
            created_at: now,
            updated_at: now,
            retries: 0,
            metadata: HashMap::new(),
        }
    }

    /// Task built from a submission.
    pub fn from_request(request: TaskRequest) -> Self {
        let mut task = Self::new(request.message);
        task.target_agent = request.agent;
        task.required_capabilities = request.required_capabilities;
        task.compound = request.compound;
        task.session_id = request.session_id;
        task.metadata = request.metadata;
        task
    }

    /// Require these capabilities of the handling agent.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Force a specific agent.
    pub fn with_target(mut self, agent: impl Into<String>) -> Self {
        self.target_agent = Some(agent.into());
        self
    }

    /// Attach the analyzed intent.
    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = Some(intent);
        self
    }

    /// Change status and bump `updated_at`.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// What an agent returns when asked to process a task.
///
/// `status` is `Completed`/`Failed` for synchronous agents and
/// `Pending`/`Processing` when the agent accepted the task and will finish later.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    /// False when the agent reports an error.
    pub success: bool,
    /// Defaults to `completed` when the agent omits it.
    #[serde(default = "default_completed")]
    pub status: TaskStatus,
    /// Agent output, `null` until completion.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Set when `success` is false.
    #[serde(default)]
    pub error: Option<String>,
}

fn default_completed() -> TaskStatus {
    TaskStatus::Completed
}

impl AgentResponse {
    /// Synchronous success.
    pub fn completed(output: serde_json::Value) -> Self {
        Self {
            success: true,
            status: TaskStatus::Completed,
            output,
            error: None,
        }
    }

    /// Synchronous failure.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            status: TaskStatus::Failed,
            output: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    /// Taken on for later completion; poll the agent for the outcome.
    pub fn accepted() -> Self {
        Self {
            success: true,
            status: TaskStatus::Processing,
            output: serde_json::Value::Null,
            error: None,
        }
    }
}

/// Answer to a status query for a task running on an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Status on the agent.
    pub status: TaskStatus,
    /// In `0.0..=1.0`.
    #[serde(default)]
    pub progress: Option<f32>,
    /// Set once completed.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Failure reason reported by the agent.
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusReport {
    /// Report with only a status.
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            progress: None,
            result: None,
            error: None,
        }
    }

    /// Add progress.
    pub fn with_progress(mut self, progress: f32) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Add the completion result.
    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// Final outcome of a submitted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    /// Id of the submitted task.
    pub task_id: Uuid,
    /// Agent that handled the task, or `orchestrator` for compound tasks.
    pub agent: String,
    /// True when the agent did not report an error.
    pub success: bool,
    /// `processing` when the agent accepted the task for later completion.
    pub status: TaskStatus,
    /// Agent output; for compound tasks the aggregate plus per-subtask results.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Failure reason.
    #[serde(default)]
    pub error: Option<String>,
    /// Time until the agent answered.
    pub duration_ms: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_from_request() {
        let mut request = TaskRequest::new("hello");
        request.required_capabilities = vec!["echo".into()];
        let task = Task::from_request(request);
        assert_eq!(task.message, "hello");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.required_capabilities, vec!["echo".to_string()]);
        assert!(task.target_agent.is_none());
    }

    #[test]
    fn test_for_agent_sets_target() {
        let task = Task::from_request(TaskRequest::for_agent("hi", "kg"));
        assert_eq!(task.target_agent.as_deref(), Some("kg"));
    }

    #[test]
    fn test_status_flags() {
        assert!(TaskStatus::Pending.is_in_flight());
        assert!(TaskStatus::Processing.is_in_flight());
        assert!(!TaskStatus::Analyzing.is_in_flight());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }

    #[test]
    fn test_agent_response_defaults_to_completed() {
        let resp: AgentResponse =
            serde_json::from_str(r#"{"success": true, "output": {"echo": "hi"}}"#).unwrap();
        assert_eq!(resp.status, TaskStatus::Completed);
        assert_eq!(resp.output["echo"], "hi");
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let req: TaskRequest = serde_json::from_str(
            r#"{"message": "hello", "requiredCapabilities": ["echo"]}"#,
        )
        .unwrap();
        assert_eq!(req.required_capabilities, vec!["echo".to_string()]);
        assert!(!req.compound);
    }
}
