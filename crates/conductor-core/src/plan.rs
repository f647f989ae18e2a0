use crate::error::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One unit of a decomposed compound task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    /// Id unique within the decomposition.
    pub id: String,
    /// Free-form category, `general` by default.
    #[serde(rename = "type", default)]
    pub subtask_type: String,
    /// What the worker should do; sent as the task message.
    pub description: String,
    /// Ids that must succeed first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Capabilities the worker must advertise.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Provider estimate; informational.
    #[serde(default)]
    pub estimated_duration_ms: u64,
}

impl Subtask {
    /// Subtask without dependencies or requirements.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subtask_type: "general".to_string(),
            description: description.into(),
            dependencies: Vec::new(),
            required_capabilities: Vec::new(),
            estimated_duration_ms: 0,
        }
    }

    /// Replace the dependency list.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the required capabilities.
    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// True when every dependency is in `completed`.
    pub fn is_ready(&self, completed: &HashSet<String>) -> bool {
        self.dependencies.iter().all(|d| completed.contains(d))
    }

    /// Dependencies not in `completed`, in declaration order.
    pub fn missing_dependencies(&self, completed: &HashSet<String>) -> Vec<String> {
        self.dependencies
            .iter()
            .filter(|d| !completed.contains(*d))
            .cloned()
            .collect()
    }
}

/// Parallel/sequential partition of a decomposition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    /// Subtasks without dependencies, run concurrently first.
    #[serde(default)]
    pub parallelizable: Vec<String>,
    /// Subtasks run one by one afterwards, dependencies first.
    #[serde(default)]
    pub sequential: Vec<String>,
}

impl ExecutionPlan {
    /// Plan from both phases.
    pub fn new(parallelizable: Vec<String>, sequential: Vec<String>) -> Self {
        Self {
            parallelizable,
            sequential,
        }
    }

    /// Ids across both phases.
    pub fn len(&self) -> usize {
        self.parallelizable.len() + self.sequential.len()
    }

    /// True when neither phase has ids.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every id that appears in the plan, parallel phase first.
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.parallelizable.iter().chain(self.sequential.iter())
    }

    /// Fails when the plan names an id that is not one of `subtasks`.
    pub fn check_known(&self, subtasks: &[Subtask]) -> ConductorResult<()> {
        let known: HashSet<&str> = subtasks.iter().map(|s| s.id.as_str()).collect();
        match self.ids().find(|id| !known.contains(id.as_str())) {
            Some(unknown) => Err(ConductorError::InvalidPlan(format!(
                "plan references unknown subtask '{unknown}'"
            ))),
            None => Ok(()),
        }
    }

    /// Full structural validation of a plan against its subtasks.
    pub fn validate(&self, subtasks: &[Subtask]) -> ConductorResult<()> {
        let mut seen_subtasks = HashSet::new();
        for subtask in subtasks {
            if !seen_subtasks.insert(subtask.id.as_str()) {
                return Err(ConductorError::InvalidPlan(format!(
                    "duplicate subtask id '{}'",
                    subtask.id
                )));
            }
        }

        self.check_known(subtasks)?;

        let mut planned = HashSet::new();
        for id in self.ids() {
            if !planned.insert(id.as_str()) {
                return Err(ConductorError::InvalidPlan(format!(
                    "subtask '{id}' appears more than once in the plan"
                )));
            }
        }
        if let Some(missing) = subtasks.iter().find(|s| !planned.contains(s.id.as_str())) {
            return Err(ConductorError::InvalidPlan(format!(
                "subtask '{}' is not scheduled",
                missing.id
            )));
        }

        let by_id: HashMap<&str, &Subtask> =
            subtasks.iter().map(|s| (s.id.as_str(), s)).collect();
        for subtask in subtasks {
            if let Some(dep) = subtask
                .dependencies
                .iter()
                .find(|d| !by_id.contains_key(d.as_str()))
            {
                return Err(ConductorError::InvalidPlan(format!(
                    "subtask '{}' depends on unknown subtask '{dep}'",
                    subtask.id
                )));
            }
        }

        if has_cycle(subtasks) {
            return Err(ConductorError::InvalidPlan(
                "dependency cycle detected".to_string(),
            ));
        }

        for id in &self.parallelizable {
            if by_id.get(id.as_str()).is_some_and(|s| !s.dependencies.is_empty()) {
                return Err(ConductorError::InvalidPlan(format!(
                    "parallel subtask '{id}' has dependencies"
                )));
            }
        }

        let mut done: HashSet<String> = self.parallelizable.iter().cloned().collect();
        for id in &self.sequential {
            if let Some(subtask) = by_id.get(id.as_str()) {
                let missing = subtask.missing_dependencies(&done);
                if !missing.is_empty() {
                    return Err(ConductorError::InvalidPlan(format!(
                        "sequential subtask '{id}' scheduled before {missing:?}"
                    )));
                }
            }
            done.insert(id.clone());
        }

        Ok(())
    }
}

/// Result of decomposing a compound task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decomposition {
    /// Every subtask.
    pub subtasks: Vec<Subtask>,
    /// Order to run them in.
    pub execution_plan: ExecutionPlan,
}

/// Outcome of running one subtask on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskResult {
    /// Id of the subtask.
    pub subtask_id: String,
    /// Worker that ran it.
    pub worker: Option<String>,
    /// False if the worker reported an error.
    pub success: bool,
    /// Worker output, `null` on failure.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Failure reason.
    #[serde(default)]
    pub error: Option<String>,
    /// Execution time on the worker.
    pub duration_ms: u64,
}

/// Detect a cycle in the dependency graph (DFS with in-progress marking).
pub fn has_cycle(subtasks: &[Subtask]) -> bool {
    let by_id: HashMap<&str, &Subtask> = subtasks.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut visited: HashMap<&str, u8> = HashMap::new();
    subtasks
        .iter()
        .any(|s| dfs_cycle(s.id.as_str(), &by_id, &mut visited))
}

fn dfs_cycle<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a Subtask>,
    visited: &mut HashMap<&'a str, u8>,
) -> bool {
    match visited.get(id) {
        Some(1) => return true,
        Some(2) => return false,
        _ => {}
    }
    visited.insert(id, 1);
    if let Some(&subtask) = by_id.get(id) {
        for dep in &subtask.dependencies {
            if dfs_cycle(dep.as_str(), by_id, visited) {
                return true;
            }
        }
    }
    visited.insert(id, 2);
    false
}
