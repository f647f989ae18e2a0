//! Agent selection and negotiation.
//!
//! Both operations are pure functions over a [`RegistrySnapshot`]: they hold
//! no locks and have no side effects, so the same snapshot always yields the
//! same answer.

use crate::config::default_intent_routes;
use crate::registry::RegistrySnapshot;
use conductor_core::{AgentInfo, AgentMetrics, ConductorError, ConductorResult, IntentKind, Task};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

const BASE_SCORE: f64 = 100.0;
const EXTRA_CAPABILITY_PENALTY: f64 = 2.0;
const SUCCESS_RATE_WEIGHT: f64 = 0.5;
const SLOW_THRESHOLD_MS: f64 = 5000.0;
const SLOW_PENALTY_DIVISOR: f64 = 100.0;
const PREFERRED_TYPE_BONUS: f64 = 20.0;

/// Optional constraints on a negotiation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    /// Only agents of this type are considered.
    #[serde(default)]
    pub agent_type: Option<String>,
    /// Agents of this type receive a score bonus.
    #[serde(default)]
    pub preferred_type: Option<String>,
    /// Agents slower than this on average are excluded.
    #[serde(default)]
    pub max_response_time_ms: Option<f64>,
}

/// Request to rank agents able to take on some work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationRequest {
    /// The requesting agent; never offered as its own candidate.
    pub from: String,
    /// Capabilities every candidate must have.
    pub requirements: Vec<String>,
    /// Filters and bonuses.
    #[serde(default)]
    pub preferences: Preferences,
}

/// One ranked agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationCandidate {
    /// Agent name.
    pub agent: String,
    /// Agent type.
    #[serde(rename = "type")]
    pub agent_type: String,
    /// Higher is better.
    pub score: f64,
    /// Declared capabilities.
    pub capabilities: Vec<String>,
    /// Metrics the score was computed from.
    pub metrics: AgentMetrics,
}

/// Ranked candidates, best first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationOutcome {
    /// Every eligible agent, sorted by score.
    pub candidates: Vec<NegotiationCandidate>,
    /// The top candidate, if any.
    pub recommended: Option<NegotiationCandidate>,
}

/// Routes tasks to agents.
#[derive(Debug, Clone)]
pub struct AgentSelector {
    intent_routes: HashMap<IntentKind, String>,
}

impl Default for AgentSelector {
    fn default() -> Self {
        Self::new(default_intent_routes())
    }
}

impl AgentSelector {
    /// Selector using `intent_routes` for intent-based routing.
    pub fn new(intent_routes: HashMap<IntentKind, String>) -> Self {
        Self { intent_routes }
    }

    /// Intent kind to agent type.
    pub fn intent_routes(&self) -> &HashMap<IntentKind, String> {
        &self.intent_routes
    }

    /// Pick the agent that should run `task`. First matching rule wins:
    /// explicit target, suggested agent, capability match, intent route,
    /// any healthy agent.
    pub fn select(&self, snapshot: &RegistrySnapshot, task: &Task) -> ConductorResult<String> {
        if let Some(target) = &task.target_agent {
            return match snapshot.get(target) {
                Some(agent) => Ok(agent.name().to_string()),
                None => Err(ConductorError::AgentNotFound(target.clone())),
            };
        }

        if let Some(suggested) = task
            .intent
            .as_ref()
            .and_then(|i| i.suggested_agent.as_deref())
        {
            if snapshot.get(suggested).is_some_and(AgentInfo::is_healthy) {
                debug!(task_id = %task.id, agent = %suggested, "Selected suggested agent");
                return Ok(suggested.to_string());
            }
        }

        if let Some(first) = task.required_capabilities.first() {
            let found = snapshot
                .with_capability(first)
                .iter()
                .filter_map(|name| snapshot.get(name))
                .find(|a| a.is_healthy() && a.descriptor.covers(&task.required_capabilities));
            if let Some(agent) = found {
                debug!(task_id = %task.id, agent = %agent.name(), "Selected by capability");
                return Ok(agent.name().to_string());
            }
        }

        if let Some(agent_type) = task
            .intent
            .as_ref()
            .and_then(|i| self.intent_routes.get(&i.kind))
        {
            let found = snapshot
                .of_type(agent_type)
                .iter()
                .filter_map(|name| snapshot.get(name))
                .find(|a| a.is_healthy());
            if let Some(agent) = found {
                debug!(task_id = %task.id, agent = %agent.name(), "Selected by intent route");
                return Ok(agent.name().to_string());
            }
        }

        snapshot
            .agents
            .iter()
            .find(|a| a.is_healthy())
            .map(|a| a.name().to_string())
            .ok_or(ConductorError::NoSuitableAgent(task.id))
    }

    /// Rank healthy agents that satisfy `request`, best first.
    pub fn negotiate(
        &self,
        snapshot: &RegistrySnapshot,
        request: &NegotiationRequest,
    ) -> NegotiationOutcome {
        let prefs = &request.preferences;
        let mut candidates: Vec<NegotiationCandidate> = snapshot
            .agents
            .iter()
            .filter(|a| a.name() != request.from)
            .filter(|a| a.is_healthy())
            .filter(|a| a.descriptor.covers(&request.requirements))
            .filter(|a| {
                prefs
                    .agent_type
                    .as_ref()
                    .is_none_or(|t| *t == a.descriptor.agent_type)
            })
            .filter(|a| {
                prefs
                    .max_response_time_ms
                    .is_none_or(|max| a.metrics.avg_response_time_ms <= max)
            })
            .map(|a| NegotiationCandidate {
                agent: a.name().to_string(),
                agent_type: a.descriptor.agent_type.clone(),
                score: score(a, &request.requirements, prefs),
                capabilities: a.descriptor.capabilities.clone(),
                metrics: a.metrics.clone(),
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    a.metrics
                        .avg_response_time_ms
                        .partial_cmp(&b.metrics.avg_response_time_ms)
                        .unwrap_or(Ordering::Equal)
                })
        });

        debug!(
            from = %request.from,
            candidates = candidates.len(),
            "Negotiation ranked candidates"
        );

        NegotiationOutcome {
            recommended: candidates.first().cloned(),
            candidates,
        }
    }
}

/// Negotiation score of one agent, floored at zero.
pub fn score(agent: &AgentInfo, requirements: &[String], prefs: &Preferences) -> f64 {
    let extra = agent
        .descriptor
        .capabilities
        .iter()
        .filter(|c| !requirements.contains(c))
        .count() as f64;

    let mut score = BASE_SCORE - EXTRA_CAPABILITY_PENALTY * extra
        + SUCCESS_RATE_WEIGHT * agent.metrics.success_rate;

    let avg = agent.metrics.avg_response_time_ms;
    if avg > SLOW_THRESHOLD_MS {
        score -= (avg - SLOW_THRESHOLD_MS) / SLOW_PENALTY_DIVISOR;
    }

    if prefs
        .preferred_type
        .as_ref()
        .is_some_and(|t| *t == agent.descriptor.agent_type)
    {
        score += PREFERRED_TYPE_BONUS;
    }

    score.max(0.0)
}
