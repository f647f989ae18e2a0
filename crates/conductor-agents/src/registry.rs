use crate::handle::AgentHandle;
use conductor_core::{
    AgentInfo, ConductorError, ConductorResult, Event, EventBus, HealthStatus,
};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct AgentEntry {
    handle: Arc<dyn AgentHandle>,
    info: AgentInfo,
}

/// Agents stored once; indices hold names only.
#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentEntry>,
    order: Vec<String>,
    by_type: HashMap<String, Vec<String>>,
    by_capability: HashMap<String, Vec<String>>,
}

impl RegistryState {
    fn insert(&mut self, handle: Arc<dyn AgentHandle>, info: AgentInfo) {
        let name = info.descriptor.name.clone();
        self.by_type
            .entry(info.descriptor.agent_type.clone())
            .or_default()
            .push(name.clone());
        for cap in &info.descriptor.capabilities {
            let names = self.by_capability.entry(cap.clone()).or_default();
            if !names.contains(&name) {
                names.push(name.clone());
            }
        }
        self.order.push(name.clone());
        self.agents.insert(name, AgentEntry { handle, info });
    }

    fn remove(&mut self, name: &str) -> Option<AgentEntry> {
        let entry = self.agents.remove(name)?;
        self.order.retain(|n| n != name);
        prune_index(&mut self.by_type, name);
        prune_index(&mut self.by_capability, name);
        Some(entry)
    }
}

fn prune_index(index: &mut HashMap<String, Vec<String>>, name: &str) {
    index.retain(|_, names| {
        names.retain(|n| n != name);
        !names.is_empty()
    });
}

/// Point-in-time copy of the registry, used by the selector without holding locks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySnapshot {
    /// Agents in registration order.
    pub agents: Vec<AgentInfo>,
    /// Agent type to names, registration order.
    pub by_type: HashMap<String, Vec<String>>,
    /// Capability to names, registration order.
    pub by_capability: HashMap<String, Vec<String>>,
}

impl RegistrySnapshot {
    /// Build a snapshot directly from agent infos (indices derived in order).
    pub fn from_agents(agents: Vec<AgentInfo>) -> Self {
        let mut by_type: HashMap<String, Vec<String>> = HashMap::new();
        let mut by_capability: HashMap<String, Vec<String>> = HashMap::new();
        for agent in &agents {
            by_type
                .entry(agent.descriptor.agent_type.clone())
                .or_default()
                .push(agent.name().to_string());
            for cap in &agent.descriptor.capabilities {
                by_capability
                    .entry(cap.clone())
                    .or_default()
                    .push(agent.name().to_string());
            }
        }
        Self {
            agents,
            by_type,
            by_capability,
        }
    }

    /// Agent by name.
    pub fn get(&self, name: &str) -> Option<&AgentInfo> {
        self.agents.iter().find(|a| a.name() == name)
    }

    /// Names of agents declaring `capability`.
    pub fn with_capability(&self, capability: &str) -> &[String] {
        self.by_capability
            .get(capability)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Names of agents of `agent_type`.
    pub fn of_type(&self, agent_type: &str) -> &[String] {
        self.by_type
            .get(agent_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Result of one health-check pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSummary {
    /// Agents that passed.
    pub healthy: usize,
    /// Agents that failed.
    pub unhealthy: usize,
}

/// Single source of truth for known agents and their indices.
///
/// All three indices (name, type, capability) live behind one lock so that a
/// register or unregister call is observed as a single update.
pub struct AgentRegistry {
    state: RwLock<RegistryState>,
    events: Arc<EventBus>,
}

impl AgentRegistry {
    /// Empty registry publishing on `events`.
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            events,
        }
    }

    /// Bus registry events are published on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Register an agent.
    ///
    /// Re-registering an identical descriptor replaces the handle; a different
    /// descriptor under an existing name is rejected with `DuplicateAgent`.
    pub fn register(&self, handle: Arc<dyn AgentHandle>) -> ConductorResult<()> {
        let descriptor = handle.descriptor().clone();
        if descriptor.name.trim().is_empty() {
            return Err(ConductorError::Validation(
                "agent name must not be empty".to_string(),
            ));
        }

        let info = {
            let mut state = self.state.write();
            match state.agents.get_mut(&descriptor.name) {
                Some(existing) if existing.info.descriptor != descriptor => {
                    return Err(ConductorError::DuplicateAgent(descriptor.name));
                }
                Some(existing) => {
                    existing.handle = handle;
                    existing.info.clone()
                }
                None => {
                    let info = AgentInfo::new(descriptor);
                    state.insert(handle, info.clone());
                    info
                }
            }
        };

        info!(
            agent = %info.name(),
            agent_type = %info.descriptor.agent_type,
            capabilities = ?info.descriptor.capabilities,
            "Registered agent"
        );
        self.events.publish(Event::AgentRegistered { agent: info });
        Ok(())
    }

    /// Remove an agent from every index and run its shutdown hook.
    pub async fn unregister(&self, name: &str) -> ConductorResult<()> {
        let entry = self
            .state
            .write()
            .remove(name)
            .ok_or_else(|| ConductorError::AgentNotFound(name.to_string()))?;

        if let Err(e) = entry.handle.shutdown().await {
            warn!(agent = %name, error = %e, "Agent shutdown hook failed");
        }

        info!(agent = %name, "Unregistered agent");
        self.events.publish(Event::AgentUnregistered {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Unregister every agent (process shutdown).
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.state.read().order.clone();
        for name in names {
            if let Err(e) = self.unregister(&name).await {
                debug!(agent = %name, error = %e, "Agent already gone during shutdown");
            }
        }
    }

    /// Copy of one agent's info.
    pub fn get(&self, name: &str) -> Option<AgentInfo> {
        self.state.read().agents.get(name).map(|e| e.info.clone())
    }

    /// Handle to call the agent.
    pub fn handle(&self, name: &str) -> Option<Arc<dyn AgentHandle>> {
        self.state.read().agents.get(name).map(|e| e.handle.clone())
    }

    /// True if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.state.read().agents.contains_key(name)
    }

    /// All agents in registration order.
    pub fn list(&self) -> Vec<AgentInfo> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|n| state.agents.get(n).map(|e| e.info.clone()))
            .collect()
    }

    /// Registered agents.
    pub fn len(&self) -> usize {
        self.state.read().agents.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names declaring `capability`, registration order.
    pub fn by_capability(&self, capability: &str) -> Vec<String> {
        self.state
            .read()
            .by_capability
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }

    /// Names of type `agent_type`, registration order.
    pub fn by_type(&self, agent_type: &str) -> Vec<String> {
        self.state
            .read()
            .by_type
            .get(agent_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Count every reference to `name` across the arena, order list and indices.
    pub fn index_references(&self, name: &str) -> usize {
        let state = self.state.read();
        let in_arena = usize::from(state.agents.contains_key(name));
        let in_order = state.order.iter().filter(|n| *n == name).count();
        let count = |index: &HashMap<String, Vec<String>>| {
            index
                .values()
                .map(|names| names.iter().filter(|n| *n == name).count())
                .sum::<usize>()
        };
        in_arena + in_order + count(&state.by_type) + count(&state.by_capability)
    }

    /// Consistent copy of agents and indices taken under one read lock.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read();
        RegistrySnapshot {
            agents: state
                .order
                .iter()
                .filter_map(|n| state.agents.get(n).map(|e| e.info.clone()))
                .collect(),
            by_type: state.by_type.clone(),
            by_capability: state.by_capability.clone(),
        }
    }

    /// Record a health observation. Returns true when the status changed;
    /// transitions into healthy or unhealthy are published.
    pub fn set_health(
        &self,
        name: &str,
        status: HealthStatus,
        error: Option<String>,
    ) -> ConductorResult<bool> {
        let previous = {
            let mut state = self.state.write();
            let entry = state
                .agents
                .get_mut(name)
                .ok_or_else(|| ConductorError::AgentNotFound(name.to_string()))?;
            std::mem::replace(&mut entry.info.status, status)
        };

        if previous == status {
            return Ok(false);
        }

        info!(agent = %name, from = %previous, to = %status, "Agent health changed");
        match status {
            HealthStatus::Healthy => {
                self.events.publish(Event::AgentHealthy {
                    name: name.to_string(),
                });
            }
            HealthStatus::Unhealthy => {
                self.events.publish(Event::AgentUnhealthy {
                    name: name.to_string(),
                    error,
                });
            }
            HealthStatus::Unknown => {}
        }
        Ok(true)
    }

    /// Health-check every agent concurrently and apply the observed health.
    pub async fn check_health(&self) -> HealthSummary {
        let handles: Vec<(String, Arc<dyn AgentHandle>)> = {
            let state = self.state.read();
            state
                .order
                .iter()
                .filter_map(|n| state.agents.get(n).map(|e| (n.clone(), e.handle.clone())))
                .collect()
        };

        let results = join_all(handles.into_iter().map(|(name, handle)| async move {
            let result = handle.health_check().await;
            (name, result)
        }))
        .await;

        let mut summary = HealthSummary::default();
        for (name, result) in results {
            let applied = match result {
                Ok(()) => {
                    summary.healthy += 1;
                    self.set_health(&name, HealthStatus::Healthy, None)
                }
                Err(e) => {
                    summary.unhealthy += 1;
                    warn!(agent = %name, error = %e, "Agent health check failed");
                    self.set_health(&name, HealthStatus::Unhealthy, Some(e.to_string()))
                }
            };
            if let Err(e) = applied {
                debug!(agent = %name, error = %e, "Agent removed during health check");
            }
        }
        summary
    }

    /// Run [`check_health`](Self::check_health) every `interval` until `cancel` fires.
    pub fn spawn_health_monitor(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let summary = registry.check_health().await;
                debug!(
                    healthy = summary.healthy,
                    unhealthy = summary.unhealthy,
                    "Health check pass complete"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("Health monitor stopped");
        })
    }

    /// Mark an agent as having one more task in flight.
    pub fn task_started(&self, name: &str) {
        if let Some(entry) = self.state.write().agents.get_mut(name) {
            entry.info.metrics.active_tasks += 1;
        }
    }

    /// Undo [`task_started`](Self::task_started) for a task that will never
    /// report an outcome.
    pub fn task_abandoned(&self, name: &str) {
        if let Some(entry) = self.state.write().agents.get_mut(name) {
            let metrics = &mut entry.info.metrics;
            metrics.active_tasks = metrics.active_tasks.saturating_sub(1);
        }
    }

    /// Fold a finished task into the agent's rolling metrics.
    pub fn record_outcome(&self, name: &str, success: bool, duration: Duration) {
        if let Some(entry) = self.state.write().agents.get_mut(name) {
            entry
                .info
                .metrics
                .record(success, duration.as_millis() as u64);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::local::LocalAgent;
    use conductor_core::AgentDescriptor;
    use tokio::sync::mpsc;

    fn registry() -> (Arc<AgentRegistry>, mpsc::UnboundedReceiver<Event>) {
        let bus = Arc::new(EventBus::new());
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(Arc::new(tx));
        (Arc::new(AgentRegistry::new(bus)), rx)
    }

    fn agent(name: &str, agent_type: &str, caps: &[&str]) -> Arc<LocalAgent> {
        Arc::new(LocalAgent::echo(
            AgentDescriptor::new(name, agent_type).with_capabilities(caps.iter().copied()),
        ))
    }

    #[test]
    fn test_register_indexes_capabilities() {
        let (registry, mut rx) = registry();
        registry
            .register(agent("alpha", "assistant", &["a", "b"]))
            .unwrap();

        assert_eq!(registry.by_capability("a"), vec!["alpha".to_string()]);
        assert_eq!(registry.by_capability("b"), vec!["alpha".to_string()]);
        assert!(registry.by_capability("c").is_empty());
        assert_eq!(registry.by_type("assistant"), vec!["alpha".to_string()]);
        assert_eq!(rx.try_recv().unwrap().name(), "agent:registered");
    }

    #[test]
    fn test_register_identical_overwrites() {
        let (registry, _rx) = registry();
        registry.register(agent("alpha", "assistant", &["a"])).unwrap();
        registry.register(agent("alpha", "assistant", &["a"])).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.by_capability("a").len(), 1);
        assert_eq!(registry.index_references("alpha"), 4);
    }

    #[test]
    fn test_register_conflicting_descriptor_fails() {
        let (registry, _rx) = registry();
        registry.register(agent("alpha", "assistant", &["a"])).unwrap();
        let err = registry
            .register(agent("alpha", "knowledge", &["a"]))
            .unwrap_err();
        assert!(matches!(err, ConductorError::DuplicateAgent(name) if name == "alpha"));
        assert_eq!(registry.get("alpha").unwrap().descriptor.agent_type, "assistant");
    }

    #[test]
    fn test_register_empty_name_rejected() {
        let (registry, _rx) = registry();
        assert!(matches!(
            registry.register(agent("  ", "assistant", &[])),
            Err(ConductorError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unregister_leaves_no_references() {
        let (registry, _rx) = registry();
        let alpha = agent("alpha", "assistant", &["a", "b"]);
        registry.register(alpha.clone()).unwrap();
        registry.register(agent("beta", "assistant", &["b"])).unwrap();

        registry.unregister("alpha").await.unwrap();

        assert_eq!(registry.index_references("alpha"), 0);
        assert!(registry.by_capability("a").is_empty());
        assert_eq!(registry.by_capability("b"), vec!["beta".to_string()]);
        assert_eq!(registry.by_type("assistant"), vec!["beta".to_string()]);
        assert_eq!(alpha.shutdown_count(), 1);
        let snapshot = registry.snapshot();
        assert!(!snapshot.by_capability.contains_key("a"));
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_not_found() {
        let (registry, _rx) = registry();
        assert!(matches!(
            registry.unregister("ghost").await,
            Err(ConductorError::AgentNotFound(_))
        ));
    }

    #[test]
    fn test_health_transitions_publish_once() {
        let (registry, mut rx) = registry();
        registry.register(agent("alpha", "assistant", &[])).unwrap();
        let _ = rx.try_recv();

        assert!(registry
            .set_health("alpha", HealthStatus::Healthy, None)
            .unwrap());
        assert!(!registry
            .set_health("alpha", HealthStatus::Healthy, None)
            .unwrap());
        assert!(registry
            .set_health("alpha", HealthStatus::Unhealthy, Some("down".into()))
            .unwrap());

        assert_eq!(rx.try_recv().unwrap().name(), "agent:healthy");
        match rx.try_recv().unwrap() {
            Event::AgentUnhealthy { name, error } => {
                assert_eq!(name, "alpha");
                assert_eq!(error.as_deref(), Some("down"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_check_health_applies_results() {
        let (registry, _rx) = registry();
        let up = agent("up", "assistant", &[]);
        let down = agent("down", "assistant", &[]);
        down.set_healthy(false);
        registry.register(up).unwrap();
        registry.register(down).unwrap();

        let summary = registry.check_health().await;
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.unhealthy, 1);
        assert!(registry.get("up").unwrap().is_healthy());
        assert_eq!(registry.get("down").unwrap().status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_health_monitor_stops_on_cancel() {
        let (registry, _rx) = registry();
        registry.register(agent("up", "assistant", &[])).unwrap();
        let cancel = CancellationToken::new();
        let handle = registry.spawn_health_monitor(Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(registry.get("up").unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_concurrent_register_unregister_keeps_indices_consistent() {
        let (registry, _rx) = registry();
        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let name = format!("agent-{i}");
                registry
                    .register(agent(&name, "assistant", &["shared", "x"]))
                    .unwrap();
                if i % 2 == 0 {
                    registry.unregister(&name).await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(registry.len(), 16);
        assert_eq!(registry.by_capability("shared").len(), 16);
        assert_eq!(registry.by_type("assistant").len(), 16);
        for i in (0..32).step_by(2) {
            assert_eq!(registry.index_references(&format!("agent-{i}")), 0);
        }
    }

    #[test]
    fn test_record_outcome_updates_metrics() {
        let (registry, _rx) = registry();
        registry.register(agent("alpha", "assistant", &[])).unwrap();
        registry.task_started("alpha");
        assert_eq!(registry.get("alpha").unwrap().metrics.active_tasks, 1);
        registry.record_outcome("alpha", false, Duration::from_millis(40));
        let metrics = registry.get("alpha").unwrap().metrics;
        assert_eq!(metrics.active_tasks, 0);
        assert_eq!(metrics.failed_tasks, 1);
        assert!(metrics.success_rate < 0.01);
    }
}
