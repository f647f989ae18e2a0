use conductor_agents::RegistrySnapshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// How a worker is chosen among the eligible ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Cycle through eligible workers in pool order.
    #[default]
    RoundRobin,
    /// Fewest active tasks first; ties go to the earlier worker.
    LeastLoaded,
}

/// One occupied slot on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    /// Compound task the slot was claimed for.
    pub task_id: Uuid,
    /// Identity of the claim; only its holder frees the slot.
    pub claim_id: Uuid,
}

/// An executable unit able to run subtasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    /// Worker id; the name of the agent it mirrors.
    pub id: String,
    /// Capabilities a subtask may require of this worker.
    pub capabilities: Vec<String>,
    /// Occupied slots, always equal to `slots.len()`.
    pub active_tasks: u32,
    /// Slot count; at least 1.
    pub max_concurrent: u32,
    /// False while the backing agent is unhealthy.
    pub available: bool,
    /// Claims currently holding a slot on this worker.
    pub slots: Vec<Slot>,
}

impl Worker {
    /// Idle, available worker with `max_concurrent` slots.
    pub fn new<I, S>(id: impl Into<String>, capabilities: I, max_concurrent: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            active_tasks: 0,
            max_concurrent: max_concurrent.max(1),
            available: true,
            slots: Vec::new(),
        }
    }

    /// Available, below its concurrency limit and advertising every required capability.
    pub fn can_run(&self, required: &[String]) -> bool {
        self.available
            && self.active_tasks < self.max_concurrent
            && required.iter().all(|r| self.capabilities.contains(r))
    }

    /// True if any slot is held for `task_id`.
    pub fn is_bound_to(&self, task_id: Uuid) -> bool {
        self.slots.iter().any(|s| s.task_id == task_id)
    }

    fn claim(&mut self, task_id: Uuid) -> Uuid {
        let claim_id = Uuid::new_v4();
        self.active_tasks += 1;
        self.slots.push(Slot { task_id, claim_id });
        claim_id
    }

    /// Free the slot held by `claim_id`. Returns false if no such claim exists.
    fn release(&mut self, claim_id: Uuid) -> bool {
        match self.slots.iter().position(|s| s.claim_id == claim_id) {
            Some(pos) => {
                self.slots.swap_remove(pos);
                self.active_tasks = self.active_tasks.saturating_sub(1);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct PoolState {
    workers: Vec<Worker>,
    rr_counter: usize,
}

impl PoolState {
    fn pick(&mut self, strategy: SelectionStrategy, required: &[String]) -> Option<usize> {
        let eligible: Vec<usize> = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.can_run(required))
            .map(|(i, _)| i)
            .collect();
        if eligible.is_empty() {
            return None;
        }
        match strategy {
            SelectionStrategy::RoundRobin => {
                let idx = eligible[self.rr_counter % eligible.len()];
                self.rr_counter = self.rr_counter.wrapping_add(1);
                Some(idx)
            }
            SelectionStrategy::LeastLoaded => eligible
                .into_iter()
                .min_by_key(|&i| self.workers[i].active_tasks),
        }
    }
}

/// Bounded set of workers. Selection and claiming happen under one lock so
/// two dispatchers can never take the last free slot of the same worker.
pub struct WorkerPool {
    state: Mutex<PoolState>,
    strategy: SelectionStrategy,
}

impl WorkerPool {
    /// Empty pool using `strategy`.
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            strategy,
        }
    }

    /// Strategy used by [`select`](Self::select) and [`try_claim`](Self::try_claim).
    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Add a worker, replacing the static fields of one with the same id.
    pub fn add_worker(&self, worker: Worker) {
        let mut state = self.state.lock();
        match state.workers.iter_mut().find(|w| w.id == worker.id) {
            Some(existing) => {
                existing.capabilities = worker.capabilities;
                existing.max_concurrent = worker.max_concurrent;
                existing.available = worker.available;
            }
            None => state.workers.push(worker),
        }
    }

    /// Remove a worker. Claims on it are forgotten.
    pub fn remove_worker(&self, id: &str) -> Option<Worker> {
        let mut state = self.state.lock();
        let pos = state.workers.iter().position(|w| w.id == id)?;
        Some(state.workers.remove(pos))
    }

    /// Mark a worker available or not; false if it is unknown.
    pub fn set_available(&self, id: &str, available: bool) -> bool {
        match self.state.lock().workers.iter_mut().find(|w| w.id == id) {
            Some(worker) => {
                worker.available = available;
                true
            }
            None => false,
        }
    }

    /// Mirror the registry: one worker per agent, available while healthy.
    /// Workers for agents no longer registered are dropped.
    pub fn sync_from_snapshot(&self, snapshot: &RegistrySnapshot, max_concurrent: u32) {
        {
            let mut state = self.state.lock();
            state
                .workers
                .retain(|w| snapshot.get(&w.id).is_some());
        }
        for agent in &snapshot.agents {
            let mut worker = Worker::new(
                agent.name(),
                agent.descriptor.capabilities.iter().cloned(),
                max_concurrent,
            );
            worker.available = agent.is_healthy();
            self.add_worker(worker);
        }
        debug!(workers = snapshot.agents.len(), "Worker pool synced from registry");
    }

    /// Pick a worker for `required` without claiming it. Advances the
    /// round-robin counter.
    pub fn select(&self, required: &[String]) -> Option<String> {
        let mut state = self.state.lock();
        let idx = state.pick(self.strategy, required)?;
        Some(state.workers[idx].id.clone())
    }

    /// Atomically pick an eligible worker and bind one of its slots to
    /// `task_id`. Returns the worker id and the claim id that frees the slot.
    pub fn try_claim(&self, required: &[String], task_id: Uuid) -> Option<(String, Uuid)> {
        let mut state = self.state.lock();
        let idx = state.pick(self.strategy, required)?;
        let worker = &mut state.workers[idx];
        let claim_id = worker.claim(task_id);
        Some((worker.id.clone(), claim_id))
    }

    /// Release the slot of `worker_id` held by `claim_id`.
    pub fn release(&self, worker_id: &str, claim_id: Uuid) -> bool {
        self.state
            .lock()
            .workers
            .iter_mut()
            .find(|w| w.id == worker_id)
            .is_some_and(|w| w.release(claim_id))
    }

    /// Ids of workers with at least one slot held for `task_id`.
    pub fn bound_to(&self, task_id: Uuid) -> Vec<String> {
        self.state
            .lock()
            .workers
            .iter()
            .filter(|w| w.is_bound_to(task_id))
            .map(|w| w.id.clone())
            .collect()
    }

    /// Copy of every worker.
    pub fn workers(&self) -> Vec<Worker> {
        self.state.lock().workers.clone()
    }

    /// Copy of one worker.
    pub fn get(&self, id: &str) -> Option<Worker> {
        self.state.lock().workers.iter().find(|w| w.id == id).cloned()
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.state.lock().workers.len()
    }

    /// True when the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Slot held on a worker; released when dropped.
pub(crate) struct WorkerClaim<'a> {
    pool: &'a WorkerPool,
    worker_id: String,
    claim_id: Uuid,
}

impl<'a> WorkerClaim<'a> {
    pub(crate) fn new(pool: &'a WorkerPool, worker_id: String, claim_id: Uuid) -> Self {
        Self {
            pool,
            worker_id,
            claim_id,
        }
    }

    pub(crate) fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

impl Drop for WorkerClaim<'_> {
    fn drop(&mut self) {
        self.pool.release(&self.worker_id, self.claim_id);
    }
}
