//! Coordinator
//!
//! Registry of agents and their capabilities with:
//! - Capability routing (first registered match wins)
//! - Bounded pending queue for unmatched tasks
//! - Optional bounded executor for async dispatch
//! - Health and metrics snapshots

use crate::agent::{Agent, AgentError, Payload};
use crate::config::{ConfigError, CoordinatorConfig};
use crate::executor::{BoundedExecutor, ExecutionError, ExecutorMetrics, TaskHooks};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Coordinator errors
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Agent {0} already registered")]
    DuplicateAgent(String),

    #[error("Agent {0} not found")]
    AgentNotFound(String),

    #[error("No agent found for capability '{0}'")]
    NoCapableAgent(String),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Task {task_id} timed out after {timeout:?}")]
    Timeout { task_id: String, timeout: Duration },

    #[error("Executor is closed")]
    ExecutorClosed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<ExecutionError<AgentError>> for CoreError {
    fn from(err: ExecutionError<AgentError>) -> Self {
        match err {
            ExecutionError::Timeout { task_id, timeout } => Self::Timeout { task_id, timeout },
            ExecutionError::Closed => Self::ExecutorClosed,
            ExecutionError::Failed(e) => Self::Agent(e),
        }
    }
}

/// Unit of work routed by capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub payload: Payload,
    pub required_capability: String,
}

impl Task {
    /// Task with a generated id
    pub fn new(required_capability: &str, payload: Payload) -> Self {
        Self::with_id(&Uuid::new_v4().to_string(), required_capability, payload)
    }

    pub fn with_id(id: &str, required_capability: &str, payload: Payload) -> Self {
        Self {
            id: id.to_string(),
            payload,
            required_capability: required_capability.to_string(),
        }
    }
}

/// Task waiting for a capable agent
#[derive(Debug, Clone, Serialize)]
pub struct PendingTask {
    pub task: Task,
    pub queued_at: DateTime<Utc>,
}

/// Outcome of one task drained from the pending queue
#[derive(Debug)]
pub struct DrainedTask {
    pub task_id: String,
    pub result: Result<Value, CoreError>,
}

/// Per-agent outcome of `start_async`
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl StartupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Per-agent outcome of `stop_async`
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentCounts {
    pub total: usize,
    pub active: usize,
}

/// Health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub is_running: bool,
    pub agents: AgentCounts,
    pub queued_tasks: usize,
    pub timestamp: DateTime<Utc>,
}

/// Metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorMetrics {
    pub total_agents: usize,
    pub active_agents: usize,
    pub total_tasks: u64,
    pub queued_tasks: usize,
    pub system_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorMetrics>,
}

struct AgentEntry {
    id: String,
    agent: Arc<dyn Agent>,
    capabilities: BTreeSet<String>,
}

/// Agents in registration order
#[derive(Default)]
struct Registry {
    entries: Vec<AgentEntry>,
}

impl Registry {
    fn get(&self, id: &str) -> Option<&AgentEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    fn find_capable(&self, capability: &str) -> Option<&AgentEntry> {
        self.entries
            .iter()
            .find(|e| e.capabilities.contains(capability))
    }
}

/// Routes tasks to registered agents by capability
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: RwLock<Registry>,
    pending: Mutex<VecDeque<PendingTask>>,
    running: AtomicBool,
    total_tasks: AtomicU64,
    executor: Option<Arc<BoundedExecutor<Value>>>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::build(CoordinatorConfig::default(), None)
    }
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self::build(config, None))
    }

    /// Coordinator whose async dispatch runs through `executor`
    pub fn with_executor(
        config: CoordinatorConfig,
        executor: Arc<BoundedExecutor<Value>>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self::build(config, Some(executor)))
    }

    fn build(config: CoordinatorConfig, executor: Option<Arc<BoundedExecutor<Value>>>) -> Self {
        Self {
            config,
            registry: RwLock::new(Registry::default()),
            pending: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            total_tasks: AtomicU64::new(0),
            executor,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn executor(&self) -> Option<&Arc<BoundedExecutor<Value>>> {
        self.executor.as_ref()
    }

    // ============ Registry ============

    /// Register an agent under `agent_id` with a fixed capability set
    pub fn register_agent<I, S>(
        &self,
        agent_id: &str,
        agent: Arc<dyn Agent>,
        capabilities: I,
    ) -> Result<(), CoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let capabilities: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();

        let mut registry = self.registry.write();
        if registry.get(agent_id).is_some() {
            warn!("Agent {} already registered", agent_id);
            return Err(CoreError::DuplicateAgent(agent_id.to_string()));
        }

        info!(
            "Registered agent {} with capabilities: {:?}",
            agent_id, capabilities
        );
        registry.entries.push(AgentEntry {
            id: agent_id.to_string(),
            agent,
            capabilities,
        });
        Ok(())
    }

    /// Register an agent, then await its startup
    pub async fn register_agent_async<I, S>(
        &self,
        agent_id: &str,
        agent: Arc<dyn Agent>,
        capabilities: I,
    ) -> Result<(), CoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register_agent(agent_id, Arc::clone(&agent), capabilities)?;
        agent.start_async().await.map_err(|e| {
            error!("Failed to start agent {}: {}", agent_id, e);
            CoreError::Agent(e)
        })
    }

    /// Remove an agent and its capabilities. The agent itself is not stopped.
    pub fn unregister_agent(&self, agent_id: &str) -> Result<Arc<dyn Agent>, CoreError> {
        let mut registry = self.registry.write();
        let pos = registry
            .entries
            .iter()
            .position(|e| e.id == agent_id)
            .ok_or_else(|| CoreError::AgentNotFound(agent_id.to_string()))?;

        let entry = registry.entries.remove(pos);
        info!("Unregistered agent {}", agent_id);
        Ok(entry.agent)
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Arc<dyn Agent>, CoreError> {
        self.registry
            .read()
            .get(agent_id)
            .map(|e| Arc::clone(&e.agent))
            .ok_or_else(|| CoreError::AgentNotFound(agent_id.to_string()))
    }

    /// Snapshot of all registered agents by id
    pub fn get_all_agents(&self) -> HashMap<String, Arc<dyn Agent>> {
        self.registry
            .read()
            .entries
            .iter()
            .map(|e| (e.id.clone(), Arc::clone(&e.agent)))
            .collect()
    }

    pub fn agent_capabilities(&self, agent_id: &str) -> Result<BTreeSet<String>, CoreError> {
        self.registry
            .read()
            .get(agent_id)
            .map(|e| e.capabilities.clone())
            .ok_or_else(|| CoreError::AgentNotFound(agent_id.to_string()))
    }

    fn find_agent(&self, capability: &str) -> Option<(String, Arc<dyn Agent>)> {
        self.registry
            .read()
            .find_capable(capability)
            .map(|e| (e.id.clone(), Arc::clone(&e.agent)))
    }

    fn agent_counts(&self) -> AgentCounts {
        let registry = self.registry.read();
        AgentCounts {
            total: registry.entries.len(),
            active: registry
                .entries
                .iter()
                .filter(|e| e.agent.is_active())
                .count(),
        }
    }

    // ============ Lifecycle ============

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("Coordinator started");
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Coordinator stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn registered_agents(&self) -> Vec<(String, Arc<dyn Agent>)> {
        self.registry
            .read()
            .entries
            .iter()
            .map(|e| (e.id.clone(), Arc::clone(&e.agent)))
            .collect()
    }

    /// Start the coordinator, every registered agent concurrently, then the
    /// executor's cleanup loop.
    ///
    /// Agent failures are logged and collected; they never stop the others.
    pub async fn start_async(&self) -> StartupReport {
        self.start();

        let outcomes = join_all(self.registered_agents().into_iter().map(
            |(id, agent)| async move {
                let result = agent.start_async().await;
                (id, result)
            },
        ))
        .await;

        let mut report = StartupReport::default();
        for (id, result) in outcomes {
            match result {
                Ok(()) => report.started.push(id),
                Err(e) => {
                    error!("Failed to start agent {}: {}", id, e);
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        if let Some(executor) = &self.executor {
            executor.start().await;
        }

        info!(
            "Coordinator started: {} agents started, {} failed",
            report.started.len(),
            report.failed.len()
        );
        report
    }

    /// Stop every active agent concurrently, then the executor.
    ///
    /// Agent failures are logged and collected; they never stop the others.
    pub async fn stop_async(&self) -> ShutdownReport {
        self.stop();

        let active: Vec<(String, Arc<dyn Agent>)> = self
            .registered_agents()
            .into_iter()
            .filter(|(_, agent)| agent.is_active())
            .collect();

        let outcomes = join_all(active.into_iter().map(|(id, agent)| async move {
            let result = agent.stop_async().await;
            (id, result)
        }))
        .await;

        let mut report = ShutdownReport::default();
        for (id, result) in outcomes {
            match result {
                Ok(()) => report.stopped.push(id),
                Err(e) => {
                    error!("Failed to stop agent {}: {}", id, e);
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        if let Some(executor) = &self.executor {
            executor.shutdown().await;
        }

        info!(
            "Coordinator shut down: {} agents stopped, {} failed",
            report.stopped.len(),
            report.failed.len()
        );
        report
    }

    // ============ Dispatch ============

    fn enqueue(&self, task: Task) {
        let mut pending = self.pending.lock();
        if pending.len() >= self.config.task_queue_capacity {
            if let Some(dropped) = pending.pop_front() {
                warn!(
                    "Pending queue full ({}), dropped oldest task {}",
                    self.config.task_queue_capacity, dropped.task.id
                );
            }
        }
        info!(
            "No agent found for '{}', queuing task {}",
            task.required_capability, task.id
        );
        pending.push_back(PendingTask {
            task,
            queued_at: Utc::now(),
        });
    }

    fn unmatched(&self, task: Task) -> Result<Option<Value>, CoreError> {
        if self.config.enable_task_queue {
            self.enqueue(task);
            Ok(None)
        } else {
            warn!("No agent found for '{}'", task.required_capability);
            Err(CoreError::NoCapableAgent(task.required_capability))
        }
    }

    /// Run a task on the first agent advertising `required_capability`.
    ///
    /// Returns `Ok(None)` when no agent matched and the task was queued.
    pub fn dispatch_task(
        &self,
        task_id: &str,
        payload: Payload,
        required_capability: &str,
    ) -> Result<Option<Value>, CoreError> {
        self.total_tasks.fetch_add(1, Ordering::Relaxed);

        let Some((agent_id, agent)) = self.find_agent(required_capability) else {
            return self.unmatched(Task::with_id(task_id, required_capability, payload));
        };

        debug!("Dispatching task {} to agent {}", task_id, agent_id);
        let result = agent.handle(&payload)?;
        Ok(Some(result))
    }

    /// Async counterpart of [`Coordinator::dispatch_task`].
    ///
    /// With an executor wired, a cached result for `task_id` is returned
    /// without re-executing (when enabled), and execution is bounded by the
    /// executor's admission limit and timeout.
    pub async fn dispatch_task_async(
        &self,
        task_id: &str,
        payload: Payload,
        required_capability: &str,
    ) -> Result<Option<Value>, CoreError> {
        self.total_tasks.fetch_add(1, Ordering::Relaxed);

        if self.config.reuse_cached_results {
            if let Some(cached) = self.executor.as_ref().and_then(|e| e.cached_result(task_id)) {
                debug!("Returning cached result for task {}", task_id);
                return Ok(Some(cached));
            }
        }

        let Some((agent_id, agent)) = self.find_agent(required_capability) else {
            return self.unmatched(Task::with_id(task_id, required_capability, payload));
        };

        debug!("Dispatching task {} to agent {}", task_id, agent_id);
        self.run_async(task_id, &payload, agent).await.map(Some)
    }

    async fn run_async(
        &self,
        task_id: &str,
        payload: &Payload,
        agent: Arc<dyn Agent>,
    ) -> Result<Value, CoreError> {
        match &self.executor {
            Some(executor) => {
                let operation = async { agent.handle_async(payload).await };
                Ok(executor
                    .execute(task_id, operation, TaskHooks::new())
                    .await?)
            }
            None => Ok(agent.handle_async(payload).await?),
        }
    }

    /// Dispatch all tasks concurrently; results keep the input order
    pub async fn dispatch_tasks_parallel(
        &self,
        tasks: Vec<Task>,
    ) -> Vec<Result<Option<Value>, CoreError>> {
        join_all(tasks.into_iter().map(|task| async move {
            self.dispatch_task_async(&task.id, task.payload, &task.required_capability)
                .await
        }))
        .await
    }

    /// Dispatch every queued task that now has a capable agent.
    ///
    /// Tasks that still match nothing stay queued in their original order.
    pub async fn drain_pending_async(&self) -> Vec<DrainedTask> {
        let mut ready = Vec::new();
        {
            // Registry before queue, same as dispatch
            let registry = self.registry.read();
            let mut pending = self.pending.lock();
            let mut waiting = VecDeque::with_capacity(pending.len());

            for entry in pending.drain(..) {
                match registry.find_capable(&entry.task.required_capability) {
                    Some(found) => ready.push((entry.task, Arc::clone(&found.agent))),
                    None => waiting.push_back(entry),
                }
            }
            *pending = waiting;
        }

        if ready.is_empty() {
            return Vec::new();
        }
        info!("Draining {} pending tasks", ready.len());

        join_all(ready.into_iter().map(|(task, agent)| async move {
            let result = self.run_async(&task.id, &task.payload, agent).await;
            DrainedTask {
                task_id: task.id,
                result,
            }
        }))
        .await
    }

    /// Snapshot of the pending queue, oldest first
    pub fn pending_tasks(&self) -> Vec<PendingTask> {
        self.pending.lock().iter().cloned().collect()
    }

    pub fn get_task_queue_size(&self) -> usize {
        self.pending.lock().len()
    }

    // ============ Introspection ============

    pub fn get_health(&self) -> HealthReport {
        let agents = self.agent_counts();
        let is_running = self.is_running();

        let status = if !is_running {
            HealthStatus::Unhealthy
        } else if agents.active == 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            is_running,
            agents,
            queued_tasks: self.get_task_queue_size(),
            timestamp: Utc::now(),
        }
    }

    pub fn get_metrics(&self) -> CoordinatorMetrics {
        let agents = self.agent_counts();
        let executor = self.executor.as_ref().map(|e| e.get_metrics());

        CoordinatorMetrics {
            total_agents: agents.total,
            active_agents: agents.active,
            total_tasks: self.total_tasks.load(Ordering::Relaxed),
            queued_tasks: self.get_task_queue_size(),
            system_running: self.is_running(),
            cache_hit_rate: executor.as_ref().map(|m| m.cache_hit_rate_percent),
            executor,
        }
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("agents", &self.registry.read().entries.len())
            .field("queued", &self.get_task_queue_size())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentState, EchoAgent, FnAgent};
    use crate::config::ExecutorConfig;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn tagged(id: &str) -> Arc<dyn Agent> {
        let tag = id.to_string();
        Arc::new(FnAgent::new(id, move |_| Ok(json!(tag))))
    }

    fn no_queue() -> Coordinator {
        Coordinator::new(CoordinatorConfig {
            enable_task_queue: false,
            ..Default::default()
        })
        .unwrap()
    }

    fn with_executor(config: ExecutorConfig) -> Coordinator {
        let executor = Arc::new(BoundedExecutor::new(&config).unwrap());
        Coordinator::with_executor(CoordinatorConfig::default(), executor).unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let coord = Coordinator::default();
        coord
            .register_agent("a1", Arc::new(EchoAgent::new("a1")), ["text"])
            .unwrap();

        assert_eq!(coord.get_agent("a1").unwrap().id(), "a1");
        assert_eq!(coord.get_all_agents().len(), 1);
        assert!(coord.agent_capabilities("a1").unwrap().contains("text"));
        assert!(matches!(coord.get_agent("nope"), Err(CoreError::AgentNotFound(_))));
    }

    #[test]
    fn test_duplicate_registration_leaves_registry_unchanged() {
        let coord = Coordinator::default();
        coord.register_agent("a1", tagged("first"), ["x"]).unwrap();

        let err = coord.register_agent("a1", tagged("second"), ["y"]).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateAgent(ref id) if id == "a1"));
        assert_eq!(coord.get_all_agents().len(), 1);
        assert_eq!(coord.get_agent("a1").unwrap().id(), "first");
        assert!(coord.agent_capabilities("a1").unwrap().contains("x"));
    }

    #[test]
    fn test_unregister() {
        let coord = Coordinator::default();
        coord.register_agent("a1", tagged("a1"), ["x"]).unwrap();

        coord.unregister_agent("a1").unwrap();
        assert!(coord.get_all_agents().is_empty());
        assert!(matches!(
            coord.agent_capabilities("a1"),
            Err(CoreError::AgentNotFound(_))
        ));
        assert!(coord.unregister_agent("a1").is_err());
    }

    #[test]
    fn test_first_registered_match_wins() {
        let coord = Coordinator::default();
        coord.register_agent("first", tagged("first"), ["x"]).unwrap();
        coord.register_agent("second", tagged("second"), ["x", "y"]).unwrap();

        for _ in 0..5 {
            let result = coord.dispatch_task("t", json!({}), "x").unwrap();
            assert_eq!(result, Some(json!("first")));
        }
        assert_eq!(coord.dispatch_task("t", json!({}), "y").unwrap(), Some(json!("second")));
    }

    #[test]
    fn test_unmatched_task_is_queued() {
        let coord = Coordinator::default();
        coord.register_agent("a1", tagged("a1"), ["text"]).unwrap();

        let result = coord.dispatch_task("t1", json!({"n": 1}), "image").unwrap();
        assert!(result.is_none());
        assert_eq!(coord.get_task_queue_size(), 1);

        let pending = coord.pending_tasks();
        assert_eq!(pending[0].task.id, "t1");
        assert_eq!(pending[0].task.required_capability, "image");
    }

    #[test]
    fn test_unmatched_task_rejected_without_queue() {
        let coord = no_queue();
        let err = coord.dispatch_task("t1", json!({}), "image").unwrap_err();
        assert!(matches!(err, CoreError::NoCapableAgent(ref c) if c == "image"));
        assert!(err.to_string().contains("image"));
        assert_eq!(coord.get_task_queue_size(), 0);
    }

    #[test]
    fn test_queue_drops_oldest_when_full() {
        let coord = Coordinator::new(CoordinatorConfig {
            task_queue_capacity: 2,
            ..Default::default()
        })
        .unwrap();

        for i in 0..3 {
            coord.dispatch_task(&format!("t{}", i), json!(i), "none").unwrap();
        }

        let ids: Vec<String> = coord.pending_tasks().into_iter().map(|p| p.task.id).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[test]
    fn test_agent_error_propagates() {
        let coord = no_queue();
        let agent = FnAgent::new("bad", |_| Err(AgentError::execution("bad", "exploded")));
        coord.register_agent("bad", Arc::new(agent), ["x"]).unwrap();

        let err = coord.dispatch_task("t", json!({}), "x").unwrap_err();
        assert!(matches!(err, CoreError::Agent(AgentError::Execution { .. })));
    }

    #[test]
    fn test_null_payload_rejected() {
        let coord = no_queue();
        coord.register_agent("a", tagged("a"), ["x"]).unwrap();

        let err = coord.dispatch_task("t", Value::Null, "x").unwrap_err();
        assert!(matches!(err, CoreError::Agent(AgentError::Validation { .. })));
    }

    #[test]
    fn test_health_states() {
        let coord = Coordinator::default();
        let agent: Arc<dyn Agent> = Arc::new(EchoAgent::new("a"));
        coord.register_agent("a", Arc::clone(&agent), ["x"]).unwrap();

        assert_eq!(coord.get_health().status, HealthStatus::Unhealthy);

        coord.start();
        assert_eq!(coord.get_health().status, HealthStatus::Degraded);

        agent.start();
        let health = coord.get_health();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.is_running);
        assert_eq!(health.agents.total, 1);
        assert_eq!(health.agents.active, 1);

        coord.stop();
        assert_eq!(coord.get_health().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_health_serializes() {
        let coord = Coordinator::default();
        let value = serde_json::to_value(coord.get_health()).unwrap();
        assert_eq!(value["status"], "unhealthy");
        assert_eq!(value["is_running"], false);
        assert_eq!(value["agents"]["total"], 0);
    }

    #[test]
    fn test_metrics() {
        let coord = Coordinator::default();
        coord.register_agent("a", tagged("a"), ["x"]).unwrap();
        coord.start();
        coord.dispatch_task("t1", json!({}), "x").unwrap();
        coord.dispatch_task("t2", json!({}), "y").unwrap();

        let metrics = coord.get_metrics();
        assert_eq!(metrics.total_agents, 1);
        assert_eq!(metrics.active_agents, 0);
        assert_eq!(metrics.total_tasks, 2);
        assert_eq!(metrics.queued_tasks, 1);
        assert!(metrics.system_running);
        assert!(metrics.cache_hit_rate.is_none());

        let value = serde_json::to_value(&metrics).unwrap();
        assert!(value.get("executor").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_async_without_executor() {
        let coord = Coordinator::default();
        coord
            .register_agent("echo", Arc::new(EchoAgent::new("echo")), ["echo"])
            .unwrap();

        let result = coord
            .dispatch_task_async("t1", json!({"msg": "hi"}), "echo")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["echo"]["msg"], "hi");
    }

    #[tokio::test]
    async fn test_dispatch_async_reuses_cached_result() {
        let coord = with_executor(ExecutorConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let agent = FnAgent::new("counting", move |_| {
            Ok(json!(counter.fetch_add(1, Ordering::SeqCst)))
        });
        coord.register_agent("counting", Arc::new(agent), ["x"]).unwrap();

        let first = coord.dispatch_task_async("same", json!({}), "x").await.unwrap();
        let second = coord.dispatch_task_async("same", json!({}), "x").await.unwrap();

        assert_eq!(first, Some(json!(0)));
        assert_eq!(second, Some(json!(0)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let metrics = coord.get_metrics();
        assert_eq!(metrics.cache_hit_rate, Some(50.0));
        assert_eq!(metrics.executor.unwrap().tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_cache_reuse_can_be_disabled() {
        let executor = Arc::new(BoundedExecutor::new(&ExecutorConfig::default()).unwrap());
        let coord = Coordinator::with_executor(
            CoordinatorConfig {
                reuse_cached_results: false,
                ..Default::default()
            },
            executor,
        )
        .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let agent = FnAgent::new("counting", move |_| {
            Ok(json!(counter.fetch_add(1, Ordering::SeqCst)))
        });
        coord.register_agent("counting", Arc::new(agent), ["x"]).unwrap();

        coord.dispatch_task_async("same", json!({}), "x").await.unwrap();
        coord.dispatch_task_async("same", json!({}), "x").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    struct SlowAgent {
        state: AgentState,
        delay: Duration,
    }

    #[async_trait]
    impl Agent for SlowAgent {
        fn state(&self) -> &AgentState {
            &self.state
        }

        fn execute(&self, payload: &Payload) -> Result<Value, AgentError> {
            Ok(payload.clone())
        }

        async fn execute_async(&self, payload: &Payload) -> Result<Value, AgentError> {
            tokio::time::sleep(self.delay).await;
            Ok(payload.clone())
        }
    }

    #[tokio::test]
    async fn test_executor_timeout_maps_to_core_error() {
        let executor = BoundedExecutor::<Value>::new(&ExecutorConfig::default())
            .unwrap()
            .with_task_timeout(Duration::from_millis(20));
        let coord =
            Coordinator::with_executor(CoordinatorConfig::default(), Arc::new(executor)).unwrap();
        let slow = SlowAgent {
            state: AgentState::new("slow"),
            delay: Duration::from_secs(5),
        };
        coord.register_agent("slow", Arc::new(slow), ["x"]).unwrap();

        let err = coord.dispatch_task_async("t", json!({}), "x").await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout { ref task_id, .. } if task_id == "t"));
    }

    #[tokio::test]
    async fn test_parallel_dispatch_preserves_order() {
        let coord = Coordinator::default();
        for (id, ms) in [("slow", 40), ("fast", 1)] {
            let agent = SlowAgent {
                state: AgentState::new(id),
                delay: Duration::from_millis(ms),
            };
            coord.register_agent(id, Arc::new(agent), [id]).unwrap();
        }

        let tasks = vec![
            Task::with_id("t0", "slow", json!(0)),
            Task::with_id("t1", "fast", json!(1)),
            Task::with_id("t2", "slow", json!(2)),
            Task::with_id("t3", "fast", json!(3)),
        ];
        let results = coord.dispatch_tasks_parallel(tasks).await;

        let values: Vec<Value> = results.into_iter().map(|r| r.unwrap().unwrap()).collect();
        assert_eq!(values, vec![json!(0), json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_drain_pending_dispatches_matched_tasks() {
        let coord = Coordinator::default();
        coord.dispatch_task_async("t1", json!(1), "x").await.unwrap();
        coord.dispatch_task_async("t2", json!(2), "y").await.unwrap();
        coord.dispatch_task_async("t3", json!(3), "x").await.unwrap();
        assert_eq!(coord.get_task_queue_size(), 3);

        // Nothing can run yet
        assert!(coord.drain_pending_async().await.is_empty());
        assert_eq!(coord.get_task_queue_size(), 3);

        coord.register_agent("x-agent", tagged("x-agent"), ["x"]).unwrap();
        let drained = coord.drain_pending_async().await;

        let ids: Vec<&str> = drained.iter().map(|d| d.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t3"]);
        assert!(drained.iter().all(|d| d.result.is_ok()));

        let remaining = coord.pending_tasks();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].task.id, "t2");
    }

    struct FailingStop {
        state: AgentState,
    }

    #[async_trait]
    impl Agent for FailingStop {
        fn state(&self) -> &AgentState {
            &self.state
        }

        fn execute(&self, payload: &Payload) -> Result<Value, AgentError> {
            Ok(payload.clone())
        }

        async fn stop_async(&self) -> Result<(), AgentError> {
            Err(AgentError::execution(self.id(), "teardown failed"))
        }
    }

    #[tokio::test]
    async fn test_stop_async_isolates_failures() {
        let coord = with_executor(ExecutorConfig::default());
        let good: Arc<dyn Agent> = Arc::new(EchoAgent::new("good"));
        let bad: Arc<dyn Agent> = Arc::new(FailingStop {
            state: AgentState::new("bad"),
        });
        let idle: Arc<dyn Agent> = Arc::new(EchoAgent::new("idle"));

        coord.register_agent("bad", Arc::clone(&bad), ["x"]).unwrap();
        coord.register_agent("good", Arc::clone(&good), ["x"]).unwrap();

        let startup = coord.start_async().await;
        assert_eq!(startup.started, vec!["bad", "good"]);
        assert!(coord.executor().unwrap().is_running());

        // Registered after startup, never started
        coord.register_agent("idle", Arc::clone(&idle), ["x"]).unwrap();

        let report = coord.stop_async().await;
        assert_eq!(report.stopped, vec!["good"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
        assert!(!report.is_clean());

        assert!(!good.is_active());
        assert!(!coord.is_running());
        assert!(!coord.executor().unwrap().is_running());
    }

    struct FailingStart {
        state: AgentState,
    }

    #[async_trait]
    impl Agent for FailingStart {
        fn state(&self) -> &AgentState {
            &self.state
        }

        fn execute(&self, payload: &Payload) -> Result<Value, AgentError> {
            Ok(payload.clone())
        }

        async fn start_async(&self) -> Result<(), AgentError> {
            Err(AgentError::execution(self.id(), "warmup failed"))
        }
    }

    #[tokio::test]
    async fn test_start_async_starts_registered_agents() {
        let coord = with_executor(ExecutorConfig::default());
        let echo: Arc<dyn Agent> = Arc::new(EchoAgent::new("echo"));
        let broken: Arc<dyn Agent> = Arc::new(FailingStart {
            state: AgentState::new("broken"),
        });
        coord.register_agent("broken", Arc::clone(&broken), ["x"]).unwrap();
        coord.register_agent("echo", Arc::clone(&echo), ["echo"]).unwrap();
        assert!(!echo.is_active());

        let report = coord.start_async().await;

        assert_eq!(report.started, vec!["echo"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert!(!report.is_clean());

        assert!(echo.is_active());
        assert!(!broken.is_active());
        assert!(coord.is_running());
        assert_eq!(coord.get_health().status, HealthStatus::Healthy);
        assert_eq!(coord.get_health().agents.active, 1);

        coord.stop_async().await;
    }

    #[tokio::test]
    async fn test_start_async_is_idempotent_for_running_agents() {
        let coord = Coordinator::default();
        let echo: Arc<dyn Agent> = Arc::new(EchoAgent::new("echo"));
        coord.register_agent("echo", Arc::clone(&echo), ["echo"]).unwrap();
        echo.start();

        let report = coord.start_async().await;
        assert!(report.is_clean());
        assert_eq!(report.started, vec!["echo"]);
        assert!(echo.is_active());
    }

    #[tokio::test]
    async fn test_register_agent_async_starts_agent() {
        let coord = Coordinator::default();
        let echo: Arc<dyn Agent> = Arc::new(EchoAgent::new("echo"));

        coord
            .register_agent_async("echo", Arc::clone(&echo), ["echo"])
            .await
            .unwrap();
        assert!(echo.is_active());
        assert_eq!(coord.agent_capabilities("echo").unwrap().len(), 1);

        // Duplicate ids are rejected before any startup
        let err = coord
            .register_agent_async("echo", Arc::new(EchoAgent::new("echo")), ["echo"])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateAgent(_)));
    }

    #[tokio::test]
    async fn test_register_agent_async_reports_start_failure() {
        let coord = Coordinator::default();
        let broken: Arc<dyn Agent> = Arc::new(FailingStart {
            state: AgentState::new("broken"),
        });

        let err = coord
            .register_agent_async("broken", broken, ["x"])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Agent(AgentError::Execution { .. })));
        // Registration stands; only startup failed
        assert!(coord.get_agent("broken").is_ok());
    }

    #[test]
    fn test_task_new_generates_id() {
        let a = Task::new("x", json!({}));
        let b = Task::new("x", json!({}));
        assert_ne!(a.id, b.id);
        assert_eq!(a.required_capability, "x");
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = Coordinator::new(CoordinatorConfig {
            task_queue_capacity: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(CoreError::Config(_))));
    }
}
