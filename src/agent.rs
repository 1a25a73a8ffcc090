//! Agent Contract
//!
//! An agent is a unit of work execution routed to by capability. Concrete
//! agents implement [`Agent::execute`] and embed an [`AgentState`] that
//! carries the identifier, configuration and lifecycle bookkeeping shared by
//! every agent.
//!
//! The coordinator never calls `execute` directly; it goes through
//! [`Agent::handle`] / [`Agent::handle_async`], which validate the payload and
//! track the `executing` / `failed` status around the call.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use tracing::{debug, info};

/// Opaque task payload
pub type Payload = Value;

/// Free-form agent configuration
pub type AgentConfig = Map<String, Value>;

/// Errors raised by agents
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid task for agent '{agent_id}': {reason}")]
    Validation { agent_id: String, reason: String },

    #[error("Agent '{agent_id}' failed: {reason}")]
    Execution { agent_id: String, reason: String },

    #[error("Agent '{agent_id}' does not support {operation}")]
    Unsupported { agent_id: String, operation: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    pub fn execution(agent_id: &str, reason: impl fmt::Display) -> Self {
        Self::Execution {
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn validation(agent_id: &str, reason: impl fmt::Display) -> Self {
        Self::Validation {
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Agent status tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Initialized,
    Active,
    Executing,
    Stopped,
    Failed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Active => "active",
            Self::Executing => "executing",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Lifecycle {
    /// Initialized, Active or Stopped
    base: AgentStatus,
    in_flight: usize,
    last_failed: bool,
    executions: u64,
    failures: u64,
}

impl Lifecycle {
    fn status(&self) -> AgentStatus {
        if self.in_flight > 0 {
            AgentStatus::Executing
        } else if self.last_failed {
            AgentStatus::Failed
        } else {
            self.base
        }
    }
}

/// State shared by every agent implementation
#[derive(Debug)]
pub struct AgentState {
    id: String,
    config: AgentConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl AgentState {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_config(id, AgentConfig::new())
    }

    pub fn with_config(id: impl Into<String>, config: AgentConfig) -> Self {
        let id = id.into();
        debug!("Agent '{}' initialized", id);
        Self {
            id,
            config,
            lifecycle: Mutex::new(Lifecycle {
                base: AgentStatus::Initialized,
                in_flight: 0,
                last_failed: false,
                executions: 0,
                failures: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.lock().base == AgentStatus::Active
    }

    pub fn status(&self) -> AgentStatus {
        self.lifecycle.lock().status()
    }

    /// Total and failed executions so far
    pub fn execution_counts(&self) -> (u64, u64) {
        let lc = self.lifecycle.lock();
        (lc.executions, lc.failures)
    }

    /// Mark active. Returns false if it already was.
    pub fn activate(&self) -> bool {
        let mut lc = self.lifecycle.lock();
        lc.last_failed = false;
        if lc.base == AgentStatus::Active {
            return false;
        }
        lc.base = AgentStatus::Active;
        true
    }

    /// Mark stopped. Returns false if the agent was not active.
    pub fn deactivate(&self) -> bool {
        let mut lc = self.lifecycle.lock();
        if lc.base != AgentStatus::Active {
            return false;
        }
        lc.base = AgentStatus::Stopped;
        true
    }

    /// Track one execution; the status reads `executing` until the guard goes away.
    pub fn begin_execution(&self) -> ExecutionGuard<'_> {
        let mut lc = self.lifecycle.lock();
        lc.in_flight += 1;
        lc.executions += 1;
        ExecutionGuard {
            state: self,
            outcome: None,
        }
    }
}

/// Guard that marks an execution start/end automatically
pub struct ExecutionGuard<'a> {
    state: &'a AgentState,
    outcome: Option<bool>,
}

impl ExecutionGuard<'_> {
    /// Record the outcome. A guard dropped without one (cancelled call) leaves
    /// the failure flag untouched.
    pub fn finish(mut self, succeeded: bool) {
        self.outcome = Some(succeeded);
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        let mut lc = self.state.lifecycle.lock();
        lc.in_flight = lc.in_flight.saturating_sub(1);
        match self.outcome {
            Some(true) => lc.last_failed = false,
            Some(false) => {
                lc.last_failed = true;
                lc.failures += 1;
            }
            None => {}
        }
    }
}

/// Status snapshot returned by [`Agent::get_status`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusReport {
    pub agent_id: String,
    pub is_active: bool,
    pub status: AgentStatus,
    pub config: AgentConfig,
    pub executions: u64,
    pub failures: u64,
}

/// Capability contract every agent implements
#[async_trait]
pub trait Agent: Send + Sync {
    /// Shared identifier/config/lifecycle state
    fn state(&self) -> &AgentState;

    /// Process one task synchronously
    fn execute(&self, payload: &Payload) -> Result<Value, AgentError>;

    /// Process one task asynchronously. Defaults to [`Agent::execute`].
    async fn execute_async(&self, payload: &Payload) -> Result<Value, AgentError> {
        self.execute(payload)
    }

    fn id(&self) -> &str {
        self.state().id()
    }

    fn is_active(&self) -> bool {
        self.state().is_active()
    }

    fn start(&self) {
        if self.state().activate() {
            info!("Agent '{}' started", self.id());
        }
    }

    fn stop(&self) {
        if self.state().deactivate() {
            info!("Agent '{}' stopped", self.id());
        }
    }

    /// Asynchronous startup. Defaults to [`Agent::start`].
    async fn start_async(&self) -> Result<(), AgentError> {
        self.start();
        Ok(())
    }

    /// Asynchronous teardown. Defaults to [`Agent::stop`].
    async fn stop_async(&self) -> Result<(), AgentError> {
        self.stop();
        Ok(())
    }

    fn get_status(&self) -> AgentStatusReport {
        let state = self.state();
        let (executions, failures) = state.execution_counts();
        AgentStatusReport {
            agent_id: state.id().to_string(),
            is_active: state.is_active(),
            status: state.status(),
            config: state.config().clone(),
            executions,
            failures,
        }
    }

    /// Reject payloads the agent cannot process. Null payloads are always invalid.
    fn validate_task(&self, payload: &Payload) -> Result<(), AgentError> {
        if payload.is_null() {
            return Err(AgentError::validation(self.id(), "payload is null"));
        }
        Ok(())
    }

    /// Validate, then execute with status tracking
    fn handle(&self, payload: &Payload) -> Result<Value, AgentError> {
        self.validate_task(payload)?;
        let guard = self.state().begin_execution();
        let result = self.execute(payload);
        guard.finish(result.is_ok());
        result
    }

    /// Async counterpart of [`Agent::handle`]
    async fn handle_async(&self, payload: &Payload) -> Result<Value, AgentError> {
        self.validate_task(payload)?;
        let guard = self.state().begin_execution();
        let result = self.execute_async(payload).await;
        guard.finish(result.is_ok());
        result
    }
}

impl fmt::Debug for dyn Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Agent {} (active={})>", self.id(), self.is_active())
    }
}

type Handler = Box<dyn Fn(&Payload) -> Result<Value, AgentError> + Send + Sync>;

/// Agent backed by a closure
pub struct FnAgent {
    state: AgentState,
    handler: Handler,
}

impl FnAgent {
    pub fn new<F>(id: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Payload) -> Result<Value, AgentError> + Send + Sync + 'static,
    {
        Self::with_config(id, AgentConfig::new(), handler)
    }

    pub fn with_config<F>(id: impl Into<String>, config: AgentConfig, handler: F) -> Self
    where
        F: Fn(&Payload) -> Result<Value, AgentError> + Send + Sync + 'static,
    {
        Self {
            state: AgentState::with_config(id, config),
            handler: Box::new(handler),
        }
    }
}

impl Agent for FnAgent {
    fn state(&self) -> &AgentState {
        &self.state
    }

    fn execute(&self, payload: &Payload) -> Result<Value, AgentError> {
        (self.handler)(payload)
    }
}

/// Agent that answers with the payload it was given
pub struct EchoAgent {
    state: AgentState,
}

impl EchoAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            state: AgentState::new(id),
        }
    }
}

impl Agent for EchoAgent {
    fn state(&self) -> &AgentState {
        &self.state
    }

    fn execute(&self, payload: &Payload) -> Result<Value, AgentError> {
        Ok(json!({
            "agent_id": self.id(),
            "echo": payload,
        }))
    }
}
