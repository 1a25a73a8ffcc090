//! Legion Core
//!
//! Task-dispatch and execution core for multi-agent coordination.
//!
//! # Features
//!
//! - **Capability Routing**: tasks go to the first registered agent advertising the required capability
//! - **Pending Queue**: unmatched tasks wait (bounded) until drained explicitly
//! - **Bounded Execution**: admission semaphore, hard timeout, LRU result cache, periodic reclamation
//! - **Circuit Breaker**: CLOSED / OPEN / HALF_OPEN fail-fast wrapper for any fallible call
//! - **Retry**: bounded re-attempts with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! caller ──► Coordinator ──► registry (agent + capabilities)
//!                 │
//!                 ├── pending queue (unmatched tasks)
//!                 └── BoundedExecutor ──► Agent::handle_async
//!                        ├── semaphore (max concurrent)
//!                        ├── timeout
//!                        └── ResultCache (LRU)
//!
//! CircuitBreaker / RetryPolicy wrap any fallible operation
//! ```

pub mod agent;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod executor;
pub mod retry;

pub use agent::{Agent, AgentError, AgentState, AgentStatus, AgentStatusReport, EchoAgent, FnAgent, Payload};
pub use cache::{CacheStats, ResultCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats};
pub use config::{Config, ConfigError, CoordinatorConfig, ExecutorConfig};
pub use coordinator::{
    Coordinator, CoordinatorMetrics, CoreError, DrainedTask, HealthReport, HealthStatus, PendingTask,
    ShutdownReport, StartupReport, Task,
};
pub use executor::{BoundedExecutor, ExecutionError, ExecutorMetrics, TaskHooks};
pub use retry::{RetryPolicy, RetryableTask};
