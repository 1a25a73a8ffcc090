//! Bounded Executor
//!
//! Runs task futures under a counting semaphore and a hard timeout, caches
//! successful results in a strict LRU and keeps per-task bookkeeping that a
//! background sweep reclaims once it outlives the TTL.

use crate::cache::ResultCache;
use crate::config::{ConfigError, ExecutorConfig};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Execution errors
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError<E> {
    #[error("Task {task_id} timed out after {timeout:?}")]
    Timeout { task_id: String, timeout: Duration },

    #[error("Executor closed")]
    Closed,

    #[error(transparent)]
    Failed(E),
}

impl<E> ExecutionError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

type CompleteHook<'a, T> = Box<dyn FnOnce(&str, &T) -> anyhow::Result<()> + Send + 'a>;
type ErrorHook<'a> = Box<dyn FnOnce(&str, &str) -> anyhow::Result<()> + Send + 'a>;

/// Optional completion callbacks for one task.
///
/// A failing hook is logged and never changes the task's outcome.
pub struct TaskHooks<'a, T> {
    on_complete: Option<CompleteHook<'a, T>>,
    on_error: Option<ErrorHook<'a>>,
}

impl<T> Default for TaskHooks<'_, T> {
    fn default() -> Self {
        Self {
            on_complete: None,
            on_error: None,
        }
    }
}

impl<'a, T> TaskHooks<'a, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the task id and result after the result is cached
    pub fn on_complete<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&str, &T) -> anyhow::Result<()> + Send + 'a,
    {
        self.on_complete = Some(Box::new(hook));
        self
    }

    /// Called with the task id and error message on failure or timeout
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&str, &str) -> anyhow::Result<()> + Send + 'a,
    {
        self.on_error = Some(Box::new(hook));
        self
    }
}

/// Executor metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorMetrics {
    pub tasks_created: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub memory_cleanups: u64,
    pub cached_results: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub cache_hit_rate_percent: f64,
    pub in_flight: usize,
    pub available_permits: usize,
    pub max_concurrent_tasks: usize,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cleanups: AtomicU64,
}

/// Bookkeeping for one admitted execution
#[derive(Debug, Clone)]
struct TaskMeta {
    task_id: String,
    created: Instant,
}

/// Keyed by execution generation so overlapping runs of one id stay distinct
type Metadata = Mutex<HashMap<u64, TaskMeta>>;

struct Shared<T> {
    semaphore: Semaphore,
    max_concurrent: usize,
    cache: ResultCache<T>,
    metadata: Metadata,
    next_generation: AtomicU64,
    counters: Counters,
}

impl<T: Clone> Shared<T> {
    fn reclaim_expired(&self, ttl: Duration) -> usize {
        // Lock order: metadata, then cache
        let expired: Vec<String> = {
            let mut metadata = self.metadata.lock();
            let stale: Vec<u64> = metadata
                .iter()
                .filter(|(_, meta)| meta.created.elapsed() > ttl)
                .map(|(generation, _)| *generation)
                .collect();
            stale
                .iter()
                .filter_map(|generation| metadata.remove(generation))
                .map(|meta| meta.task_id)
                .collect()
        };

        for id in &expired {
            self.cache.remove(id);
        }
        let purged = self.cache.purge_older_than(ttl);

        let removed = expired.len() + purged;
        if removed > 0 {
            self.counters.cleanups.fetch_add(1, Ordering::Relaxed);
            info!(
                "Reclaimed {} stale task entries and {} cached results",
                expired.len(),
                purged
            );
        } else {
            debug!("Cleanup sweep found nothing to reclaim");
        }
        removed
    }
}

struct CleanupTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Removes this execution's metadata entry however it ends
struct MetadataGuard<'a> {
    metadata: &'a Metadata,
    generation: u64,
}

impl Drop for MetadataGuard<'_> {
    fn drop(&mut self) {
        self.metadata.lock().remove(&self.generation);
    }
}

/// Concurrency-limited task executor with result caching
pub struct BoundedExecutor<T = Value> {
    shared: Arc<Shared<T>>,
    task_timeout: Duration,
    task_ttl: Duration,
    cleanup_interval: Duration,
    cleanup: Mutex<Option<CleanupTask>>,
}

impl<T> BoundedExecutor<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: &ExecutorConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            shared: Arc::new(Shared {
                semaphore: Semaphore::new(config.max_concurrent_tasks),
                max_concurrent: config.max_concurrent_tasks,
                cache: ResultCache::new(config.result_cache_size),
                metadata: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                counters: Counters::default(),
            }),
            task_timeout: config.task_timeout(),
            task_ttl: config.task_ttl(),
            cleanup_interval: config.cleanup_interval(),
            cleanup: Mutex::new(None),
        })
    }

    /// Override the per-task timeout with sub-second precision
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_task_ttl(mut self, ttl: Duration) -> Self {
        self.task_ttl = ttl;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn task_timeout(&self) -> Duration {
        self.task_timeout
    }

    /// Run one task.
    ///
    /// Waits for an admission slot, then drives `operation` under the task
    /// timeout. Successful results are cached under `task_id` before
    /// `on_complete` runs; timeouts and failures invoke `on_error`.
    pub async fn execute<F, E>(
        &self,
        task_id: &str,
        operation: F,
        hooks: TaskHooks<'_, T>,
    ) -> Result<T, ExecutionError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let shared = &*self.shared;
        let _permit = shared
            .semaphore
            .acquire()
            .await
            .map_err(|_| ExecutionError::Closed)?;

        shared.counters.created.fetch_add(1, Ordering::Relaxed);
        let generation = shared.next_generation.fetch_add(1, Ordering::Relaxed);
        shared.metadata.lock().insert(
            generation,
            TaskMeta {
                task_id: task_id.to_string(),
                created: Instant::now(),
            },
        );
        let _guard = MetadataGuard {
            metadata: &shared.metadata,
            generation,
        };
        debug!("Task {} admitted", task_id);

        let TaskHooks {
            on_complete,
            on_error,
        } = hooks;

        match tokio::time::timeout(self.task_timeout, operation).await {
            Ok(Ok(result)) => {
                shared.cache.insert(task_id, result.clone());
                shared.counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!("Task {} completed", task_id);

                if let Some(hook) = on_complete {
                    if let Err(e) = hook(task_id, &result) {
                        error!("Completion hook for task {} failed: {}", task_id, e);
                    }
                }
                Ok(result)
            }
            Ok(Err(e)) => {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Task {} failed: {}", task_id, e);
                run_error_hook(on_error, task_id, &e.to_string());
                Err(ExecutionError::Failed(e))
            }
            Err(_) => {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                let err = ExecutionError::Timeout {
                    task_id: task_id.to_string(),
                    timeout: self.task_timeout,
                };
                error!("{}", err);
                run_error_hook(on_error, task_id, &err.to_string());
                Err(err)
            }
        }
    }

    /// Cached result of a completed task, counting the lookup as hit or miss
    pub fn cached_result(&self, task_id: &str) -> Option<T> {
        self.shared.cache.get(task_id)
    }

    /// Tasks currently holding bookkeeping
    pub fn in_flight(&self) -> usize {
        self.shared.metadata.lock().len()
    }

    /// Run one reclamation sweep now; returns the number of entries removed
    pub fn reclaim_expired(&self) -> usize {
        self.shared.reclaim_expired(self.task_ttl)
    }

    /// Start the periodic reclamation loop. No-op when already running.
    pub async fn start(&self) {
        let mut cleanup = self.cleanup.lock();
        if cleanup.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::channel::<()>(1);
        let shared = Arc::clone(&self.shared);
        let interval = self.cleanup_interval;
        let ttl = self.task_ttl;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        shared.reclaim_expired(ttl);
                    }
                    _ = rx.recv() => {
                        debug!("Cleanup loop stopping");
                        break;
                    }
                }
            }
        });

        *cleanup = Some(CleanupTask {
            shutdown_tx: tx,
            handle,
        });
        info!(
            "Executor started: {} slots, cleanup every {:?}",
            self.shared.max_concurrent, interval
        );
    }

    pub fn is_running(&self) -> bool {
        self.cleanup.lock().is_some()
    }

    /// Stop the reclamation loop and drop all cached results and bookkeeping
    pub async fn shutdown(&self) {
        let task = self.cleanup.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(()).await;
            if let Err(e) = task.handle.await {
                warn!("Cleanup loop ended abnormally: {}", e);
            }
        }

        self.shared.cache.clear();
        self.shared.metadata.lock().clear();
        info!("Executor shut down");
    }

    pub fn get_metrics(&self) -> ExecutorMetrics {
        let shared = &*self.shared;
        let cache = shared.cache.stats();

        ExecutorMetrics {
            tasks_created: shared.counters.created.load(Ordering::Relaxed),
            tasks_completed: shared.counters.completed.load(Ordering::Relaxed),
            tasks_failed: shared.counters.failed.load(Ordering::Relaxed),
            memory_cleanups: shared.counters.cleanups.load(Ordering::Relaxed),
            cached_results: cache.entries,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            cache_evictions: cache.evictions,
            cache_hit_rate_percent: cache.hit_rate_percent,
            in_flight: shared.metadata.lock().len(),
            available_permits: shared.semaphore.available_permits(),
            max_concurrent_tasks: shared.max_concurrent,
        }
    }
}

fn run_error_hook(hook: Option<ErrorHook<'_>>, task_id: &str, message: &str) {
    if let Some(hook) = hook {
        if let Err(e) = hook(task_id, message) {
            error!("Error hook for task {} failed: {}", task_id, e);
        }
    }
}

impl<T> fmt::Debug for BoundedExecutor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedExecutor")
            .field("max_concurrent", &self.shared.max_concurrent)
            .field("task_timeout", &self.task_timeout)
            .field("task_ttl", &self.task_ttl)
            .finish()
    }
}
