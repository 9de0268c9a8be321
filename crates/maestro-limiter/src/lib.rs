#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-limiter** – Execution guards for Maestro workers.
//!
//! The [`ExecutionLimiter`] wraps every worker `execute` call with a global
//! concurrency ceiling, a per-call timeout, and memory-delta sampling, and
//! keeps a bounded rolling history of outcomes. The [`CircuitBreaker`]
//! short-circuits executes for template families that keep failing, probing
//! again after a recovery window.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{info, warn};

pub mod breaker;

pub use breaker::{BreakerConfig, BreakerError, BreakerRegistry, BreakerState, CircuitBreaker};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Limits applied to every guarded execution.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Per-call timeout.
    pub max_execution_time: Duration,
    /// Memory-delta threshold triggering a reclaim.
    pub max_memory_mb: f64,
    /// Global concurrency ceiling.
    pub max_concurrent_executions: usize,
    /// Rolling history capacity.
    pub history_size: usize,
    /// Interval between cleanup passes.
    pub cleanup_interval: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_execution_time: Duration::from_secs(30),
            max_memory_mb: 512.0,
            max_concurrent_executions: 10,
            history_size: 100,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Horizon beyond which stale active-execution entries are purged.
const STALE_EXECUTION_HORIZON: Duration = Duration::from_secs(3600);

//─────────────────────────────
//  Errors and records
//─────────────────────────────

/// Errors surfaced by the limiter.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    /// The call exceeded the per-call timeout.
    #[error("execution exceeded {0:?} limit")]
    Timeout(Duration),
}

/// One completed execution in the rolling history.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// Caller-supplied execution id.
    pub id: String,
    /// Completion time.
    pub timestamp: DateTime<Utc>,
    /// Whether the call completed within limits.
    pub ok: bool,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Memory delta observed, in MB.
    pub memory_used_mb: f64,
    /// Error string for failed calls.
    pub error: Option<String>,
}

/// Aggregate statistics over the rolling history.
#[derive(Debug, Clone, Default)]
pub struct LimiterStats {
    /// Executions in the history window.
    pub total_executions: usize,
    /// Fraction of successful executions, 0–1.
    pub success_rate: f64,
    /// Mean duration over the window.
    pub avg_duration: Duration,
    /// Mean memory delta over the window, in MB.
    pub avg_memory_mb: f64,
    /// Executions currently in flight.
    pub active_executions: usize,
    /// Current process memory, in MB.
    pub current_memory_mb: f64,
}

//─────────────────────────────
//  Memory sampling
//─────────────────────────────

/// Process memory probe.
pub trait MemorySampler: Send + Sync {
    /// Current resident memory in MB.
    fn usage_mb(&self) -> f64;
}

/// Probe reading `/proc/self/statm`; returns 0 where procfs is unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMemorySampler;

impl MemorySampler for ProcMemorySampler {
    fn usage_mb(&self) -> f64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                s.split_whitespace()
                    .nth(1)
                    .and_then(|pages| pages.parse::<f64>().ok())
            })
            .map(|resident_pages| resident_pages * 4096.0 / 1024.0 / 1024.0)
            .unwrap_or(0.0)
    }
}

/// Hook invoked when the memory guard trips; owners release caches here.
pub type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

//─────────────────────────────
//  Limiter
//─────────────────────────────

struct ActiveExecution {
    started: Instant,
}

/// Guards worker executions with concurrency, timeout, and memory limits.
pub struct ExecutionLimiter {
    config: LimiterConfig,
    semaphore: Arc<Semaphore>,
    history: Mutex<VecDeque<ExecutionRecord>>,
    active: DashMap<String, ActiveExecution>,
    last_cleanup: Mutex<Instant>,
    sampler: Box<dyn MemorySampler>,
    reclaim: Mutex<Option<ReclaimHook>>,
}

impl ExecutionLimiter {
    /// Create a limiter with the given configuration and the default
    /// process memory probe.
    pub fn new(config: LimiterConfig) -> Self {
        Self::with_sampler(config, Box::new(ProcMemorySampler))
    }

    /// Create a limiter with an explicit memory probe.
    pub fn with_sampler(config: LimiterConfig, sampler: Box<dyn MemorySampler>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_executions));
        Self {
            semaphore,
            history: Mutex::new(VecDeque::with_capacity(config.history_size)),
            active: DashMap::new(),
            last_cleanup: Mutex::new(Instant::now()),
            sampler,
            reclaim: Mutex::new(None),
            config,
        }
    }

    /// Install the hook run when the memory guard trips.
    pub fn set_reclaim_hook(&self, hook: ReclaimHook) {
        *self.reclaim.lock().unwrap() = Some(hook);
    }

    /// The per-call timeout currently enforced.
    pub fn max_execution_time(&self) -> Duration {
        self.config.max_execution_time
    }

    /// Run `fut` under the configured limits.
    ///
    /// Acquires a concurrency permit, samples memory before and after, and
    /// cancels the future on timeout. The memory guard logs and reclaims but
    /// never aborts a completed call.
    pub async fn execute_with_limits<T, F>(
        &self,
        execution_id: &str,
        fut: F,
    ) -> Result<T, LimiterError>
    where
        F: Future<Output = T>,
    {
        self.maybe_cleanup();

        let _permit = self
            .semaphore
            .acquire()
            .await
            .unwrap_or_else(|_| unreachable!("limiter semaphore is never closed"));

        let started = Instant::now();
        let start_memory = self.sampler.usage_mb();
        self.active
            .insert(execution_id.to_string(), ActiveExecution { started });

        let outcome = tokio::time::timeout(self.config.max_execution_time, fut).await;

        self.active.remove(execution_id);
        let duration = started.elapsed();
        let memory_delta = (self.sampler.usage_mb() - start_memory).max(0.0);

        match outcome {
            Ok(value) => {
                if memory_delta > self.config.max_memory_mb {
                    warn!(
                        execution_id,
                        memory_delta_mb = memory_delta,
                        limit_mb = self.config.max_memory_mb,
                        "execution exceeded memory limit, reclaiming"
                    );
                    self.run_reclaim();
                }
                self.record(execution_id, true, duration, memory_delta, None);
                Ok(value)
            }
            Err(_) => {
                warn!(execution_id, timeout = ?self.config.max_execution_time, "execution timed out");
                self.record(
                    execution_id,
                    false,
                    self.config.max_execution_time,
                    memory_delta,
                    Some("execution timeout".into()),
                );
                Err(LimiterError::Timeout(self.config.max_execution_time))
            }
        }
    }

    fn record(
        &self,
        execution_id: &str,
        ok: bool,
        duration: Duration,
        memory_used_mb: f64,
        error: Option<String>,
    ) {
        let mut history = self.history.lock().unwrap();
        if history.len() == self.config.history_size {
            history.pop_front();
        }
        history.push_back(ExecutionRecord {
            id: execution_id.to_string(),
            timestamp: Utc::now(),
            ok,
            duration,
            memory_used_mb,
            error,
        });
    }

    /// Purge stale active entries and reclaim when memory runs high; runs at
    /// most once per `cleanup_interval`.
    fn maybe_cleanup(&self) {
        {
            let mut last = self.last_cleanup.lock().unwrap();
            if last.elapsed() < self.config.cleanup_interval {
                return;
            }
            *last = Instant::now();
        }
        info!("running limiter cleanup pass");

        self.active
            .retain(|_, exec| exec.started.elapsed() < STALE_EXECUTION_HORIZON);

        let current = self.sampler.usage_mb();
        if current > self.config.max_memory_mb * 0.8 {
            warn!(current_mb = current, "high memory usage detected, reclaiming");
            self.run_reclaim();
        }
    }

    fn run_reclaim(&self) {
        if let Some(hook) = self.reclaim.lock().unwrap().clone() {
            hook();
        }
    }

    /// Aggregate statistics over the rolling history.
    pub fn stats(&self) -> LimiterStats {
        let history = self.history.lock().unwrap();
        let total = history.len();
        if total == 0 {
            return LimiterStats {
                active_executions: self.active.len(),
                current_memory_mb: self.sampler.usage_mb(),
                ..LimiterStats::default()
            };
        }
        let successes = history.iter().filter(|r| r.ok).count();
        let total_duration: Duration = history.iter().map(|r| r.duration).sum();
        let total_memory: f64 = history.iter().map(|r| r.memory_used_mb).sum();
        LimiterStats {
            total_executions: total,
            success_rate: successes as f64 / total as f64,
            avg_duration: total_duration / total as u32,
            avg_memory_mb: total_memory / total as f64,
            active_executions: self.active.len(),
            current_memory_mb: self.sampler.usage_mb(),
        }
    }

    /// Snapshot of the rolling history, oldest first.
    pub fn history(&self) -> Vec<ExecutionRecord> {
        self.history.lock().unwrap().iter().cloned().collect()
    }
}
