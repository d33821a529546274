//! Execution state and history for hosted modules.
//!
//! The store is in-memory only and keeps per-module counters plus a bounded
//! history of recent invocations. The number of tracked modules is bounded
//! too; the least recently run module is forgotten first. It is
//! informational: nothing in the invocation path depends on it.

use super::error::{ErrorKind, HostError};
use super::types::InvocationId;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

/// Final status of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
}

/// Aggregated execution state of one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleExecutionState {
    /// Module name
    pub module: String,
    /// Number of successful invocations
    pub success_count: u64,
    /// Number of failed invocations
    pub failure_count: u64,
    /// Last error message (cleared by a later success)
    pub last_error: Option<String>,
    /// Kind of the last error
    pub last_error_kind: Option<ErrorKind>,
    /// Fastest successful invocation
    pub min_duration: Option<Duration>,
    /// Slowest successful invocation
    pub max_duration: Option<Duration>,
    /// Average duration of successful invocations
    pub avg_duration: Option<Duration>,
    /// Last invocation timestamp
    pub last_execution: Option<SystemTime>,
    /// State creation timestamp
    pub created_at: SystemTime,
}

impl ModuleExecutionState {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            success_count: 0,
            failure_count: 0,
            last_error: None,
            last_error_kind: None,
            min_duration: None,
            max_duration: None,
            avg_duration: None,
            last_execution: None,
            created_at: SystemTime::now(),
        }
    }

    /// Updates the state after a successful invocation.
    pub fn record_success(&mut self, duration: Duration) {
        self.success_count += 1;
        self.last_error = None;
        self.last_error_kind = None;
        self.last_execution = Some(SystemTime::now());

        self.min_duration = Some(self.min_duration.map_or(duration, |d| d.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |d| d.max(duration)));

        let previous = self.avg_duration.unwrap_or_default().as_nanos();
        let total = previous * u128::from(self.success_count - 1) + duration.as_nanos();
        let avg = total / u128::from(self.success_count);
        self.avg_duration = Some(Duration::from_nanos(avg.min(u128::from(u64::MAX)) as u64));
    }

    /// Updates the state after a failed invocation.
    pub fn record_failure(&mut self, error: &HostError) {
        self.failure_count += 1;
        self.last_error = Some(error.to_string());
        self.last_error_kind = Some(error.kind());
        self.last_execution = Some(SystemTime::now());
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            (self.success_count as f64 / total as f64) * 100.0
        }
    }
}

/// Record of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub invocation_id: InvocationId,
    pub module: String,
    pub entry_point: String,
    pub started_at: SystemTime,
    pub duration: Duration,
    /// Attempts made, including retries
    pub attempts: u32,
    pub status: ExecutionStatus,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl ExecutionRecord {
    pub fn new(
        invocation_id: InvocationId,
        module: impl Into<String>,
        entry_point: impl Into<String>,
        started_at: SystemTime,
    ) -> Self {
        Self {
            invocation_id,
            module: module.into(),
            entry_point: entry_point.into(),
            started_at,
            duration: Duration::ZERO,
            attempts: 0,
            status: ExecutionStatus::Succeeded,
            error_kind: None,
            error_message: None,
        }
    }

    /// Marks the invocation as completed successfully.
    pub fn complete_success(&mut self, duration: Duration, attempts: u32) {
        self.duration = duration;
        self.attempts = attempts;
        self.status = ExecutionStatus::Succeeded;
    }

    /// Marks the invocation as failed.
    pub fn complete_failure(&mut self, duration: Duration, attempts: u32, error: &HostError) {
        self.duration = duration;
        self.attempts = attempts;
        self.status = ExecutionStatus::Failed;
        self.error_kind = Some(error.kind());
        self.error_message = Some(error.to_string());
    }
}

/// Inner state store implementation.
struct StateStoreInner {
    states: RwLock<HashMap<String, ModuleExecutionState>>,
    history: RwLock<HashMap<String, VecDeque<ExecutionRecord>>>,
    history_limit: usize,
    max_modules: usize,
}

/// In-memory execution state store; clones share the same data.
#[derive(Clone)]
pub struct ExecutionStateStore {
    inner: Arc<StateStoreInner>,
}

impl ExecutionStateStore {
    /// Creates a store keeping at most `history_limit` records for each of
    /// at most `max_modules` modules.
    pub fn new(history_limit: usize, max_modules: usize) -> Self {
        Self {
            inner: Arc::new(StateStoreInner {
                states: RwLock::new(HashMap::new()),
                history: RwLock::new(HashMap::new()),
                history_limit,
                max_modules: max_modules.max(1),
            }),
        }
    }

    /// Folds a finished invocation into module state and history.
    pub fn record(&self, record: ExecutionRecord, error: Option<&HostError>) {
        let evicted = {
            let mut states = self
                .inner
                .states
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let evicted = if states.contains_key(&record.module) {
                None
            } else {
                self.evict_least_recent(&mut states)
            };
            let state = states
                .entry(record.module.clone())
                .or_insert_with(|| ModuleExecutionState::new(record.module.clone()));
            match error {
                Some(error) => state.record_failure(error),
                None => state.record_success(record.duration),
            }
            evicted
        };

        let mut history = self
            .inner
            .history
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(evicted) = evicted {
            history.remove(&evicted);
        }
        if self.inner.history_limit == 0 {
            return;
        }

        let entries = history.entry(record.module.clone()).or_default();
        entries.push_back(record);
        while entries.len() > self.inner.history_limit {
            if let Some(evicted) = entries.pop_front() {
                debug!(
                    "Dropped history record {} for module '{}'",
                    evicted.invocation_id, evicted.module
                );
            }
        }
    }

    /// Gets the state of a module, if it was ever invoked.
    pub fn module_state(&self, module: &str) -> Option<ModuleExecutionState> {
        self.inner
            .states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .cloned()
    }

    /// Most recent records for a module, newest first.
    pub fn history(&self, module: &str, limit: Option<usize>) -> Vec<ExecutionRecord> {
        let history = self
            .inner
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match history.get(module) {
            Some(entries) => entries
                .iter()
                .rev()
                .take(limit.unwrap_or(usize::MAX))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Number of modules with tracked state.
    pub fn tracked_modules(&self) -> usize {
        self.inner
            .states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Makes room for one more module when the store is full.
    fn evict_least_recent(
        &self,
        states: &mut HashMap<String, ModuleExecutionState>,
    ) -> Option<String> {
        if states.len() < self.inner.max_modules {
            return None;
        }
        let oldest = states
            .values()
            .min_by_key(|state| state.last_execution.unwrap_or(state.created_at))
            .map(|state| state.module.clone())?;
        states.remove(&oldest);
        debug!("Stopped tracking module '{}'", oldest);
        Some(oldest)
    }
}
