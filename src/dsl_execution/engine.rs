//! Invocation executor.
//!
//! Coordinates one `run`: load the module through the cache, check out a
//! session, invoke the entry point under its budget, optionally retry
//! budget violations on a fresh session, and record the outcome.

use super::bridge::ValueBridge;
use super::config::{HostConfig, RetryConfig};
use super::error::{ErrorKind, HostError, LoadError};
use super::loader::{LoadedModule, ModuleLoader};
use super::normalizer::{NormalizeContext, RawOutcome, ResultNormalizer};
use super::pool::SessionPool;
use super::state::{ExecutionRecord, ExecutionStateStore};
use super::types::{InvocationId, InvocationOutcome, InvocationRequest};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Executes invocation requests against pooled sessions.
pub struct InvocationExecutor {
    loader: Arc<ModuleLoader>,
    pool: SessionPool,
    state: ExecutionStateStore,
    normalizer: ResultNormalizer,
    retry: RetryConfig,
    log_invocations: bool,
}

impl InvocationExecutor {
    pub fn new(
        config: &HostConfig,
        loader: Arc<ModuleLoader>,
        pool: SessionPool,
        state: ExecutionStateStore,
    ) -> Self {
        Self {
            loader,
            pool,
            state,
            normalizer: ResultNormalizer::new(ValueBridge::new(config.limits.max_value_depth)),
            retry: config.retry.clone(),
            log_invocations: config.monitoring.log_invocations,
        }
    }

    /// Runs one request to completion. Never panics and never returns a
    /// raw interpreter error.
    pub fn execute(&self, request: &InvocationRequest) -> InvocationOutcome {
        let invocation_id = InvocationId::new();
        let started_at = SystemTime::now();
        let start = Instant::now();

        if self.log_invocations {
            info!(
                "🚀 Starting invocation {} of {}::{}",
                invocation_id, request.module, request.entry_point
            );
        }

        let (outcome, attempts) = match self.loader.load(&request.module) {
            Ok(module) => self.invoke_with_retry(&module, request),
            Err(error @ LoadError::NotFound { .. }) => {
                // Unknown names get no per-module state.
                return self.load_failed(
                    error,
                    &request.module,
                    &request.entry_point,
                    request.budget.max_wall_time,
                    start.elapsed(),
                );
            }
            Err(error) => {
                let outcome = self.load_failed(
                    error,
                    &request.module,
                    &request.entry_point,
                    request.budget.max_wall_time,
                    start.elapsed(),
                );
                (outcome, 0)
            }
        };

        let duration = start.elapsed();
        let mut record = ExecutionRecord::new(
            invocation_id,
            request.module.as_str(),
            request.entry_point.as_str(),
            started_at,
        );
        match &outcome {
            InvocationOutcome::Success(_) => {
                if self.log_invocations {
                    info!(
                        "✅ Invocation {} completed in {:?} ({} attempts)",
                        invocation_id, duration, attempts
                    );
                }
                record.complete_success(duration, attempts);
                self.state.record(record, None);
            }
            InvocationOutcome::Failure(error) => {
                record.complete_failure(duration, attempts, error);
                self.state.record(record, Some(error));
            }
        }

        outcome
    }

    /// Normalizes a failure that happened before any session was involved.
    pub fn load_failed(
        &self,
        error: LoadError,
        module: &str,
        entry_point: &str,
        limit: Duration,
        elapsed: Duration,
    ) -> InvocationOutcome {
        let ctx = NormalizeContext {
            module,
            entry_point,
            limit,
            elapsed,
        };
        self.normalizer.normalize(RawOutcome::LoadFailed(error), ctx)
    }

    fn invoke_with_retry(
        &self,
        module: &LoadedModule,
        request: &InvocationRequest,
    ) -> (InvocationOutcome, u32) {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = self.invoke_once(module, request);

            match outcome.error() {
                Some(error) if attempt < max_attempts && self.should_retry(error) => {
                    warn!(
                        "🔄 Retrying {}::{} after {} (attempt {}/{})",
                        request.module,
                        request.entry_point,
                        error.kind(),
                        attempt + 1,
                        max_attempts
                    );
                }
                _ => return (outcome, attempt),
            }
        }
    }

    fn invoke_once(&self, module: &LoadedModule, request: &InvocationRequest) -> InvocationOutcome {
        let mut session = self.pool.checkout();
        debug!("Checked out session {} for {}", session.id(), module.key());
        session.invoke(module, &request.entry_point, &request.args, &request.budget)
    }

    fn should_retry(&self, error: &HostError) -> bool {
        match error.kind() {
            ErrorKind::Timeout => self.retry.retry_on_timeout,
            ErrorKind::ResourceExceeded => self.retry.retry_on_resource_exhaustion,
            _ => false,
        }
    }
}
