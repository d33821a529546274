//! # DSL Execution Module
//!
//! Hosts script modules as a pluggable DSL layer: resolution, compilation,
//! caching, sandboxed execution and result normalization.
//!
//! ## Key Components
//!
//! * [`DslHost`] - Entry point for running modules and managing the cache
//! * [`ModuleLoader`] - Resolves and compiles modules through the cache
//! * [`ExecutionCache`] - Reference-counted store of compiled artifacts
//! * [`InterpreterSession`] - One sandboxed interpreter with budget enforcement
//! * [`ValueBridge`] - Conversion between host values and script values
//! * [`ResultNormalizer`] - Maps every failure onto the closed error taxonomy
//! * [`HostConfigLoader`] - Configuration loading and validation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dsl_host::dsl_execution::{DslHost, FileSystemResolver, HostConfig};
//! use dsl_host::{BridgedValue, ResourceBudget};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = Arc::new(FileSystemResolver::new("scripts"));
//! let host = DslHost::new(resolver, HostConfig::default())?;
//!
//! let outcome = host.run(
//!     "transform",
//!     "transform",
//!     vec![BridgedValue::from(vec![1, 2, 3, 4])],
//!     ResourceBudget::default(),
//! );
//! println!("{:?}", outcome.into_result()?);
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod loader;
pub mod normalizer;
pub mod pool;
pub mod resolver;
pub mod session;
pub mod state;
pub mod types;

pub use bridge::ValueBridge;
pub use cache::{CacheKey, CacheStats, ExecutionCache};
pub use config::{HostConfig, HostConfigLoader};
pub use engine::InvocationExecutor;
pub use error::{
    BridgeError, ConfigError, ErrorCategory, ErrorKind, ErrorSeverity, HostError,
    InvocationError, LoadError, ResolveError, ResourceKind, SourceLocation, SyntaxDetails,
};
pub use loader::{CompiledModule, LoadedModule, ModuleImporter, ModuleLoader};
pub use normalizer::{RawOutcome, ResultNormalizer};
pub use pool::{PoolStatus, SessionPool};
pub use resolver::{ContentResolver, FileSystemResolver, InMemoryResolver};
pub use session::InterpreterSession;
pub use state::{ExecutionRecord, ExecutionStateStore, ExecutionStatus, ModuleExecutionState};
pub use types::{
    BridgedMap, BridgedValue, EntryPoint, InvocationId, InvocationOutcome, InvocationRequest,
    ResourceBudget, SessionId,
};

use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;

/// Central entry point of the DSL execution host.
///
/// A `DslHost` is cheap to clone; clones share the cache, the session pool
/// and the execution state.
#[derive(Clone)]
pub struct DslHost {
    config: Arc<HostConfig>,
    loader: Arc<ModuleLoader>,
    pool: SessionPool,
    executor: Arc<InvocationExecutor>,
    state: ExecutionStateStore,
}

impl DslHost {
    /// Creates a host with an empty cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration fails validation.
    pub fn new(
        resolver: Arc<dyn ContentResolver>,
        config: HostConfig,
    ) -> Result<Self, ConfigError> {
        config::validate_config(&config)?;

        let loader = Arc::new(ModuleLoader::new(
            resolver,
            ExecutionCache::new(),
            session::build_engine(&config),
        ));
        let importer = (!config.sandbox.allowed_modules.is_empty()).then(|| {
            ModuleImporter::new(
                Arc::clone(&loader),
                config.sandbox.allowed_modules.iter().cloned(),
            )
        });
        let pool = SessionPool::with_importer(config.clone(), importer);
        let state = ExecutionStateStore::new(
            config.monitoring.history_limit,
            config.monitoring.max_tracked_modules,
        );
        let executor = Arc::new(InvocationExecutor::new(
            &config,
            Arc::clone(&loader),
            pool.clone(),
            state.clone(),
        ));

        info!(
            "🏁 DSL host ready (pool size {}, module state reuse {})",
            config.execution.pool_size, config.execution.reuse_module_state
        );

        Ok(Self {
            config: Arc::new(config),
            loader,
            pool,
            executor,
            state,
        })
    }

    /// Runs `entry_point` of `module` with `args` under `budget`.
    ///
    /// Blocks until the call completes, fails or runs out of budget. The
    /// outcome is always populated; failures never panic the host.
    pub fn run(
        &self,
        module: &str,
        entry_point: &str,
        args: Vec<BridgedValue>,
        budget: ResourceBudget,
    ) -> InvocationOutcome {
        self.run_request(&InvocationRequest::new(module, entry_point, args, budget))
    }

    /// Like [`DslHost::run`] with JSON arguments. Arguments that cannot be
    /// bridged fail with [`HostError::Bridge`] before the module is loaded.
    pub fn run_json(
        &self,
        module: &str,
        entry_point: &str,
        args: Vec<serde_json::Value>,
        budget: ResourceBudget,
    ) -> InvocationOutcome {
        let args = match args
            .into_iter()
            .map(BridgedValue::try_from)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(args) => args,
            Err(error) => {
                warn!("❌ {}::{} rejected its arguments: {}", module, entry_point, error);
                return InvocationOutcome::Failure(HostError::Bridge(error));
            }
        };
        self.run(module, entry_point, args, budget)
    }

    pub fn run_request(&self, request: &InvocationRequest) -> InvocationOutcome {
        self.executor.execute(request)
    }

    /// Runs a request on the blocking thread pool of the current tokio runtime.
    pub async fn run_async(&self, request: InvocationRequest) -> InvocationOutcome {
        let host = self.clone();
        match tokio::task::spawn_blocking(move || host.run_request(&request)).await {
            Ok(outcome) => outcome,
            Err(e) => InvocationOutcome::Failure(
                InvocationError::runtime_fault(format!("Invocation worker failed: {}", e)).into(),
            ),
        }
    }

    /// Evaluates a standalone expression with `variables` in scope.
    pub fn eval_expression(
        &self,
        expression: &str,
        variables: &BridgedMap,
        budget: ResourceBudget,
    ) -> InvocationOutcome {
        let mut session = self.pool.checkout();
        session.eval_expression(expression, variables, &budget)
    }

    /// Reads one global defined by the top-level statements of `module`.
    pub fn read_global(
        &self,
        module: &str,
        name: &str,
        budget: ResourceBudget,
    ) -> InvocationOutcome {
        let start = Instant::now();
        let loaded = match self.loader.load(module) {
            Ok(loaded) => loaded,
            Err(error) => {
                return self.executor.load_failed(
                    error,
                    module,
                    name,
                    budget.max_wall_time,
                    start.elapsed(),
                )
            }
        };
        let mut session = self.pool.checkout();
        session.read_global(&loaded, name, &budget)
    }

    /// Loads a module without executing it.
    pub fn load(&self, module: &str) -> Result<LoadedModule, LoadError> {
        self.loader.load(module)
    }

    /// Entry points exposed by `module`.
    pub fn entry_points(&self, module: &str) -> Result<Vec<EntryPoint>, LoadError> {
        Ok(self.loader.load(module)?.entry_points.clone())
    }

    /// Drops the cached artifact of `module`; returns whether one existed.
    pub fn invalidate(&self, module: &str) -> bool {
        let removed = self.loader.cache().invalidate(module);
        if removed {
            info!("♻️ Invalidated module '{}'", module);
        }
        removed
    }

    /// Drops every cached artifact; returns how many were live.
    pub fn clear(&self) -> usize {
        let count = self.loader.cache().clear();
        self.pool.reset_module_state();
        info!("🧹 Cleared {} cached modules", count);
        count
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.loader.cache().stats()
    }

    /// Number of compilations performed since the host was created.
    pub fn compile_count(&self) -> u64 {
        self.loader.compile_count()
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn module_state(&self, module: &str) -> Option<ModuleExecutionState> {
        self.state.module_state(module)
    }

    /// Most recent invocations of `module`, newest first.
    pub fn execution_history(&self, module: &str, limit: Option<usize>) -> Vec<ExecutionRecord> {
        self.state.history(module, limit)
    }

    /// Budget built from the configured defaults.
    pub fn default_budget(&self) -> ResourceBudget {
        self.config.default_budget()
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(modules: &[(&str, &str)]) -> DslHost {
        let resolver = Arc::new(InMemoryResolver::with_modules(modules.iter().copied()));
        DslHost::new(resolver, HostConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = HostConfig::default();
        config.execution.pool_size = 0;
        assert!(DslHost::new(Arc::new(InMemoryResolver::new()), config).is_err());
    }

    #[test]
    fn test_run_and_history() {
        let host = host(&[("math", "fn double(x) { x * 2 }")]);
        let outcome = host.run("math", "double", vec![BridgedValue::from(21)], host.default_budget());
        assert_eq!(outcome, InvocationOutcome::Success(BridgedValue::Int(42)));

        let state = host.module_state("math").unwrap();
        assert_eq!(state.success_count, 1);
        assert_eq!(host.execution_history("math", None).len(), 1);
    }

    #[test]
    fn test_run_json_bridges_arguments() {
        let host = host(&[("math", "fn double(x) { x * 2 }")]);
        let outcome =
            host.run_json("math", "double", vec![serde_json::json!(21)], host.default_budget());
        assert_eq!(outcome, InvocationOutcome::Success(BridgedValue::Int(42)));

        let outcome = host.run_json(
            "math",
            "double",
            vec![serde_json::json!(u64::MAX)],
            host.default_budget(),
        );
        assert!(matches!(
            outcome.error(),
            Some(HostError::Bridge(BridgeError::NumericOverflow { .. }))
        ));
        assert_eq!(outcome.error().map(HostError::kind), Some(ErrorKind::NumericOverflow));
        assert_eq!(host.execution_history("math", None).len(), 1);
    }

    #[test]
    fn test_entry_points() {
        let host = host(&[("math", "fn double(x) { x * 2 }\nfn zero() { 0 }")]);
        let mut names: Vec<String> = host
            .entry_points("math")
            .unwrap()
            .into_iter()
            .map(|e| e.to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["double(x)".to_string(), "zero()".to_string()]);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let host = host(&[("a", "fn main() { 1 }"), ("b", "fn main() { 2 }")]);
        host.load("a").unwrap();
        host.load("b").unwrap();

        assert!(host.invalidate("a"));
        assert!(!host.invalidate("a"));
        assert_eq!(host.clear(), 1);
        assert_eq!(host.cache_stats().live_entries, 0);
    }
}
