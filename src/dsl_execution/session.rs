//! Sandboxed interpreter sessions.
//!
//! A session owns one interpreter engine and executes one call at a time.
//! Every call runs under a wall-clock deadline checked from the engine's
//! progress callback and a memory ceiling translated into the engine's
//! value size limits. A session that timed out, ran out of a resource or
//! panicked is poisoned and must not serve further calls.

use super::bridge::ValueBridge;
use super::config::HostConfig;
use super::error::InvocationError;
use super::loader::{syntax_error, CompiledModule, LoadedModule, ModuleImporter};
use super::normalizer::{NormalizeContext, RawOutcome, ResultNormalizer};
use super::types::{BridgedValue, InvocationOutcome, ResourceBudget, SessionId};
use crate::constants::{EXPRESSION_MODULE_NAME, SCRIPT_LOG_TARGET};
use indexmap::IndexMap;
use log::{debug, info, warn};
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, Map, Position, Scope};
use std::any::Any;
use std::collections::HashMap;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Instant;

/// Operations between two deadline checks.
const DEADLINE_CHECK_INTERVAL: u64 = 256;

/// Builds an engine with the host's sandbox restrictions and limits.
///
/// Module imports are disabled until a session is given a
/// [`ModuleImporter`]. The same builder is used for the compile engine, so
/// anything the sandbox forbids fails at load time.
pub fn build_engine(config: &HostConfig) -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(DummyModuleResolver::new());

    for symbol in &config.sandbox.disabled_symbols {
        engine.disable_symbol(symbol.as_str());
    }

    let limits = &config.limits;
    engine.set_max_expr_depths(limits.max_expr_depth, limits.max_function_expr_depth);
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_operations(limits.max_operations);

    if config.sandbox.forward_print {
        engine.on_print(|text| info!(target: SCRIPT_LOG_TARGET, "{}", text));
        engine.on_debug(|text, source, position| {
            debug!(
                target: SCRIPT_LOG_TARGET,
                "[{}] {:?}: {}",
                source.unwrap_or("script"),
                position,
                text
            )
        });
    } else {
        engine.on_print(|_| {});
        engine.on_debug(|_, _, _| {});
    }

    engine
}

/// Module globals kept between calls when state reuse is enabled.
struct RetainedGlobals {
    artifact: Weak<CompiledModule>,
    globals: Dynamic,
}

/// One interpreter instance.
pub struct InterpreterSession {
    id: SessionId,
    engine: Engine,
    deadline: Arc<Mutex<Option<Instant>>>,
    normalizer: ResultNormalizer,
    reuse_module_state: bool,
    retained: HashMap<String, RetainedGlobals>,
    poisoned: bool,
    invocations: u64,
}

impl InterpreterSession {
    /// Creates a session with a fresh engine built from `config`.
    pub fn new(config: &HostConfig) -> Self {
        let mut engine = build_engine(config);
        let deadline: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

        let watched = Arc::clone(&deadline);
        engine.on_progress(move |operations| {
            if operations % DEADLINE_CHECK_INTERVAL != 0 {
                return None;
            }
            let deadline = *watched.lock().unwrap_or_else(PoisonError::into_inner);
            match deadline {
                Some(deadline) if Instant::now() >= deadline => Some(Dynamic::from("timeout")),
                _ => None,
            }
        });

        let id = SessionId::new();
        debug!("🆕 Created interpreter session {}", id);

        Self {
            id,
            engine,
            deadline,
            normalizer: ResultNormalizer::new(ValueBridge::new(config.limits.max_value_depth)),
            reuse_module_state: config.execution.reuse_module_state,
            retained: HashMap::new(),
            poisoned: false,
            invocations: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Whether the session must be discarded instead of reused.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    /// Lets scripts on this session import the importer's allowed modules.
    pub fn allow_imports(&mut self, importer: ModuleImporter) {
        self.engine.set_module_resolver(importer);
    }

    /// Drops any module globals retained by this session.
    pub fn reset_module_state(&mut self) {
        self.retained.clear();
    }

    /// Calls `entry_point` of `module` with `args` under `budget`.
    pub fn invoke(
        &mut self,
        module: &LoadedModule,
        entry_point: &str,
        args: &[BridgedValue],
        budget: &ResourceBudget,
    ) -> InvocationOutcome {
        debug!(
            "▶️ Session {} invoking {}::{} with {} args",
            self.id,
            module.name,
            entry_point,
            args.len()
        );

        let artifact = Arc::clone(module.artifact());
        let args: Vec<Dynamic> = args
            .iter()
            .map(|arg| self.normalizer.bridge().to_embedded(arg))
            .collect();

        self.guarded(&artifact.name, entry_point, budget, |session| {
            if artifact.entry_point(entry_point, args.len()).is_none() {
                return RawOutcome::MissingEntryPoint {
                    available: artifact.available(),
                };
            }
            match session.call_entry_point(&artifact, entry_point, args) {
                Ok(value) => RawOutcome::Returned(value),
                Err(error) => RawOutcome::Faulted(error),
            }
        })
    }

    /// Evaluates the top-level statements of `module` and returns one global.
    pub fn read_global(
        &mut self,
        module: &LoadedModule,
        name: &str,
        budget: &ResourceBudget,
    ) -> InvocationOutcome {
        let artifact = Arc::clone(module.artifact());

        self.guarded(&artifact.name, name, budget, |session| {
            let globals = match session.module_globals(&artifact) {
                Ok(globals) => globals,
                Err(error) => return RawOutcome::Faulted(error),
            };

            let map = match globals.read_lock::<Map>() {
                Some(map) => map.clone(),
                None => Map::new(),
            };
            session.retain_globals(&artifact, globals);

            match map.get(name) {
                Some(value) => RawOutcome::Returned(value.clone()),
                None => RawOutcome::MissingEntryPoint {
                    available: map.keys().map(|k| k.to_string()).collect(),
                },
            }
        })
    }

    /// Evaluates a standalone expression with named variables in scope.
    pub fn eval_expression(
        &mut self,
        expression: &str,
        variables: &IndexMap<String, BridgedValue>,
        budget: &ResourceBudget,
    ) -> InvocationOutcome {
        let mut scope = Scope::new();
        for (name, value) in variables {
            scope.push_dynamic(name.as_str(), self.normalizer.bridge().to_embedded(value));
        }

        self.guarded(EXPRESSION_MODULE_NAME, "eval", budget, |session| {
            let ast = match session.engine.compile_expression_with_scope(&scope, expression) {
                Ok(ast) => ast,
                Err(error) => {
                    return RawOutcome::LoadFailed(syntax_error(EXPRESSION_MODULE_NAME, &error))
                }
            };
            match session.engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast) {
                Ok(value) => RawOutcome::Returned(value),
                Err(error) => RawOutcome::Faulted(error),
            }
        })
    }

    /// Runs `body` with the budget applied and panics contained, then
    /// normalizes whatever it produced.
    fn guarded<F>(
        &mut self,
        module: &str,
        entry_point: &str,
        budget: &ResourceBudget,
        body: F,
    ) -> InvocationOutcome
    where
        F: FnOnce(&mut Self) -> RawOutcome,
    {
        if self.poisoned {
            warn!("Session {} is poisoned and refused a call", self.id);
            return InvocationOutcome::Failure(
                InvocationError::runtime_fault("Interpreter session is no longer usable").into(),
            );
        }

        self.invocations += 1;
        self.apply_memory_budget(budget.max_memory_bytes);
        let start = Instant::now();
        self.set_deadline(Some(start + budget.max_wall_time));

        let result = catch_unwind(AssertUnwindSafe(|| body(&mut *self)));

        self.set_deadline(None);
        let elapsed = start.elapsed();

        let mut panicked = false;
        let raw = match result {
            Ok(RawOutcome::Returned(_)) if elapsed > budget.max_wall_time => {
                // Finished, but only after an uninterruptible stretch overran the deadline.
                RawOutcome::Faulted(Box::new(EvalAltResult::ErrorTerminated(
                    Dynamic::UNIT,
                    Position::NONE,
                )))
            }
            Ok(raw) => raw,
            Err(payload) => {
                panicked = true;
                RawOutcome::Panicked(panic_message(payload))
            }
        };

        let ctx = NormalizeContext {
            module,
            entry_point,
            limit: budget.max_wall_time,
            elapsed,
        };
        let outcome = self.normalizer.normalize(raw, ctx);

        let exhausted = outcome.error().map(|e| e.is_retryable()).unwrap_or(false);
        if panicked || exhausted {
            self.poison();
        }

        outcome
    }

    fn call_entry_point(
        &mut self,
        artifact: &Arc<CompiledModule>,
        entry_point: &str,
        args: Vec<Dynamic>,
    ) -> Result<Dynamic, Box<EvalAltResult>> {
        let mut globals = self.module_globals(artifact)?;
        let mut scope = Scope::new();

        let options = CallFnOptions::new()
            .eval_ast(false)
            .rewind_scope(true)
            .bind_this_ptr(&mut globals);
        let result = self.engine.call_fn_with_options::<Dynamic>(
            options,
            &mut scope,
            &artifact.ast,
            entry_point,
            args,
        );

        self.retain_globals(artifact, globals);
        result
    }

    /// Globals of `artifact` as a map, either retained from an earlier call
    /// or rebuilt by running the module's top-level statements.
    fn module_globals(
        &mut self,
        artifact: &Arc<CompiledModule>,
    ) -> Result<Dynamic, Box<EvalAltResult>> {
        if self.reuse_module_state {
            if let Some(retained) = self.retained.remove(&artifact.name) {
                let current = retained
                    .artifact
                    .upgrade()
                    .map(|a| Arc::ptr_eq(&a, artifact))
                    .unwrap_or(false);
                if current {
                    return Ok(retained.globals);
                }
                debug!(
                    "Discarding globals of a previous build of module '{}'",
                    artifact.name
                );
            }
        }

        let mut scope = Scope::new();
        self.engine.run_ast_with_scope(&mut scope, &artifact.ast)?;

        let mut globals = Map::new();
        for (name, _constant, value) in scope.iter() {
            globals.insert(name.into(), value);
        }
        Ok(Dynamic::from_map(globals))
    }

    fn retain_globals(&mut self, artifact: &Arc<CompiledModule>, globals: Dynamic) {
        if self.reuse_module_state {
            self.retained.insert(
                artifact.name.clone(),
                RetainedGlobals {
                    artifact: Arc::downgrade(artifact),
                    globals,
                },
            );
        }
    }

    fn apply_memory_budget(&mut self, max_memory_bytes: usize) {
        let slots = (max_memory_bytes / mem::size_of::<Dynamic>()).max(1);
        self.engine.set_max_string_size(max_memory_bytes.max(1));
        self.engine.set_max_array_size(slots);
        self.engine.set_max_map_size(slots);
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        *self
            .deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    fn poison(&mut self) {
        if !self.poisoned {
            warn!("☠️ Session {} poisoned after a failed invocation", self.id);
        }
        self.poisoned = true;
        self.retained.clear();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
