//! Result and error normalization.
//!
//! Every raw interpreter outcome passes through [`ResultNormalizer`] and
//! leaves as an [`InvocationOutcome`]. Interpreter error types stop here.

use super::bridge::ValueBridge;
use super::error::{HostError, InvocationError, LoadError, ResourceKind, SourceLocation};
use super::types::InvocationOutcome;
use log::{debug, log};
use rhai::{Dynamic, EvalAltResult, Position};
use std::time::Duration;

/// What an interpreter session produced, before normalization.
#[derive(Debug)]
pub enum RawOutcome {
    /// Entry point returned a value
    Returned(Dynamic),
    /// The interpreter reported an error
    Faulted(Box<EvalAltResult>),
    /// No public function with the requested name and arity
    MissingEntryPoint { available: Vec<String> },
    /// The interpreter panicked
    Panicked(String),
    /// The module never reached a session
    LoadFailed(LoadError),
}

/// Invocation details needed to describe a failure.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeContext<'a> {
    pub module: &'a str,
    pub entry_point: &'a str,
    /// Wall-clock budget of the invocation
    pub limit: Duration,
    /// Wall-clock time actually spent
    pub elapsed: Duration,
}

/// Converts raw interpreter outcomes into the host taxonomy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultNormalizer {
    bridge: ValueBridge,
}

impl ResultNormalizer {
    pub fn new(bridge: ValueBridge) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &ValueBridge {
        &self.bridge
    }

    /// Normalizes one raw outcome.
    pub fn normalize(&self, raw: RawOutcome, ctx: NormalizeContext<'_>) -> InvocationOutcome {
        let outcome = match raw {
            RawOutcome::Returned(value) => match self.bridge.to_host(&value) {
                Ok(value) => return InvocationOutcome::Success(value),
                Err(e) => HostError::Invocation(InvocationError::ValueTooComplex(e)),
            },
            RawOutcome::Faulted(error) => {
                HostError::Invocation(self.normalize_eval_error(*error, ctx))
            }
            RawOutcome::MissingEntryPoint { available } => {
                HostError::Invocation(InvocationError::EntryPointNotFound {
                    module: ctx.module.to_string(),
                    entry_point: ctx.entry_point.to_string(),
                    available,
                })
            }
            RawOutcome::Panicked(message) => HostError::Invocation(
                InvocationError::runtime_fault(format!("Interpreter panicked: {}", message)),
            ),
            RawOutcome::LoadFailed(error) => HostError::Load(error),
        };

        log!(
            outcome.severity().log_level(),
            "❌ {}::{} failed [{}]: {}",
            ctx.module,
            ctx.entry_point,
            outcome.kind(),
            outcome
        );
        InvocationOutcome::Failure(outcome)
    }

    /// Maps an interpreter error onto the invocation taxonomy.
    pub fn normalize_eval_error(
        &self,
        error: EvalAltResult,
        ctx: NormalizeContext<'_>,
    ) -> InvocationError {
        let mut frames = Vec::new();
        let root = unwind_calls(error, &mut frames);
        let location = to_location(root.position());

        let resource = |resource: ResourceKind, detail: String| InvocationError::ResourceExceeded {
            module: ctx.module.to_string(),
            entry_point: ctx.entry_point.to_string(),
            resource,
            detail,
        };

        match root {
            EvalAltResult::ErrorTerminated(..) => InvocationError::Timeout {
                module: ctx.module.to_string(),
                entry_point: ctx.entry_point.to_string(),
                limit: ctx.limit,
                elapsed: ctx.elapsed,
            },
            EvalAltResult::ErrorTooManyOperations(_) => {
                resource(ResourceKind::Operations, "operation limit reached".to_string())
            }
            EvalAltResult::ErrorStackOverflow(_) => {
                resource(ResourceKind::CallStack, "call depth limit reached".to_string())
            }
            EvalAltResult::ErrorDataTooLarge(ref what, _) => {
                resource(ResourceKind::Memory, format!("{} exceeds the memory budget", what))
            }
            mut other @ EvalAltResult::ErrorTooManyModules(_) => {
                other.clear_position();
                resource(ResourceKind::Other, other.to_string())
            }
            EvalAltResult::ErrorRuntime(ref value, _) => InvocationError::RuntimeFault {
                message: thrown_message(value),
                location,
                trace: render_trace(&frames),
            },
            mut other => {
                other.clear_position();
                InvocationError::RuntimeFault {
                    message: other.to_string(),
                    location,
                    trace: render_trace(&frames),
                }
            }
        }
    }
}

/// Strips nested-call wrappers, recording one frame per failing call.
fn unwind_calls(error: EvalAltResult, frames: &mut Vec<String>) -> EvalAltResult {
    match error {
        EvalAltResult::ErrorInFunctionCall(name, source, inner, position) => {
            frames.push(describe_frame(&name, &source, position));
            unwind_calls(*inner, frames)
        }
        EvalAltResult::ErrorInModule(_, inner, _) => unwind_calls(*inner, frames),
        other => other,
    }
}

fn describe_frame(name: &str, source: &str, position: Position) -> String {
    let mut frame = format!("in call to function '{}'", name);
    if !source.is_empty() {
        frame.push_str(&format!(" in module '{}'", source));
    }
    if let Some(location) = to_location(position) {
        frame.push_str(&format!(" at {}", location));
    }
    frame
}

fn render_trace(frames: &[String]) -> Option<String> {
    if frames.is_empty() {
        None
    } else {
        debug!("Script call trace has {} frames", frames.len());
        Some(frames.join("\n"))
    }
}

fn thrown_message(value: &Dynamic) -> String {
    if value.is_unit() {
        "script raised an error".to_string()
    } else {
        value.to_string()
    }
}

pub(crate) fn to_location(position: Position) -> Option<SourceLocation> {
    position.line().map(|line| SourceLocation {
        line,
        column: position.position(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl_execution::error::{BridgeError, ErrorKind};
    use crate::dsl_execution::types::BridgedValue;

    fn ctx() -> NormalizeContext<'static> {
        NormalizeContext {
            module: "m",
            entry_point: "main",
            limit: Duration::from_millis(100),
            elapsed: Duration::from_millis(120),
        }
    }

    #[test]
    fn test_returned_value_is_bridged() {
        let normalizer = ResultNormalizer::default();
        let outcome = normalizer.normalize(RawOutcome::Returned(Dynamic::from_int(7)), ctx());
        assert_eq!(outcome, InvocationOutcome::Success(BridgedValue::Int(7)));
    }

    #[test]
    fn test_unbridgeable_value_is_too_complex() {
        let normalizer = ResultNormalizer::new(ValueBridge::new(1));
        let nested = Dynamic::from_array(vec![Dynamic::from_array(vec![Dynamic::from_array(
            vec![],
        )])]);

        let outcome = normalizer.normalize(RawOutcome::Returned(nested), ctx());
        assert_eq!(
            outcome.error().cloned(),
            Some(HostError::Invocation(InvocationError::ValueTooComplex(
                BridgeError::DepthExceeded { limit: 1 }
            )))
        );
    }

    #[test]
    fn test_load_failure_passes_through_unchanged() {
        let normalizer = ResultNormalizer::default();
        let error = LoadError::NotFound {
            module: "m".to_string(),
        };

        let outcome = normalizer.normalize(RawOutcome::LoadFailed(error.clone()), ctx());
        assert_eq!(outcome, InvocationOutcome::Failure(HostError::Load(error)));
    }

    #[test]
    fn test_terminated_becomes_timeout() {
        let normalizer = ResultNormalizer::default();
        let raw = EvalAltResult::ErrorTerminated(Dynamic::from("timeout"), Position::new(3, 5));

        match normalizer.normalize_eval_error(raw, ctx()) {
            InvocationError::Timeout { limit, elapsed, .. } => {
                assert_eq!(limit, Duration::from_millis(100));
                assert_eq!(elapsed, Duration::from_millis(120));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_inside_nested_call_stays_timeout() {
        let normalizer = ResultNormalizer::default();
        let inner = EvalAltResult::ErrorTerminated(Dynamic::UNIT, Position::new(2, 1));
        let raw = EvalAltResult::ErrorInFunctionCall(
            "spin".to_string(),
            String::new(),
            Box::new(inner),
            Position::new(5, 3),
        );

        let error = normalizer.normalize_eval_error(raw, ctx());
        assert!(matches!(error, InvocationError::Timeout { .. }));
    }

    #[test]
    fn test_limits_map_to_resources() {
        let normalizer = ResultNormalizer::default();
        let cases = [
            (
                EvalAltResult::ErrorDataTooLarge("Size of string".to_string(), Position::NONE),
                ResourceKind::Memory,
            ),
            (
                EvalAltResult::ErrorTooManyOperations(Position::NONE),
                ResourceKind::Operations,
            ),
            (
                EvalAltResult::ErrorStackOverflow(Position::NONE),
                ResourceKind::CallStack,
            ),
        ];

        for (raw, expected) in cases {
            match normalizer.normalize_eval_error(raw, ctx()) {
                InvocationError::ResourceExceeded { resource, .. } => assert_eq!(resource, expected),
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[test]
    fn test_runtime_error_carries_location_and_trace() {
        let normalizer = ResultNormalizer::default();
        let thrown = EvalAltResult::ErrorRuntime(Dynamic::from("bad input"), Position::new(4, 9));
        let raw = EvalAltResult::ErrorInFunctionCall(
            "validate".to_string(),
            "m".to_string(),
            Box::new(thrown),
            Position::new(10, 2),
        );

        match normalizer.normalize_eval_error(raw, ctx()) {
            InvocationError::RuntimeFault {
                message,
                location,
                trace,
            } => {
                assert_eq!(message, "bad input");
                assert_eq!(location, Some(SourceLocation { line: 4, column: Some(9) }));
                let trace = trace.unwrap();
                assert!(trace.contains("validate"));
                assert!(trace.contains("line 10"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_entry_point_lists_available() {
        let normalizer = ResultNormalizer::default();
        let outcome = normalizer.normalize(
            RawOutcome::MissingEntryPoint {
                available: vec!["main()".to_string()],
            },
            ctx(),
        );
        let error = outcome.error().unwrap();
        assert_eq!(error.kind(), ErrorKind::EntryPointNotFound);
    }

    #[test]
    fn test_panic_is_runtime_fault() {
        let normalizer = ResultNormalizer::default();
        let outcome = normalizer.normalize(RawOutcome::Panicked("boom".to_string()), ctx());
        assert_eq!(outcome.error().map(HostError::kind), Some(ErrorKind::RuntimeFault));
    }
}
