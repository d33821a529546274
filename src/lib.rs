//! # DSL Execution Host
//!
//! This library hosts scripting-language modules as a pluggable domain-specific
//! language layer. It discovers script modules through a content resolver,
//! compiles and caches them, executes designated entry points inside sandboxed
//! interpreter sessions and hands results back as host-native structured values.
//!
//! ## Core Components
//!
//! * `dsl_execution` - Host facade, module loader, execution cache, interpreter
//!   sessions, value bridge and error normalization
//! * `constants` - Default limits shared by configuration and budgets
//!
//! ## Architecture
//!
//! A caller asks the [`DslHost`] to run an entry point of a named module. The
//! module loader resolves the source, consults the execution cache keyed by
//! module name and content hash, and compiles on a miss. A pooled interpreter
//! session then executes the entry point under a mandatory resource budget.
//! Every outcome is normalized into a closed error taxonomy so script failures
//! never escape as host faults.

pub mod constants;
pub mod dsl_execution;

pub use dsl_execution::{
    BridgedValue, DslHost, HostConfig, HostError, InvocationOutcome, InvocationRequest,
    ResourceBudget,
};
