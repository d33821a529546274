/// Common constants used across the DSL host.
///
/// These defaults are used for configuration and resource budgets when
/// explicit values are not provided.
pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_MEMORY_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_VALUE_DEPTH: usize = 64;
pub const DEFAULT_MAX_CALL_LEVELS: usize = 64;
pub const DEFAULT_MAX_EXPR_DEPTH: usize = 64;
pub const DEFAULT_MAX_FUNCTION_EXPR_DEPTH: usize = 32;
pub const DEFAULT_HISTORY_LIMIT: usize = 100;
pub const DEFAULT_MAX_TRACKED_MODULES: usize = 1024;

/// File extension of script modules on disk.
pub const MODULE_EXTENSION: &str = "rhai";

/// Prefix for configuration environment variables.
pub const ENV_PREFIX: &str = "DSL_HOST";

/// Log target for output produced by scripts.
pub const SCRIPT_LOG_TARGET: &str = "dsl_host::script";

/// Module name reported for ad hoc expressions.
pub const EXPRESSION_MODULE_NAME: &str = "<expression>";
