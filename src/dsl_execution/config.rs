//! Configuration management for the DSL execution host.
//!
//! Configuration can be built in code, loaded from a TOML or JSON file, or
//! assembled from `DSL_HOST_*` environment variables. Every section defaults
//! independently, so partial files are accepted.

use super::error::ConfigError;
use super::types::ResourceBudget;
use crate::constants::{
    DEFAULT_HISTORY_LIMIT, DEFAULT_MAX_CALL_LEVELS, DEFAULT_MAX_EXPR_DEPTH,
    DEFAULT_MAX_FUNCTION_EXPR_DEPTH, DEFAULT_MAX_MEMORY_BYTES, DEFAULT_MAX_TRACKED_MODULES,
    DEFAULT_MAX_VALUE_DEPTH, DEFAULT_POOL_SIZE, DEFAULT_TIMEOUT_MS, ENV_PREFIX,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Configuration for the DSL execution host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Session pool and default budget settings
    pub execution: ExecutionConfig,
    /// Interpreter and bridge limits
    pub limits: LimitsConfig,
    /// Retry behavior for budget violations
    pub retry: RetryConfig,
    /// Language surface exposed to scripts
    pub sandbox: SandboxConfig,
    /// Logging and execution history settings
    pub monitoring: MonitoringConfig,
}

impl HostConfig {
    /// Budget applied when a caller does not supply one.
    pub fn default_budget(&self) -> ResourceBudget {
        ResourceBudget::new(
            Duration::from_millis(self.execution.default_timeout_ms),
            self.execution.default_max_memory_bytes,
        )
    }
}

/// Execution-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum number of interpreter sessions
    pub pool_size: usize,
    /// Keep module globals alive between invocations on the same session
    pub reuse_module_state: bool,
    /// Wall-clock limit of the default budget
    pub default_timeout_ms: u64,
    /// Memory ceiling of the default budget
    pub default_max_memory_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            reuse_module_state: false,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            default_max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
        }
    }
}

/// Interpreter and value bridge limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum nesting accepted by the value bridge
    pub max_value_depth: usize,
    /// Maximum script call depth
    pub max_call_levels: usize,
    /// Maximum expression nesting at global level
    pub max_expr_depth: usize,
    /// Maximum expression nesting inside functions
    pub max_function_expr_depth: usize,
    /// Operation ceiling per invocation; 0 means unlimited
    pub max_operations: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_value_depth: DEFAULT_MAX_VALUE_DEPTH,
            max_call_levels: DEFAULT_MAX_CALL_LEVELS,
            max_expr_depth: DEFAULT_MAX_EXPR_DEPTH,
            max_function_expr_depth: DEFAULT_MAX_FUNCTION_EXPR_DEPTH,
            max_operations: 0,
        }
    }
}

/// Retry behavior configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per invocation, including the first
    pub max_attempts: u32,
    /// Retry invocations that ran out of time
    pub retry_on_timeout: bool,
    /// Retry invocations that hit a resource ceiling
    pub retry_on_resource_exhaustion: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_on_timeout: false,
            retry_on_resource_exhaustion: false,
        }
    }
}

/// Sandbox configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Keywords and operators scripts may not use
    pub disabled_symbols: Vec<String>,
    /// Forward script `print` and `debug` output to the log facade
    pub forward_print: bool,
    /// Hosted modules scripts may `import`; imports are refused when empty
    pub allowed_modules: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            disabled_symbols: vec!["eval".to_string()],
            forward_print: true,
            allowed_modules: Vec::new(),
        }
    }
}

/// Monitoring and logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Execution records kept per module
    pub history_limit: usize,
    /// Modules with tracked state; the least recently run one is evicted
    pub max_tracked_modules: usize,
    /// Log every invocation at info level
    pub log_invocations: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_tracked_modules: DEFAULT_MAX_TRACKED_MODULES,
            log_invocations: true,
        }
    }
}

/// Inner configuration loader implementation.
struct ConfigLoaderInner {
    config: RwLock<HostConfig>,
    config_path: Option<PathBuf>,
}

impl ConfigLoaderInner {
    fn new(config: HostConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            config: RwLock::new(config),
            config_path,
        }
    }
}

fn load_from_file(path: &Path) -> Result<HostConfig, ConfigError> {
    let display = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: display.clone(),
        message: e.to_string(),
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: display,
            message: e.to_string(),
        }),
        Some("json") => serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: display,
            message: e.to_string(),
        }),
        _ => Err(ConfigError::UnsupportedFormat { path: display }),
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    suffix: &str,
) -> Result<Option<T>, ConfigError> {
    let name = format!("{}_{}", ENV_PREFIX, suffix);
    match lookup(&name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::invalid(name, format!("cannot parse '{}'", raw))),
        None => Ok(None),
    }
}

fn load_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<HostConfig, ConfigError> {
    let mut config = HostConfig::default();

    if let Some(size) = parse_var(&lookup, "POOL_SIZE")? {
        config.execution.pool_size = size;
    }
    if let Some(reuse) = parse_var(&lookup, "REUSE_MODULE_STATE")? {
        config.execution.reuse_module_state = reuse;
    }
    if let Some(ms) = parse_var(&lookup, "DEFAULT_TIMEOUT_MS")? {
        config.execution.default_timeout_ms = ms;
    }
    if let Some(bytes) = parse_var(&lookup, "DEFAULT_MAX_MEMORY_BYTES")? {
        config.execution.default_max_memory_bytes = bytes;
    }
    if let Some(depth) = parse_var(&lookup, "MAX_VALUE_DEPTH")? {
        config.limits.max_value_depth = depth;
    }
    if let Some(attempts) = parse_var(&lookup, "MAX_ATTEMPTS")? {
        config.retry.max_attempts = attempts;
    }

    Ok(config)
}

/// Validates configuration.
pub fn validate_config(config: &HostConfig) -> Result<(), ConfigError> {
    if config.execution.pool_size == 0 {
        return Err(ConfigError::invalid(
            "execution.pool_size",
            "Pool size must be greater than 0",
        ));
    }

    if config.execution.default_timeout_ms == 0 {
        return Err(ConfigError::invalid(
            "execution.default_timeout_ms",
            "Default timeout must be greater than 0",
        ));
    }

    if config.execution.default_max_memory_bytes == 0 {
        return Err(ConfigError::invalid(
            "execution.default_max_memory_bytes",
            "Default memory ceiling must be greater than 0",
        ));
    }

    if config.limits.max_value_depth == 0 {
        return Err(ConfigError::invalid(
            "limits.max_value_depth",
            "Maximum value depth must be greater than 0",
        ));
    }

    if config.retry.max_attempts == 0 {
        return Err(ConfigError::invalid(
            "retry.max_attempts",
            "Max retry attempts must be greater than 0",
        ));
    }

    if config.monitoring.max_tracked_modules == 0 {
        return Err(ConfigError::invalid(
            "monitoring.max_tracked_modules",
            "Tracked module limit must be greater than 0",
        ));
    }

    Ok(())
}

/// Configuration loader for the DSL execution host.
pub struct HostConfigLoader {
    inner: Arc<ConfigLoaderInner>,
}

impl HostConfigLoader {
    /// Creates a new configuration loader with the provided config.
    pub fn new(config: HostConfig) -> Result<Self, ConfigError> {
        validate_config(&config)?;
        Ok(Self {
            inner: Arc::new(ConfigLoaderInner::new(config, None)),
        })
    }

    /// Creates a configuration loader from a `.toml` or `.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = load_from_file(path)?;
        validate_config(&config)?;
        debug!("Loaded host configuration from {:?}", path);
        Ok(Self {
            inner: Arc::new(ConfigLoaderInner::new(config, Some(path.to_path_buf()))),
        })
    }

    /// Creates a configuration loader from `DSL_HOST_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let config = load_from_lookup(lookup)?;
        validate_config(&config)?;
        Ok(Self {
            inner: Arc::new(ConfigLoaderInner::new(config, None)),
        })
    }

    /// Gets the current configuration.
    pub fn get_config(&self) -> HostConfig {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Updates the configuration.
    pub fn set_config(&self, config: HostConfig) -> Result<(), ConfigError> {
        validate_config(&config)?;
        *self
            .inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
        info!("Host configuration updated");
        Ok(())
    }

    /// Reloads configuration from the file it was loaded from, or from the
    /// environment.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let config = match &self.inner.config_path {
            Some(path) => load_from_file(path)?,
            None => load_from_lookup(|name| std::env::var(name).ok())?,
        };
        self.set_config(config)?;
        info!("Host configuration reloaded");
        Ok(())
    }

    /// Path the configuration was loaded from, if any.
    pub fn config_path(&self) -> Option<&Path> {
        self.inner.config_path.as_deref()
    }

    /// Validates the current configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_config(&self.get_config())
    }
}
