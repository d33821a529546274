//! Common test utilities and fixtures for DSL host tests
//!
//! Provides an in-memory module bundle, host construction helpers and the
//! script modules shared by the integration tests.
#![allow(dead_code)]

use dsl_host::dsl_execution::{DslHost, HostConfig, InMemoryResolver};
use std::sync::Arc;
use std::time::Duration;

/// Returns the three-key configuration mapping.
pub const CONFIG_MODULE: &str = r#"
const DATABASE_URL = "postgresql://localhost:5432/rust202";
const MAX_CONNECTIONS = 100;

fn get_config() {
    #{
        database_url: this.DATABASE_URL,
        max_connections: this.MAX_CONNECTIONS,
        features: #{ enable_caching: true },
    }
}
"#;

/// Squares the even numbers of its input.
pub const TRANSFORM_MODULE: &str = r#"
fn transform(items) {
    items.filter(|x| x % 2 == 0).map(|x| x * x)
}
"#;

/// Mutates a module global in one entry point and reads it in another.
pub const COUNTER_MODULE: &str = r#"
let counter = 0;

fn bump() {
    this.counter += 1;
    this.counter
}

fn read() {
    this.counter
}
"#;

/// Never returns.
pub const SPIN_MODULE: &str = r#"
fn main() {
    let n = 0;
    loop { n += 1; }
}
"#;

/// Returns a map that holds a closure capturing the map itself. Function
/// pointers have no bridged form.
pub const CLOSURE_VALUE_MODULE: &str = r#"
fn main() {
    let node = #{ name: "root" };
    let link = || node;
    node.link = link;
    node
}
"#;

pub const BROKEN_MODULE: &str = "fn main( { 1 }";

pub const HELPERS_MODULE: &str = "fn double(x) { x * 2 }";

/// Imports `helpers` and `secret` from inside entry points.
pub const IMPORTING_MODULE: &str = r#"
fn main(x) {
    import "helpers" as h;
    h::double(x)
}

fn leak() {
    import "secret" as s;
    s::key()
}
"#;

/// Shared fixture: a host over an in-memory bundle that tests can edit.
pub struct HostFixture {
    pub host: DslHost,
    pub resolver: Arc<InMemoryResolver>,
}

impl HostFixture {
    /// Host with default configuration over the standard test modules.
    pub fn new() -> Self {
        Self::with_config(HostConfig::default())
    }

    pub fn with_config(config: HostConfig) -> Self {
        init_logging();
        let resolver = Arc::new(InMemoryResolver::with_modules([
            ("config", CONFIG_MODULE),
            ("transform", TRANSFORM_MODULE),
            ("counter", COUNTER_MODULE),
            ("spin", SPIN_MODULE),
            ("closure_value", CLOSURE_VALUE_MODULE),
            ("broken", BROKEN_MODULE),
            ("helpers", HELPERS_MODULE),
            ("secret", "fn key() { 42 }"),
            ("app", IMPORTING_MODULE),
        ]));
        let host = DslHost::new(resolver.clone(), config).expect("valid host config");
        Self { host, resolver }
    }
}

/// Configuration with a single session that keeps module globals.
pub fn reuse_config() -> HostConfig {
    let mut config = HostConfig::default();
    config.execution.pool_size = 1;
    config.execution.reuse_module_state = true;
    config
}

pub fn short_timeout() -> Duration {
    Duration::from_millis(50)
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
