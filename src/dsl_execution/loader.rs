//! Module loader.
//!
//! Resolves a module name to source text, hashes it and returns the cached
//! artifact for that content, compiling on a miss. Compilation only parses;
//! no script code runs while a module is loaded.

use super::cache::{CacheKey, CacheLease, ContentHash, ExecutionCache};
use super::error::{LoadError, SourceLocation, SyntaxDetails};
use super::resolver::ContentResolver;
use super::types::EntryPoint;
use log::{debug, info, warn};
use rhai::{
    Engine, EvalAltResult, FnAccess, Module, ModuleResolver, ParseError, Position, Scope, AST,
};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Compiled, immutable form of a module.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    /// Logical module name
    pub name: String,
    /// Hash of the source this artifact was built from
    pub content_hash: ContentHash,
    /// Parsed script
    pub ast: AST,
    /// Public named functions
    pub entry_points: Vec<EntryPoint>,
    pub compiled_at: SystemTime,
}

impl CompiledModule {
    /// Finds a public function by name and arity.
    pub fn entry_point(&self, name: &str, arity: usize) -> Option<&EntryPoint> {
        self.entry_points
            .iter()
            .find(|ep| ep.name == name && ep.arity() == arity)
    }

    /// Names of all entry points, rendered with their parameters.
    pub fn available(&self) -> Vec<String> {
        self.entry_points.iter().map(ToString::to_string).collect()
    }
}

/// A module ready to execute, pinned in the cache for as long as it lives.
#[derive(Debug)]
pub struct LoadedModule {
    lease: CacheLease<CompiledModule>,
    loaded_at: SystemTime,
}

impl LoadedModule {
    pub fn artifact(&self) -> &Arc<CompiledModule> {
        self.lease.artifact()
    }

    pub fn key(&self) -> &CacheKey {
        self.lease.key()
    }

    pub fn loaded_at(&self) -> SystemTime {
        self.loaded_at
    }
}

impl Deref for LoadedModule {
    type Target = CompiledModule;

    fn deref(&self) -> &CompiledModule {
        &self.lease
    }
}

/// Hex-encoded SHA-256 of `source`.
pub fn content_hash(source: &str) -> ContentHash {
    hex::encode(Sha256::digest(source.as_bytes()))
}

/// Translates a parser error into the host's syntax error.
pub(crate) fn syntax_error(module: &str, error: &ParseError) -> LoadError {
    let position = error.position();
    LoadError::Syntax {
        module: module.to_string(),
        details: SyntaxDetails {
            message: error.err_type().to_string(),
            location: position.line().map(|line| SourceLocation {
                line,
                column: position.position(),
            }),
        },
    }
}

/// Resolves, compiles and caches modules.
pub struct ModuleLoader {
    resolver: Arc<dyn ContentResolver>,
    cache: ExecutionCache<CompiledModule>,
    engine: Engine,
    compile_count: AtomicU64,
}

impl ModuleLoader {
    /// Creates a loader compiling with `engine`, which must carry the same
    /// syntax restrictions as the engines that execute the modules.
    pub fn new(
        resolver: Arc<dyn ContentResolver>,
        cache: ExecutionCache<CompiledModule>,
        engine: Engine,
    ) -> Self {
        Self {
            resolver,
            cache,
            engine,
            compile_count: AtomicU64::new(0),
        }
    }

    /// Loads a module, reusing the cached artifact when the content is unchanged.
    pub fn load(&self, name: &str) -> Result<LoadedModule, LoadError> {
        let source = self.resolver.resolve(name)?;
        let key = CacheKey::new(name, content_hash(&source));

        let lease = self
            .cache
            .get_or_insert(&key, || self.compile(name, &key.content_hash, &source))?;

        Ok(LoadedModule {
            lease,
            loaded_at: SystemTime::now(),
        })
    }

    /// Number of compilations performed by this loader.
    pub fn compile_count(&self) -> u64 {
        self.compile_count.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &ExecutionCache<CompiledModule> {
        &self.cache
    }

    fn compile(
        &self,
        name: &str,
        content_hash: &str,
        source: &str,
    ) -> Result<CompiledModule, LoadError> {
        let start = Instant::now();
        self.compile_count.fetch_add(1, Ordering::SeqCst);

        let mut ast = self
            .engine
            .compile(source)
            .map_err(|e| syntax_error(name, &e))?;
        ast.set_source(name);

        let entry_points = ast
            .iter_functions()
            .filter(|f| matches!(f.access, FnAccess::Public) && !is_closure(f.name))
            .map(|f| EntryPoint {
                name: f.name.to_string(),
                params: f.params.iter().map(|p| p.to_string()).collect(),
            })
            .collect::<Vec<_>>();

        info!(
            "🔧 Compiled module '{}' ({} entry points) in {:?}",
            name,
            entry_points.len(),
            start.elapsed()
        );
        debug!("Module '{}' content hash {}", name, content_hash);

        Ok(CompiledModule {
            name: name.to_string(),
            content_hash: content_hash.to_string(),
            ast,
            entry_points,
            compiled_at: SystemTime::now(),
        })
    }
}

/// Serves `import` statements from an allow-list of hosted modules.
///
/// Imported modules go through the same loader and cache as invoked ones.
/// Their top-level statements run inside the importing call, under its
/// budget.
#[derive(Clone)]
pub struct ModuleImporter {
    loader: Arc<ModuleLoader>,
    allowed: Arc<HashSet<String>>,
}

impl ModuleImporter {
    pub fn new<I, S>(loader: Arc<ModuleLoader>, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            loader,
            allowed: Arc::new(allowed.into_iter().map(Into::into).collect()),
        }
    }

    pub fn is_allowed(&self, module: &str) -> bool {
        self.allowed.contains(module)
    }
}

impl ModuleResolver for ModuleImporter {
    fn resolve(
        &self,
        engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Arc<Module>, Box<EvalAltResult>> {
        if !self.is_allowed(path) {
            warn!("🚫 Refused import of module '{}'", path);
            return Err(EvalAltResult::ErrorModuleNotFound(path.to_string(), pos).into());
        }

        let loaded = self.loader.load(path).map_err(|error| match error {
            LoadError::NotFound { .. } => {
                EvalAltResult::ErrorModuleNotFound(path.to_string(), pos)
            }
            other => EvalAltResult::ErrorInModule(
                path.to_string(),
                EvalAltResult::ErrorRuntime(other.to_string().into(), Position::NONE).into(),
                pos,
            ),
        })?;

        let module = Module::eval_ast_as_new(Scope::new(), &loaded.ast, engine)
            .map_err(|error| EvalAltResult::ErrorInModule(path.to_string(), error, pos))?;
        debug!("Imported module '{}' ({})", path, loaded.key());
        Ok(Arc::new(module))
    }
}

/// Lambdas are compiled into public functions named `anon$<hash>`.
fn is_closure(name: &str) -> bool {
    name.starts_with(CLOSURE_PREFIX)
}

const CLOSURE_PREFIX: &str = "anon$";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl_execution::resolver::InMemoryResolver;

    fn loader(resolver: Arc<InMemoryResolver>) -> ModuleLoader {
        ModuleLoader::new(resolver, ExecutionCache::new(), Engine::new())
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("fn main() { 1 }"), content_hash("fn main() { 1 }"));
        assert_ne!(content_hash("fn main() { 1 }"), content_hash("fn main() { 2 }"));
        assert_eq!(content_hash("").len(), 64);
    }

    #[test]
    fn test_load_lists_public_entry_points() {
        let resolver = Arc::new(InMemoryResolver::with_modules([(
            "calc",
            "fn add(a, b) { a + b }\nprivate fn helper() { 0 }\nfn main() { add(1, 2) }",
        )]));
        let loader = loader(resolver);

        let module = loader.load("calc").unwrap();
        let names: Vec<&str> = module.entry_points.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"add"));
        assert!(names.contains(&"main"));
        assert!(!names.contains(&"helper"));
        assert!(module.entry_point("add", 2).is_some());
        assert!(module.entry_point("add", 1).is_none());
    }

    #[test]
    fn test_closures_are_not_entry_points() {
        let resolver = Arc::new(InMemoryResolver::with_modules([(
            "lambdas",
            "fn evens(items) { items.filter(|x| x % 2 == 0) }\n\
             fn scaled(items, k) { items.map(|x| x * k) }",
        )]));
        let loader = loader(resolver);

        let module = loader.load("lambdas").unwrap();
        let mut available = module.available();
        available.sort();
        assert_eq!(available, vec!["evens(items)", "scaled(items, k)"]);
        assert!(module.entry_points.iter().all(|e| !e.name.starts_with("anon$")));
    }

    #[test]
    fn test_load_reuses_artifact_for_same_content() {
        let resolver = Arc::new(InMemoryResolver::with_modules([("m", "fn main() { 1 }")]));
        let loader = loader(resolver);

        let first = loader.load("m").unwrap();
        let second = loader.load("m").unwrap();
        assert!(Arc::ptr_eq(first.artifact(), second.artifact()));
        assert_eq!(loader.compile_count(), 1);
    }

    #[test]
    fn test_changed_content_recompiles() {
        let resolver = Arc::new(InMemoryResolver::with_modules([("m", "fn main() { 1 }")]));
        let loader = loader(Arc::clone(&resolver));

        let first = loader.load("m").unwrap();
        resolver.insert("m", "fn main() { 2 }");
        let second = loader.load("m").unwrap();

        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(loader.compile_count(), 2);
    }

    #[test]
    fn test_syntax_error_has_location() {
        let resolver = Arc::new(InMemoryResolver::with_modules([(
            "broken",
            "fn main() {\n  let x = ;\n}",
        )]));
        let loader = loader(resolver);

        match loader.load("broken").unwrap_err() {
            LoadError::Syntax { module, details } => {
                assert_eq!(module, "broken");
                assert_eq!(details.location.map(|l| l.line), Some(2));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(loader.cache().stats().live_entries, 0);
    }

    #[test]
    fn test_missing_module() {
        let loader = loader(Arc::new(InMemoryResolver::new()));
        assert_eq!(
            loader.load("absent").unwrap_err(),
            LoadError::NotFound {
                module: "absent".to_string()
            }
        );
    }
}
