//! Content resolution for script modules.
//!
//! The host never decides where module source lives. A [`ContentResolver`]
//! maps a logical module name to source text; the loader hashes whatever it
//! returns, so hot-reloading is a matter of the resolver returning new content.

use super::error::ResolveError;
use crate::constants::MODULE_EXTENSION;
use log::debug;
use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

/// Supplies script source for a logical module name.
pub trait ContentResolver: Send + Sync {
    /// Returns the current source of `name`.
    fn resolve(&self, name: &str) -> Result<String, ResolveError>;
}

/// Resolves `a/b` to `<root>/a/b.<extension>`.
#[derive(Debug, Clone)]
pub struct FileSystemResolver {
    root: PathBuf,
    extension: String,
}

impl FileSystemResolver {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            extension: MODULE_EXTENSION.to_string(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Module names are relative paths without parent or root components.
    fn module_path(&self, name: &str) -> Result<PathBuf, ResolveError> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(ResolveError::Failure {
                name: name.to_string(),
                message: "module names must be relative paths without '..'".to_string(),
            });
        }

        let mut path = self.root.join(relative);
        path.set_extension(&self.extension);
        Ok(path)
    }
}

impl ContentResolver for FileSystemResolver {
    fn resolve(&self, name: &str) -> Result<String, ResolveError> {
        let path = self.module_path(name)?;
        debug!("Resolving module '{}' from {}", name, path.display());

        std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            IoErrorKind::NotFound => ResolveError::NotFound {
                name: name.to_string(),
            },
            _ => ResolveError::Failure {
                name: name.to_string(),
                message: format!("Failed to read {}: {}", path.display(), e),
            },
        })
    }
}

/// Resolver backed by an in-process bundle of sources.
#[derive(Debug, Default)]
pub struct InMemoryResolver {
    sources: RwLock<HashMap<String, String>>,
}

impl InMemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a resolver from `(name, source)` pairs.
    pub fn with_modules<I, K, V>(modules: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let sources = modules
            .into_iter()
            .map(|(name, source)| (name.into(), source.into()))
            .collect();
        Self {
            sources: RwLock::new(sources),
        }
    }

    /// Adds or replaces a module, returning the previous source.
    pub fn insert(&self, name: impl Into<String>, source: impl Into<String>) -> Option<String> {
        match self.sources.write() {
            Ok(mut sources) => sources.insert(name.into(), source.into()),
            Err(poisoned) => poisoned.into_inner().insert(name.into(), source.into()),
        }
    }

    /// Removes a module, returning its source.
    pub fn remove(&self, name: &str) -> Option<String> {
        match self.sources.write() {
            Ok(mut sources) => sources.remove(name),
            Err(poisoned) => poisoned.into_inner().remove(name),
        }
    }
}

impl ContentResolver for InMemoryResolver {
    fn resolve(&self, name: &str) -> Result<String, ResolveError> {
        let sources = self.sources.read().map_err(|_| ResolveError::Failure {
            name: name.to_string(),
            message: "Failed to acquire module bundle lock".to_string(),
        })?;
        sources
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound {
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_filesystem_resolver_reads_module() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pipelines")).unwrap();
        std::fs::write(dir.path().join("pipelines/clean.rhai"), "fn run() { 1 }").unwrap();

        let resolver = FileSystemResolver::new(dir.path());
        assert_eq!(resolver.resolve("pipelines/clean").unwrap(), "fn run() { 1 }");
    }

    #[test]
    fn test_filesystem_resolver_missing_module() {
        let dir = tempdir().unwrap();
        let resolver = FileSystemResolver::new(dir.path());
        assert_eq!(
            resolver.resolve("absent"),
            Err(ResolveError::NotFound {
                name: "absent".to_string()
            })
        );
    }

    #[test]
    fn test_filesystem_resolver_rejects_traversal() {
        let dir = tempdir().unwrap();
        let resolver = FileSystemResolver::new(dir.path());
        assert!(matches!(
            resolver.resolve("../secrets"),
            Err(ResolveError::Failure { .. })
        ));
        assert!(matches!(
            resolver.resolve("/etc/passwd"),
            Err(ResolveError::Failure { .. })
        ));
        assert!(matches!(resolver.resolve(""), Err(ResolveError::Failure { .. })));
    }

    #[test]
    fn test_custom_extension() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("config.dsl"), "42").unwrap();
        let resolver = FileSystemResolver::new(dir.path()).with_extension("dsl");
        assert_eq!(resolver.resolve("config").unwrap(), "42");
    }

    #[test]
    fn test_in_memory_resolver_hot_reload() {
        let resolver = InMemoryResolver::with_modules([("config", "fn a() { 1 }")]);
        assert_eq!(resolver.resolve("config").unwrap(), "fn a() { 1 }");

        let previous = resolver.insert("config", "fn a() { 2 }");
        assert_eq!(previous.as_deref(), Some("fn a() { 1 }"));
        assert_eq!(resolver.resolve("config").unwrap(), "fn a() { 2 }");

        resolver.remove("config");
        assert!(matches!(
            resolver.resolve("config"),
            Err(ResolveError::NotFound { .. })
        ));
    }
}
