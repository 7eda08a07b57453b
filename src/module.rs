use std::{path::PathBuf, sync::Arc};

use dashmap::DashMap;
use indexmap::IndexMap;
use tracing::debug;

use crate::{
    config::ParserOptions,
    error::{Result, ScriptError},
    lex::SourceFile,
    runtime::{self, Context},
    scope::{Binding, Scope},
    value::Value,
};

/// Anything that can be called with a list of values.
pub trait Pipeable: Send + Sync {
    fn invoke(&self, values: &[Value]) -> Result<Value>;

    fn describe(&self) -> String {
        "<function>".to_string()
    }
}

impl<F> Pipeable for F
where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync,
{
    fn invoke(&self, values: &[Value]) -> Result<Value> {
        self(values)
    }
}

/// Turns the path part of `scheme:path` into something callable.
///
/// The returned pipeable receives a single map of named parameters.
pub trait ModuleResolver: Send + Sync {
    fn scheme(&self) -> &str;

    fn resolve(&self, path: &str, scope: &Scope) -> Result<Arc<dyn Pipeable>>;
}

#[derive(Default)]
pub struct ModuleRegistry {
    resolvers: DashMap<String, Arc<dyn ModuleResolver>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, resolver: Arc<dyn ModuleResolver>) {
        debug!(scheme = resolver.scheme(), "module resolver registered");
        self.resolvers
            .insert(resolver.scheme().to_string(), resolver);
    }

    pub fn resolve(&self, uri: &str, scope: &Scope) -> Result<Arc<dyn Pipeable>> {
        let (scheme, path) = uri.split_once(':').ok_or_else(|| {
            ScriptError::module(format!("`{uri}` is not a module uri; expected scheme:path"))
        })?;
        let resolver = self
            .resolvers
            .get(scheme)
            .map(|resolver| Arc::clone(resolver.value()))
            .ok_or_else(|| ScriptError::module(format!("no resolver for scheme `{scheme}`")))?;
        resolver.resolve(path, scope).map_err(|err| {
            if err.kind() == crate::error::ErrorKind::ModuleResolution {
                err
            } else {
                ScriptError::module(format!("failed to resolve `{uri}`: {err}"))
            }
        })
    }
}

/// Loads `file:path` scripts relative to the working directory.
pub struct FileModuleResolver {
    base: PathBuf,
}

impl FileModuleResolver {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        FileModuleResolver { base: base.into() }
    }
}

impl Default for FileModuleResolver {
    fn default() -> Self {
        FileModuleResolver::new(".")
    }
}

impl ModuleResolver for FileModuleResolver {
    fn scheme(&self) -> &str {
        "file"
    }

    fn resolve(&self, path: &str, scope: &Scope) -> Result<Arc<dyn Pipeable>> {
        let full = self.base.join(path);
        let text = std::fs::read_to_string(&full).map_err(|e| {
            ScriptError::module(format!("cannot read module {}: {e}", full.display()))
        })?;
        Ok(Arc::new(ScriptModule {
            source: SourceFile::new(full.display().to_string(), text),
            context: Arc::clone(scope.context()),
        }))
    }
}

/// A script run in a fresh root scope each time it is invoked.
pub struct ScriptModule {
    source: Arc<SourceFile>,
    context: Arc<Context>,
}

impl ScriptModule {
    pub fn new(source: Arc<SourceFile>, context: Arc<Context>) -> Self {
        ScriptModule { source, context }
    }
}

impl Pipeable for ScriptModule {
    fn invoke(&self, values: &[Value]) -> Result<Value> {
        let scope = Scope::root(
            Arc::clone(&self.context),
            "module",
            Some(Arc::clone(&self.source)),
        );
        if let Some(Value::Map(params)) = values.first() {
            for (key, value) in params.iter() {
                scope.set(key, value.clone(), Binding::default())?;
            }
        }
        let options = ParserOptions::named(self.source.name());
        runtime::run_in(&scope, &self.source, &options)?;
        let exports: IndexMap<String, Value> = scope
            .exports()
            .into_iter()
            .map(|(key, value)| Ok((key, value.fix_deep(false)?)))
            .collect::<Result<_>>()?;
        Ok(Value::map(exports))
    }

    fn describe(&self) -> String {
        format!("<module {}>", self.source.name())
    }
}
