use std::sync::Arc;

use tracing::debug;

use crate::{
    config::{ParserOptions, RuntimeConfig},
    error::Result,
    exec::{Scheduler, WorkerPool},
    learn::{CountingTypeLearner, TypeLearner},
    lex::SourceFile,
    module::{FileModuleResolver, ModuleRegistry},
    node::Node,
    parse::Parser,
    resource::{MemoryHandlerFactory, UriRegistry},
    scope::Scope,
    system::Builtins,
    value::Value,
};

/// Collaborators shared by every scope of one runtime.
pub struct Context {
    config: RuntimeConfig,
    pool: WorkerPool,
    scheduler: Scheduler,
    builtins: Builtins,
    modules: ModuleRegistry,
    resources: UriRegistry,
    learner: Box<dyn TypeLearner>,
}

impl Context {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let pool = WorkerPool::new(config.worker_threads)?;
        let modules = ModuleRegistry::new();
        modules.register(Arc::new(FileModuleResolver::default()));
        let resources = UriRegistry::new();
        resources.register(Arc::new(MemoryHandlerFactory::default()));
        Ok(Context {
            config,
            pool,
            scheduler: Scheduler::new(),
            builtins: Builtins::standard(),
            modules,
            resources,
            learner: Box::new(CountingTypeLearner::new()),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn resources(&self) -> &UriRegistry {
        &self.resources
    }

    pub fn learner(&self) -> &dyn TypeLearner {
        self.learner.as_ref()
    }
}

/// An embedded interpreter: a context plus the root scope scripts run in.
pub struct Runtime {
    context: Arc<Context>,
    root: Scope,
}

impl Runtime {
    pub fn new() -> Result<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        let context = Arc::new(Context::new(config)?);
        let root = Scope::root(Arc::clone(&context), "root", None);
        Ok(Runtime { context, root })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn root(&self) -> &Scope {
        &self.root
    }

    pub fn parse(&self, name: &str, text: &str, options: &ParserOptions) -> Result<Arc<Node>> {
        let source = SourceFile::new(name, text);
        Parser::new(&source, self.context.builtins(), options).parse()
    }

    pub fn run(&self, name: &str, text: &str) -> Result<Value> {
        self.run_with(text, &ParserOptions::named(name))
    }

    pub fn run_with(&self, text: &str, options: &ParserOptions) -> Result<Value> {
        let source = SourceFile::new(options.source_name(), text);
        run_in(&self.root, &source, options)
    }

    /// Run a snippet in the root scope.
    pub fn eval(&self, text: &str) -> Result<Value> {
        self.run_with(text, &ParserOptions::default())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.context.scheduler().shutdown();
        self.root.destroy();
    }
}

/// Parse `source` and evaluate it statement by statement in `scope`.
///
/// A parse failure goes through the scope's error handling like any other.
pub fn run_in(scope: &Scope, source: &Arc<SourceFile>, options: &ParserOptions) -> Result<Value> {
    debug!(source = source.name(), scope = scope.id(), "parsing");
    let script = match Parser::new(source, scope.context().builtins(), options).parse() {
        Ok(script) => script,
        Err(err) => return scope.handle_error(err),
    };
    debug!(source = source.name(), "evaluating");
    script.fix_deep(scope, options.parallel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn eval_returns_the_last_statement() {
        let rt = Runtime::new().unwrap();
        assert_eq!(rt.eval("a = 2; a * 21").unwrap(), Value::Int(42));
    }

    #[test]
    fn parse_errors_propagate_by_default() {
        let rt = Runtime::new().unwrap();
        let err = rt.eval("a = (1 + ").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
        assert!(err.is_unhandled());
    }

    #[test]
    fn parse_does_not_evaluate() {
        let rt = Runtime::new().unwrap();
        let script = rt
            .parse("snippet", "x = 1", &ParserOptions::default())
            .unwrap();
        assert_eq!(script.evaluations(), 0);
        assert!(!rt.root().has("x"));
    }
}
